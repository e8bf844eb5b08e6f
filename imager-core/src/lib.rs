//! Core engine for building single-board-computer hotspot disk images:
//! a content-addressed download cache with a layered eviction policy, an
//! external-downloader client, a content orchestrator, and a loop-device
//! partition/filesystem state machine, wired together by a linear build
//! driver.
//!
//! This crate has no CLI of its own — see the `imager-cli` binary crate
//! for the `offspot-imager` command-line surface.

pub mod cache;
pub mod config_writer;
pub mod driver;
pub mod engine;
pub mod error;
pub mod layout;
pub mod orchestrator;
pub mod policy;
pub mod recipe;
pub mod units;

pub use driver::{build, BuildOptions};
pub use error::{BuildError, Result};
pub use recipe::Recipe;
