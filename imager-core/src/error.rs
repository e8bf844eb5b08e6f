//! Top-level error taxonomy for the image builder.
//!
//! Each subsystem (`cache`, `engine`, `layout`, ...) defines its own
//! `thiserror`-derived error enum close to the code that raises it; this
//! module composes them into [`BuildError`], which additionally tags every
//! failure with the exit code it should map to on the CLI (§6/§7 of the
//! design).

use crate::{cache, engine, layout, units};

/// Alias for `Result<T, BuildError>`.
pub type Result<T> = std::result::Result<T, BuildError>;

/// Top-level error taxonomy surfaced by the build driver.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BuildError {
    /// The recipe failed validation, or CLI arguments conflict.
    #[error("invalid input: {0}")]
    Input(String),

    /// A URL could not be resolved, or HEAD/GET reported inconsistent metadata.
    #[error("resolution failed: {0}")]
    Resolution(String),

    /// Download failed after retries, checksum mismatch, or size mismatch.
    #[error(transparent)]
    Download(#[from] engine::Error),

    /// Cache policy, lock, or storage error.
    #[error(transparent)]
    Cache(#[from] cache::Error),

    /// Partition table, loop device, mount, or filesystem-resize error.
    #[error(transparent)]
    Layout(#[from] layout::Error),

    /// A required subprocess tool was missing, crashed, or returned non-zero.
    #[error("tool error: {0}")]
    Tool(String),

    /// The build was cancelled by the user.
    #[error("build cancelled")]
    Cancelled,
}

impl From<units::Error> for BuildError {
    fn from(value: units::Error) -> Self {
        Self::Input(value.to_string())
    }
}

impl BuildError {
    /// Maps this error to the process exit code documented for the CLI.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Input(_) => 1,
            Self::Download(_) => 2,
            Self::Layout(_) => 3,
            Self::Cache(_) => 4,
            Self::Tool(_) => 3,
            Self::Resolution(_) => 2,
            Self::Cancelled => 130,
        }
    }
}
