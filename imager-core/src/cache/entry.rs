//! The metadata record tracked for one cached blob.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::policy::Class;

/// One entry in the cache index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Canonicalised cache key (see [`super::key`]).
    pub key: String,
    /// Which class this entry belongs to.
    pub class: Class,
    /// The original source (URL or OCI reference) this entry was fetched from.
    pub source: String,
    /// Logical identifier for `keep_identified_versions` matching, if known.
    pub identifier: Option<String>,
    /// Version string for natural-sort comparison, if known.
    pub version: Option<String>,
    /// Size of the blob in bytes.
    pub size: u64,
    /// Hex-encoded sha256 of the blob, if verified.
    pub checksum: Option<String>,
    /// When this entry was first admitted.
    pub added_on: chrono::DateTime<chrono::Utc>,
    /// When this entry was last served by `lookup`.
    pub last_used: chrono::DateTime<chrono::Utc>,
    /// When this entry's freshness was last confirmed (revalidation).
    pub checked_on: chrono::DateTime<chrono::Utc>,
}

impl CacheEntry {
    /// The blob's on-disk path, sharded by the first two byte-pairs of the key.
    #[must_use]
    pub fn blob_path(&self, cache_root: &std::path::Path) -> PathBuf {
        super::key::blob_path(cache_root, &self.key)
    }
}
