//! Unified download status reporting (§4.D).

/// Lifecycle state of one download item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    /// Queued with the engine, not yet started.
    Waiting,
    /// Actively transferring.
    Active,
    /// Finished successfully.
    Complete,
    /// Failed; see the accompanying error message.
    Error,
    /// Removed before completion.
    Removed,
}

/// A point-in-time snapshot of one item's download progress.
///
/// `total` takes the first non-zero value seen among the recipe-declared
/// size, the engine-reported size, and an HTTP HEAD response, and never
/// regresses once set — later revisions only widen it.
#[derive(Debug, Clone)]
pub struct DownloadStatus {
    /// Bytes transferred so far.
    pub bytes_done: u64,
    /// Best-known total size, if any source has reported one yet.
    pub total: Option<u64>,
    /// Instantaneous transfer speed in bytes/sec, if reported.
    pub speed: Option<u64>,
    /// Current lifecycle state.
    pub state: DownloadState,
    /// Error message, set only when `state == Error`.
    pub error: Option<String>,
    /// When the item was submitted to the engine.
    pub started_on: chrono::DateTime<chrono::Utc>,
    /// When the item reached `Complete` or `Error`, if it has.
    pub completed_on: Option<chrono::DateTime<chrono::Utc>>,
}

/// Widens `total` with `candidate`, keeping the larger of the two and never
/// regressing once a non-zero value is known.
#[must_use]
pub fn widen(total: Option<u64>, candidate: Option<u64>) -> Option<u64> {
    match candidate {
        Some(c) if c > 0 && total.is_none_or(|t| c > t) => Some(c),
        _ => total,
    }
}

impl DownloadStatus {
    /// Folds a newly observed `total` candidate in without ever regressing
    /// a previously known value.
    pub fn widen_total(&mut self, candidate: Option<u64>) {
        self.total = widen(self.total, candidate);
    }
}
