//! Download engine client (component D, §4.D): drives an external aria2
//! process over its JSON-RPC interface.

pub mod rpc;
pub mod status;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{json, Value};
pub use status::{widen, DownloadState, DownloadStatus};

/// One item submitted to the engine.
#[derive(Debug, Clone)]
pub struct DownloadItem {
    /// Source URL.
    pub uri: String,
    /// Destination path on disk.
    pub out_path: PathBuf,
    /// Expected `(algorithm, hex digest)`, verified client-side on completion.
    pub checksum: Option<(String, String)>,
    /// Recipe-declared size, if known in advance.
    pub expected_size: Option<u64>,
    /// Extra request headers (`"Name: value"`), forwarded to aria2 verbatim.
    pub headers: Vec<String>,
}

/// Errors raised by the download engine client.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The engine process could not be spawned.
    #[error("failed to start download engine: {0}")]
    Spawn(#[source] std::io::Error),
    /// The engine's RPC endpoint never became reachable.
    #[error("download engine did not become reachable")]
    Unavailable,
    /// An RPC call to the engine failed.
    #[error(transparent)]
    Rpc(#[from] rpc::Error),
    /// The downloaded payload's checksum did not match the recipe.
    #[error("checksum mismatch for {uri}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// The item's source URL.
        uri: String,
        /// Expected hex digest.
        expected: String,
        /// Actual hex digest.
        actual: String,
    },
    /// All retries for an item were exhausted.
    #[error("download of {0} failed after retries")]
    RetriesExhausted(String),
    /// The source answered with a 4xx status; not retried.
    #[error("{uri}: fatal HTTP status {status}")]
    HttpStatus {
        /// The item's source URL.
        uri: String,
        /// The HTTP status code.
        status: u16,
    },
    /// An HTTP HEAD/GET request (used for reachability checks) failed.
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    /// I/O error while verifying a completed download.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

const STARTUP_RETRIES: u32 = 8;
const STARTUP_BACKOFF: Duration = Duration::from_millis(100);
const POLL_INTERVAL: Duration = Duration::from_millis(1000);
const DEFAULT_RETRIES: u32 = 3;

/// A running aria2 process plus the RPC transport addressing it.
#[derive(Debug)]
pub struct EngineClient {
    child: tokio::process::Child,
    transport: rpc::Transport,
    http: reqwest::Client,
}

impl EngineClient {
    /// Starts `aria2c` in RPC-only mode on an ephemeral ("0" → OS-chosen is
    /// not supported by aria2, so a free port is probed beforehand) port
    /// with a freshly generated secret token, and waits until it answers.
    pub async fn start(rpc_port: u16, secret: &str) -> Result<Self, Error> {
        let child = tokio::process::Command::new("aria2c")
            .arg("--enable-rpc")
            .arg("--rpc-listen-all=false")
            .arg(format!("--rpc-listen-port={rpc_port}"))
            .arg(format!("--rpc-secret={secret}"))
            .arg("--quiet=true")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(Error::Spawn)?;

        let transport = rpc::Transport::new(rpc_port, secret.to_owned());
        let http = reqwest::Client::new();
        let mut backoff = STARTUP_BACKOFF;
        for _ in 0..STARTUP_RETRIES {
            if transport.call("aria2.getVersion", vec![]).await.is_ok() {
                return Ok(Self { child, transport, http });
            }
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
        Err(Error::Unavailable)
    }

    /// Submits one item via `aria2.addUri`, returning its GID handle.
    pub async fn add(&self, item: &DownloadItem) -> Result<String, Error> {
        let dir = item
            .out_path
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let filename = item
            .out_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut options = serde_json::Map::new();
        options.insert("dir".into(), json!(dir));
        options.insert("out".into(), json!(filename));
        if !item.headers.is_empty() {
            options.insert("header".into(), json!(item.headers));
        }

        let result = self
            .transport
            .call("aria2.addUri", vec![json!([item.uri]), Value::Object(options)])
            .await?;
        Ok(result.as_str().unwrap_or_default().to_owned())
    }

    /// Polls `aria2.tellStatus` for `gid` and maps it onto [`DownloadStatus`],
    /// widening `total` with `seed_total` (the recipe-declared or HEAD-derived
    /// size) so it never regresses below what was already known.
    pub async fn tell_status(
        &self,
        gid: &str,
        started_on: chrono::DateTime<chrono::Utc>,
        seed_total: Option<u64>,
    ) -> Result<DownloadStatus, Error> {
        let keys = json!([
            "status", "totalLength", "completedLength", "downloadSpeed", "errorMessage"
        ]);
        let result = self
            .transport
            .call("aria2.tellStatus", vec![json!(gid), keys])
            .await?;

        let get_str = |k: &str| result.get(k).and_then(Value::as_str).unwrap_or_default();
        let get_u64 = |k: &str| get_str(k).parse::<u64>().ok();

        let state = match get_str("status") {
            "active" => DownloadState::Active,
            "waiting" | "paused" => DownloadState::Waiting,
            "complete" => DownloadState::Complete,
            "removed" => DownloadState::Removed,
            _ => DownloadState::Error,
        };
        let completed_on = matches!(state, DownloadState::Complete | DownloadState::Error)
            .then(chrono::Utc::now);

        let mut status = DownloadStatus {
            bytes_done: get_u64("completedLength").unwrap_or(0),
            total: get_u64("totalLength").filter(|t| *t > 0),
            speed: get_u64("downloadSpeed"),
            state,
            error: (!get_str("errorMessage").is_empty()).then(|| get_str("errorMessage").to_owned()),
            started_on,
            completed_on,
        };
        status.widen_total(seed_total);
        Ok(status)
    }

    /// Polls `gid` to completion at [`POLL_INTERVAL`] cadence, calling
    /// `on_progress` after every poll, then verifies the checksum if one
    /// was declared and the engine did not already verify it.
    pub async fn wait_for(
        &self,
        item: &DownloadItem,
        gid: &str,
        started_on: chrono::DateTime<chrono::Utc>,
        seed_total: Option<u64>,
        mut on_progress: impl FnMut(&DownloadStatus),
    ) -> Result<(), Error> {
        loop {
            let status = self.tell_status(gid, started_on, seed_total).await?;
            on_progress(&status);
            match status.state {
                DownloadState::Complete => break,
                DownloadState::Error | DownloadState::Removed => {
                    return Err(Error::RetriesExhausted(item.uri.clone()));
                }
                DownloadState::Active | DownloadState::Waiting => {
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }

        if let Some((algo, expected)) = &item.checksum {
            verify_checksum(&item.out_path, algo, expected, &item.uri)?;
        }
        Ok(())
    }

    /// Submits, polls to completion, and verifies `item`, retrying up to
    /// [`DEFAULT_RETRIES`] times on transient (non-checksum) failures.
    ///
    /// A `HEAD` probe runs once before the first attempt: a 4xx response is
    /// fatal for this item (§4.D) and is returned immediately without
    /// retrying, while a successful response's `Content-Length` seeds
    /// `total` alongside the recipe-declared size.
    pub async fn fetch(
        &self,
        item: &DownloadItem,
        mut on_progress: impl FnMut(&DownloadStatus),
    ) -> Result<(), Error> {
        let head = self.http.head(&item.uri).send().await.ok();
        if let Some(resp) = &head {
            if resp.status().is_client_error() {
                return Err(Error::HttpStatus {
                    uri: item.uri.clone(),
                    status: resp.status().as_u16(),
                });
            }
        }
        let seed_total = widen(item.expected_size, head.as_ref().and_then(reqwest::Response::content_length));

        let mut last_err = None;
        for attempt in 0..DEFAULT_RETRIES {
            let started_on = chrono::Utc::now();
            let gid = self.add(item).await?;
            match self
                .wait_for(item, &gid, started_on, seed_total, &mut on_progress)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e @ Error::ChecksumMismatch { .. }) => return Err(e),
                Err(e) => {
                    tracing::warn!(attempt, uri = %item.uri, "download attempt failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::RetriesExhausted(item.uri.clone())))
    }

    /// Shuts the engine down cleanly, falling back to `SIGKILL` on timeout.
    pub async fn shutdown(mut self) -> Result<(), Error> {
        let graceful = self.transport.call("aria2.shutdown", vec![]);
        let needs_kill = match tokio::time::timeout(Duration::from_secs(5), graceful).await {
            Ok(Ok(_)) => false,
            Ok(Err(_)) | Err(_) => true,
        };
        if needs_kill {
            let _ = self.child.start_kill();
        }
        let _ = self.child.wait().await;
        Ok(())
    }
}

/// The subset of [`EngineClient`]'s surface the orchestrator depends on.
///
/// Exists so tests can drive the orchestrator against a stub that never
/// spawns a real `aria2c` process.
pub trait Downloader {
    /// Submits, polls to completion, and verifies one item.
    async fn fetch(
        &self,
        item: &DownloadItem,
        on_progress: impl FnMut(&DownloadStatus),
    ) -> Result<(), Error>;
}

impl Downloader for EngineClient {
    async fn fetch(&self, item: &DownloadItem, on_progress: impl FnMut(&DownloadStatus)) -> Result<(), Error> {
        EngineClient::fetch(self, item, on_progress).await
    }
}

fn verify_checksum(path: &Path, algo: &str, expected: &str, uri: &str) -> Result<(), Error> {
    use sha2::{Digest, Sha256};
    if !algo.eq_ignore_ascii_case("sha256") {
        return Ok(());
    }
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let actual = hex::encode(hasher.finalize());
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(Error::ChecksumMismatch {
            uri: uri.to_owned(),
            expected: expected.to_owned(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_checksum_detects_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"hello").unwrap();
        let err = verify_checksum(&path, "sha256", "deadbeef", "http://x").unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
    }

    #[test]
    fn verify_checksum_accepts_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"hello").unwrap();
        let digest = {
            use sha2::{Digest, Sha256};
            let mut h = Sha256::new();
            h.update(b"hello");
            hex::encode(h.finalize())
        };
        verify_checksum(&path, "sha256", &digest, "http://x").unwrap();
    }
}
