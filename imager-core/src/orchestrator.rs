//! Content orchestrator (component E, §4.E): turns a [`crate::recipe::Recipe`]
//! plus a [`crate::cache::Store`] into a manifest of on-disk artifacts ready
//! to be placed inside the image.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine as _;
use tokio::sync::{Mutex, OnceCell};

use crate::cache::{self, Store};
use crate::engine::{DownloadItem, DownloadStatus, Downloader};
use crate::policy::Class;
use crate::recipe::{FileEntry, Recipe, Via};

/// How often [`BuildProgress`] is reported to the caller's callback.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// A caller-supplied sink for [`BuildProgress`] snapshots.
pub type ProgressCallback = Arc<dyn Fn(&BuildProgress) + Send + Sync>;

/// Aggregate progress across every item currently (or previously) submitted
/// to the download engine during this build (§4.E step 4).
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildProgress {
    /// Bytes transferred across all items so far.
    pub bytes_done: u64,
    /// Combined total size, known only once every tracked item has reported one.
    pub total: Option<u64>,
    /// Combined instantaneous speed in bytes/sec, summed across active items.
    pub speed: Option<u64>,
}

impl BuildProgress {
    /// Overall completion percent, if `total` is known and non-zero.
    #[must_use]
    pub fn percent(&self) -> Option<f64> {
        self.total
            .filter(|t| *t > 0)
            .map(|t| (self.bytes_done as f64 / t as f64) * 100.0)
    }
}

#[derive(Debug, Default)]
struct ProgressState {
    items: HashMap<String, DownloadStatus>,
    last_emit: Option<Instant>,
}

/// Errors raised while planning, fetching, or post-processing content.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Filesystem I/O failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// An HTTP HEAD/GET request failed.
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    /// The download engine reported a failure.
    #[error(transparent)]
    Engine(#[from] crate::engine::Error),
    /// The cache store reported a failure.
    #[error(transparent)]
    Cache(#[from] cache::Error),
    /// An archive's expanded contents exceeded its declared `size`.
    #[error("{path}: expanded to {actual} bytes, exceeding declared size {declared}")]
    ArchiveTooLarge {
        /// The file entry's destination path.
        path: PathBuf,
        /// Declared (maximum) size in bytes.
        declared: u64,
        /// Measured size after expansion.
        actual: u64,
    },
    /// Inline `content` was neither valid UTF-8 text nor valid `base64:`.
    #[error("invalid inline content for {0}: {1}")]
    InvalidContent(PathBuf, String),
    /// A URL's reachability check failed during `--check`.
    #[error("{0}: not reachable ({1})")]
    Unreachable(String, String),
    /// A concurrent fetch for the same cache key failed.
    #[error("fetch failed: {0}")]
    Fetch(String),
}

/// One network work item planned from the recipe (§4.E step 1).
#[derive(Debug, Clone)]
struct PlannedItem {
    class: Class,
    source: String,
    dest: PathBuf,
    declared_size: Option<u64>,
    checksum: Option<(String, String)>,
    identifier: Option<String>,
    version: Option<String>,
    via: Via,
}

/// The result of running the orchestrator against a recipe.
#[derive(Debug, Default)]
pub struct Manifest {
    /// Files placed under the data partition, as `(recipe `to`, on-disk path)`.
    pub files: Vec<(PathBuf, PathBuf)>,
    /// Extracted OCI image tarball directories.
    pub oci_images: Vec<PathBuf>,
}

type Inflight = Mutex<HashMap<String, Arc<OnceCell<Result<PathBuf, String>>>>>;

/// Orchestrates content resolution, download, and post-processing for one
/// build.
pub struct Orchestrator<'a, E: Downloader> {
    cache: &'a Store,
    engine: &'a E,
    build_dir: PathBuf,
    http: reqwest::Client,
    inflight: Inflight,
    progress: parking_lot::Mutex<ProgressState>,
    on_progress: Option<ProgressCallback>,
}

impl<'a, E: Downloader> Orchestrator<'a, E> {
    /// Builds an orchestrator writing staged artifacts under `build_dir`,
    /// reporting aggregate download progress to `on_progress` (if any) at
    /// most once per second.
    #[must_use]
    pub fn new(
        cache: &'a Store,
        engine: &'a E,
        build_dir: PathBuf,
        on_progress: Option<ProgressCallback>,
    ) -> Self {
        Self {
            cache,
            engine,
            build_dir,
            http: reqwest::Client::new(),
            inflight: Mutex::new(HashMap::new()),
            progress: parking_lot::Mutex::new(ProgressState::default()),
            on_progress,
        }
    }

    /// Folds one item's status into the running aggregate, invoking the
    /// progress callback if one is set and the rate limit allows it.
    fn report_progress(&self, source: &str, status: &DownloadStatus) {
        let Some(callback) = &self.on_progress else {
            return;
        };
        let snapshot = {
            let mut state = self.progress.lock();
            state.items.insert(source.to_owned(), status.clone());
            let due = state
                .last_emit
                .is_none_or(|t| t.elapsed() >= PROGRESS_INTERVAL);
            if !due {
                return;
            }
            state.last_emit = Some(Instant::now());
            let bytes_done = state.items.values().map(|s| s.bytes_done).sum();
            let total = state
                .items
                .values()
                .all(|s| s.total.is_some())
                .then(|| state.items.values().filter_map(|s| s.total).sum());
            let speed = state.items.values().filter_map(|s| s.speed).reduce(|a, b| a + b);
            BuildProgress { bytes_done, total, speed }
        };
        callback(&snapshot);
    }

    fn plan(recipe: &Recipe) -> Vec<PlannedItem> {
        let mut items = Vec::new();
        for oci in &recipe.oci_images {
            if let Some(url) = &oci.url {
                items.push(PlannedItem {
                    class: Class::OciImages,
                    source: url.clone(),
                    dest: PathBuf::from(format!("oci/{}.tar", oci.ident.replace('/', "_"))),
                    declared_size: Some(oci.filesize),
                    checksum: None,
                    identifier: Some(oci.ident.clone()),
                    version: None,
                    via: Via::Direct,
                });
            }
        }
        for f in &recipe.files {
            if let Some(url) = &f.url {
                items.push(PlannedItem {
                    class: Class::Files,
                    source: url.clone(),
                    dest: f.to.clone(),
                    declared_size: f.size,
                    checksum: f.checksum.as_ref().map(|c| (c.algo.clone(), c.hex.clone())),
                    identifier: None,
                    version: None,
                    via: f.via,
                });
            }
        }
        items
    }

    /// Issues `HEAD` requests for every network item to validate
    /// reachability and size, without downloading anything (`--check`).
    pub async fn dry_check(&self, recipe: &Recipe) -> Result<(), Error> {
        for item in Self::plan(recipe) {
            let resp = self
                .http
                .head(&item.source)
                .send()
                .await
                .map_err(|e| Error::Unreachable(item.source.clone(), e.to_string()))?;
            if !resp.status().is_success() {
                return Err(Error::Unreachable(
                    item.source.clone(),
                    resp.status().to_string(),
                ));
            }
        }
        Ok(())
    }

    async fn resolve_one(&self, item: &PlannedItem) -> Result<PathBuf, Error> {
        let key = cache::key::canonicalize(&item.source);

        let cell = {
            let mut guard = self.inflight.lock().await;
            guard
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = cell
            .get_or_init(|| async { self.fetch_and_admit(item).await.map_err(|e| e.to_string()) })
            .await
            .clone();

        result.map_err(Error::Fetch)
    }

    async fn fetch_and_admit(&self, item: &PlannedItem) -> Result<PathBuf, Error> {
        match self.cache.lookup(item.class, &item.source)? {
            cache::LookupResult::Hit(entry) => Ok(entry.blob_path(self.cache.root())),
            cache::LookupResult::StaleHit(entry) => {
                // Revalidate with a HEAD: any success refreshes `checked_on`
                // and reuses the cached blob; anything else re-downloads.
                match self.http.head(&item.source).send().await {
                    Ok(resp) if resp.status().is_success() => {
                        self.cache.mark_checked(&entry.key)?;
                        Ok(entry.blob_path(self.cache.root()))
                    }
                    _ => self.download_and_admit(item).await,
                }
            }
            cache::LookupResult::Miss | cache::LookupResult::Ignored => {
                self.download_and_admit(item).await
            }
        }
    }

    async fn download_and_admit(&self, item: &PlannedItem) -> Result<PathBuf, Error> {
        let tmp_dir = self.build_dir.join("download-tmp");
        tokio::fs::create_dir_all(&tmp_dir).await?;
        let tmp_path = tmp_dir.join(cache::key::digest(&key_canon(item)));

        let download_item = DownloadItem {
            uri: item.source.clone(),
            out_path: tmp_path.clone(),
            checksum: item.checksum.clone(),
            expected_size: item.declared_size,
            headers: Vec::new(),
        };
        let source = item.source.clone();
        self.engine
            .fetch(&download_item, |status: &DownloadStatus| {
                self.report_progress(&source, status);
            })
            .await?;

        let size = tokio::fs::metadata(&tmp_path).await?.len();
        match self.cache.admit(
            item.class,
            &item.source,
            &tmp_path,
            size,
            item.checksum.as_ref().map(|(_, hex)| hex.clone()),
            item.identifier.clone(),
            item.version.clone(),
        ) {
            Ok(cache::AdmitOutcome::Admitted(entry)) => Ok(entry.blob_path(self.cache.root())),
            // Admission failure is non-fatal: serve straight from the temp path.
            Ok(cache::AdmitOutcome::Rejected(_)) | Err(_) => Ok(tmp_path),
        }
    }

    /// Runs the full pipeline: plan, resolve (cache or download), and
    /// post-process every item, producing a [`Manifest`].
    pub async fn run(&self, recipe: &Recipe) -> Result<Manifest, Error> {
        let mut manifest = Manifest::default();

        for oci in &recipe.oci_images {
            let Some(_url) = &oci.url else { continue };
            let item = PlannedItem {
                class: Class::OciImages,
                source: oci.url.clone().unwrap_or_default(),
                dest: PathBuf::from(format!("oci/{}.tar", oci.ident.replace('/', "_"))),
                declared_size: Some(oci.filesize),
                checksum: None,
                identifier: Some(oci.ident.clone()),
                version: None,
                via: Via::Direct,
            };
            let blob = self.resolve_one(&item).await?;
            let extract_dir = self.build_dir.join("oci").join(oci.ident.replace('/', "_"));
            tokio::fs::create_dir_all(&extract_dir).await?;
            let blob_owned = blob.clone();
            let dir_owned = extract_dir.clone();
            tokio::task::spawn_blocking(move || extract_tar(&blob_owned, &dir_owned))
                .await
                .map_err(|e| Error::InvalidContent(extract_dir.clone(), e.to_string()))??;
            manifest.oci_images.push(extract_dir);
        }

        for f in &recipe.files {
            let placed = self.place_file(f).await?;
            manifest.files.push((f.to.clone(), placed));
        }

        Ok(manifest)
    }

    async fn place_file(&self, f: &FileEntry) -> Result<PathBuf, Error> {
        let dest = self.build_dir.join("files").join(
            f.to.strip_prefix("/").unwrap_or(&f.to),
        );
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if let Some(content) = &f.content {
            let bytes = decode_inline_content(content)
                .map_err(|e| Error::InvalidContent(f.to.clone(), e))?;
            tokio::fs::write(&dest, &bytes).await?;
            return Ok(dest);
        }

        let item = PlannedItem {
            class: Class::Files,
            source: f.url.clone().unwrap_or_default(),
            dest: f.to.clone(),
            declared_size: f.size,
            checksum: f.checksum.as_ref().map(|c| (c.algo.clone(), c.hex.clone())),
            identifier: None,
            version: None,
            via: f.via,
        };
        let blob = self.resolve_one(&item).await?;

        match f.via {
            Via::Direct => {
                tokio::fs::copy(&blob, &dest).await?;
            }
            via => {
                tokio::fs::create_dir_all(&dest).await?;
                let blob_owned = blob.clone();
                let dest_owned = dest.clone();
                let measured = tokio::task::spawn_blocking(move || {
                    extract_archive(&blob_owned, &dest_owned, via)
                })
                .await
                .map_err(|e| Error::InvalidContent(dest.clone(), e.to_string()))??;
                if let Some(declared) = f.size {
                    if measured > declared {
                        return Err(Error::ArchiveTooLarge {
                            path: f.to.clone(),
                            declared,
                            actual: measured,
                        });
                    }
                }
            }
        }
        Ok(dest)
    }
}

fn key_canon(item: &PlannedItem) -> String {
    cache::key::canonicalize(&item.source)
}

/// Decodes inline recipe content: `base64:`-tagged payloads are decoded,
/// everything else is treated as literal UTF-8 text.
fn decode_inline_content(content: &str) -> Result<Vec<u8>, String> {
    if let Some(b64) = content.strip_prefix("base64:") {
        base64::engine::general_purpose::STANDARD
            .decode(b64)
            .map_err(|e| e.to_string())
    } else {
        Ok(content.as_bytes().to_vec())
    }
}

fn extract_tar(archive: &Path, dest: &Path) -> Result<u64, Error> {
    let file = std::fs::File::open(archive)?;
    let mut a = tar::Archive::new(file);
    a.unpack(dest)?;
    Ok(dir_size(dest))
}

fn extract_archive(archive: &Path, dest: &Path, via: Via) -> Result<u64, Error> {
    let file = std::fs::File::open(archive)?;
    match via {
        Via::Tar => {
            tar::Archive::new(file).unpack(dest)?;
        }
        Via::Gztar => {
            tar::Archive::new(flate2::read::GzDecoder::new(file)).unpack(dest)?;
        }
        Via::Bztar => {
            tar::Archive::new(bzip2::read::BzDecoder::new(file)).unpack(dest)?;
        }
        Via::Xztar => {
            tar::Archive::new(xz2::read::XzDecoder::new(file)).unpack(dest)?;
        }
        Via::Zip => {
            let mut z = zip::ZipArchive::new(file)
                .map_err(|e| Error::InvalidContent(dest.to_owned(), e.to_string()))?;
            for i in 0..z.len() {
                let mut entry = z
                    .by_index(i)
                    .map_err(|e| Error::InvalidContent(dest.to_owned(), e.to_string()))?;
                let Some(relative) = entry.enclosed_name() else {
                    continue;
                };
                let out_path = dest.join(relative);
                if entry.is_dir() {
                    std::fs::create_dir_all(&out_path)?;
                } else {
                    if let Some(parent) = out_path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    let mut out_file = std::fs::File::create(&out_path)?;
                    std::io::copy(&mut entry, &mut out_file)?;
                }
            }
        }
        Via::Direct => unreachable!("direct files never reach extract_archive"),
    }
    Ok(dir_size(dest))
}

fn dir_size(path: &Path) -> u64 {
    walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::policy::Class;

    #[test]
    fn decode_inline_plain_text() {
        assert_eq!(decode_inline_content("hello").unwrap(), b"hello");
    }

    #[test]
    fn decode_inline_base64() {
        let encoded = format!("base64:{}", base64::engine::general_purpose::STANDARD.encode(b"hi"));
        assert_eq!(decode_inline_content(&encoded).unwrap(), b"hi");
    }

    #[test]
    fn decode_inline_invalid_base64_rejected() {
        assert!(decode_inline_content("base64:not-valid-b64!!").is_err());
    }

    /// A stub download engine: "downloads" by writing a fixed payload to
    /// `out_path`, without spawning `aria2c` or touching the network.
    #[derive(Default)]
    struct StubEngine {
        payload: &'static [u8],
        calls: AtomicUsize,
    }

    impl Downloader for StubEngine {
        async fn fetch(
            &self,
            item: &DownloadItem,
            mut on_progress: impl FnMut(&DownloadStatus),
        ) -> Result<(), crate::engine::Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            on_progress(&DownloadStatus {
                bytes_done: self.payload.len() as u64,
                total: Some(self.payload.len() as u64),
                speed: None,
                state: crate::engine::DownloadState::Complete,
                error: None,
                started_on: chrono::Utc::now(),
                completed_on: Some(chrono::Utc::now()),
            });
            tokio::fs::write(&item.out_path, self.payload).await?;
            Ok(())
        }
    }

    fn item(source: &str) -> PlannedItem {
        PlannedItem {
            class: Class::Files,
            source: source.to_owned(),
            dest: PathBuf::from("/data/a.bin"),
            declared_size: Some(5),
            checksum: None,
            identifier: None,
            version: None,
            via: Via::Direct,
        }
    }

    #[tokio::test]
    async fn miss_downloads_then_hit_skips_engine() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let engine = StubEngine { payload: b"hello", ..Default::default() };
        let orch = Orchestrator::new(&store, &engine, dir.path().join("build"), None);
        let planned = item("https://example.com/hit-or-miss.bin");

        let first = orch.fetch_and_admit(&planned).await.unwrap();
        assert_eq!(std::fs::read(&first).unwrap(), b"hello");
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);

        let second = orch.fetch_and_admit(&planned).await.unwrap();
        assert_eq!(second, first, "a cache hit must reuse the admitted blob");
        assert_eq!(
            engine.calls.load(Ordering::SeqCst),
            1,
            "a cache hit must not invoke the download engine"
        );
    }

    #[tokio::test]
    async fn stale_hit_redownloads_when_revalidation_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("policy.yaml"), "files:\n  max_age: 0\n").unwrap();
        let store = Store::open(dir.path()).unwrap();
        let engine = StubEngine { payload: b"v1", ..Default::default() };
        let orch = Orchestrator::new(&store, &engine, dir.path().join("build"), None);
        // Nothing listens here, so the revalidation HEAD fails fast and
        // every lookup after the first falls back to a fresh download.
        let planned = item("http://127.0.0.1:1/unreachable.bin");

        orch.fetch_and_admit(&planned).await.unwrap();
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);

        orch.fetch_and_admit(&planned).await.unwrap();
        assert_eq!(
            engine.calls.load(Ordering::SeqCst),
            2,
            "max_age: 0 makes every lookup stale; a failed revalidation must re-download"
        );
    }

    #[tokio::test]
    async fn concurrent_resolve_one_dedupes_to_a_single_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let engine = StubEngine { payload: b"world", ..Default::default() };
        let orch = Orchestrator::new(&store, &engine, dir.path().join("build"), None);
        let planned = item("https://example.com/dedup.bin");

        let (a, b) = tokio::join!(orch.resolve_one(&planned), orch.resolve_one(&planned));
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(
            engine.calls.load(Ordering::SeqCst),
            1,
            "two concurrent resolutions of the same source must fetch at most once"
        );
    }
}
