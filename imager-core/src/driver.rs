//! Build driver (component G, §4.G): the linear pipeline that ties every
//! other component together into one build.
//!
//! validate recipe → open cache → orchestrate content → manage image
//! layout → write configs → shrink (optional) → release.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::Store;
use crate::config_writer::{ConfigWriter as _, YamlConfigWriter};
use crate::engine::EngineClient;
use crate::error::{BuildError, Result};
use crate::layout::ImageLayout;
use crate::orchestrator::{BuildProgress, Orchestrator};
use crate::recipe::Recipe;

/// Options controlling one build, mirroring the CLI surface (§6).
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Where to stage downloads and intermediate artifacts.
    pub build_dir: PathBuf,
    /// The cache directory (`policy.yaml`, blobs, journal).
    pub cache_dir: PathBuf,
    /// Validate and check reachability only; do not produce an image.
    pub check: bool,
    /// Keep the output file on failure instead of removing it.
    pub keep: bool,
    /// Overwrite an existing output file.
    pub overwrite: bool,
}

/// Runs one build of `recipe` to `output`, per `opts`.
pub async fn build(recipe: &Recipe, output: &Path, opts: &BuildOptions) -> Result<()> {
    tracing::info!(output = %output.display(), "starting build");

    crate::layout::tool::check_required()
        .map_err(|e| BuildError::Tool(e.to_string()))?;

    let data_capacity = recipe.base.root_size;
    recipe
        .validate(data_capacity)
        .map_err(|e| BuildError::Input(e.to_string()))?;

    std::fs::create_dir_all(&opts.build_dir).map_err(|e| BuildError::Input(e.to_string()))?;
    let cache = Store::open(&opts.cache_dir)?;

    if opts.check {
        let engine_for_check = EngineClient::start(find_free_port(), &random_secret())
            .await
            .map_err(BuildError::Download)?;
        let orchestrator = Orchestrator::new(&cache, &engine_for_check, opts.build_dir.clone(), None);
        let result = orchestrator
            .dry_check(recipe)
            .await
            .map_err(|e| BuildError::Resolution(e.to_string()));
        let _ = engine_for_check.shutdown().await;
        return result;
    }

    let outcome = run_build(recipe, output, opts, &cache).await;

    if let Err(e) = &outcome {
        if !opts.keep && output.exists() {
            let _ = std::fs::remove_file(output);
        }
        tracing::error!("build failed: {e}");
    }

    outcome
}

async fn run_build(
    recipe: &Recipe,
    output: &Path,
    opts: &BuildOptions,
    cache: &Store,
) -> Result<()> {
    let output_size = recipe
        .output
        .size
        .unwrap_or(recipe.base.root_size + estimated_content_size(recipe));

    let mut layout = ImageLayout::create(output, output_size, opts.overwrite)?;

    let engine = EngineClient::start(find_free_port(), &random_secret())
        .await
        .map_err(BuildError::Download)?;
    let progress_cb: Arc<dyn Fn(&BuildProgress) + Send + Sync> = Arc::new(log_progress);
    let orchestrator = Orchestrator::new(cache, &engine, opts.build_dir.clone(), Some(progress_cb));
    let run_result = orchestrator
        .run(recipe)
        .await
        .map_err(|e| BuildError::Resolution(e.to_string()));
    let shutdown_result = engine.shutdown().await;
    let manifest = run_result?;
    shutdown_result.map_err(BuildError::Download)?;

    layout.attach()?;
    layout.probe()?;
    layout.extend_p3()?;
    if layout.ensure_devices_ready().is_err() {
        layout.reattach()?;
        layout.probe()?;
        layout.extend_p3()?;
        layout.ensure_devices_ready()?;
    }
    layout.resize_fs()?;

    let writer = YamlConfigWriter;
    layout.populate(|mount_root| {
        for (to, placed) in &manifest.files {
            let rel = to.strip_prefix("/data").unwrap_or(to);
            let dest = mount_root.join(rel);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            if placed.is_dir() {
                copy_dir_recursive(placed, &dest)?;
            } else {
                std::fs::copy(placed, &dest)?;
            }
        }
        for oci_dir in &manifest.oci_images {
            let docker_dir = mount_root.join("docker");
            std::fs::create_dir_all(&docker_dir)?;
            copy_dir_recursive(oci_dir, &docker_dir)?;
        }
        writer
            .write(mount_root, "offspot", &recipe.offspot)
            .map_err(|e| crate::layout::Error::Mount(e.to_string()))?;
        writer
            .write(mount_root, "write_config", &recipe.write_config)
            .map_err(|e| crate::layout::Error::Mount(e.to_string()))?;
        Ok(())
    })?;

    if recipe.output.shrink {
        layout.shrink()?;
    }

    layout.detach()?;
    layout.release()?;

    tracing::info!("build complete");
    Ok(())
}

/// Logs one aggregate progress snapshot, already rate-limited to ≤1Hz by
/// the orchestrator before this is ever called (§4.E step 4).
fn log_progress(progress: &BuildProgress) {
    match progress.percent() {
        Some(percent) => tracing::info!(
            bytes_done = progress.bytes_done,
            total = progress.total,
            speed = progress.speed,
            percent = format!("{percent:.1}"),
            "download progress"
        ),
        None => tracing::info!(
            bytes_done = progress.bytes_done,
            speed = progress.speed,
            "download progress"
        ),
    }
}

fn estimated_content_size(recipe: &Recipe) -> u64 {
    let files: u64 = recipe.files.iter().filter_map(|f| f.size).sum();
    let oci: u64 = recipe.oci_images.iter().map(|o| o.fullsize).sum();
    files + oci
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in walkdir::WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

fn find_free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .unwrap_or(16800)
}

fn random_secret() -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::time::SystemTime::now().hash(&mut hasher);
    std::process::id().hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
