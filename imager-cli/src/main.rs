//! CLI for building single-board-computer hotspot disk images (§6).

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::PathBuf;

use clap::Parser;
use imager_core::driver::BuildOptions;
use imager_core::recipe::Recipe;

/// Builds a disk image from a recipe.
#[derive(Parser)]
#[command(name = "offspot-imager", version, about = "Build single-board-computer hotspot disk images")]
struct Cli {
    /// Path or URL to the recipe YAML.
    config_src: String,

    /// Destination path for the built image.
    output: PathBuf,

    /// Directory for staging downloads and intermediate artifacts.
    #[arg(long, value_name = "DIR")]
    build_dir: Option<PathBuf>,

    /// Directory for the download cache (`policy.yaml`, blobs, journal).
    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Validate the recipe and check source reachability, without building.
    #[arg(short = 'C', long)]
    check: bool,

    /// Keep the output file on failure, for inspection.
    #[arg(short = 'K', long)]
    keep: bool,

    /// Overwrite the output file if it already exists.
    #[arg(short = 'X', long)]
    overwrite: bool,

    /// Enable debug logging (mirrored subprocess stderr, full error detail).
    #[arg(short = 'D', long)]
    debug: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("offspot-imager: {e}");
            e.exit_code()
        }
    };
    std::process::exit(exit_code);
}

fn init_tracing(debug: bool) {
    let default_filter = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_env("RUST_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(std::env::var_os("NO_COLOR").is_none())
        .init();
}

async fn run(cli: Cli) -> imager_core::Result<()> {
    let recipe_text = load_recipe_source(&cli.config_src)
        .await
        .map_err(|e| imager_core::BuildError::Input(e.to_string()))?;
    let recipe: Recipe = serde_yaml::from_str(&recipe_text)
        .map_err(|e| imager_core::BuildError::Input(e.to_string()))?;

    let build_dir = cli.build_dir.unwrap_or_else(default_build_dir);
    let cache_dir = cli.cache_dir.unwrap_or_else(default_cache_dir);

    let opts = BuildOptions {
        build_dir,
        cache_dir,
        check: cli.check,
        keep: cli.keep,
        overwrite: cli.overwrite,
    };

    tokio::select! {
        result = imager_core::build(&recipe, &cli.output, &opts) => result,
        _ = tokio::signal::ctrl_c() => Err(imager_core::BuildError::Cancelled),
    }
}

/// Loads the recipe text from a local path or, if `src` parses as an
/// `http(s)://` URL, fetches it (§6: `CONFIG_SRC` accepts either).
async fn load_recipe_source(src: &str) -> Result<String, Box<dyn std::error::Error>> {
    match url::Url::parse(src) {
        Ok(u) if u.scheme() == "http" || u.scheme() == "https" => {
            let resp = reqwest::get(u).await?.error_for_status()?;
            Ok(resp.text().await?)
        }
        _ => Ok(std::fs::read_to_string(src)?),
    }
}

fn default_build_dir() -> PathBuf {
    std::env::var_os("TMPDIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join("offspot-imager-build")
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("offspot-imager")
}
