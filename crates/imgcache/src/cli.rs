//! Exposes the command line application.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use imgcache_service::caching::StorageStrategy;
use imgcache_service::codec::ImageProcessing;
use imgcache_service::config::Config;
use imgcache_service::download::{CacheStrategy, RequestHeaders};
use imgcache_service::logging;
use imgcache_service::metrics;
use imgcache_service::service::{ImageService, LoadOptions};
use url::Url;

/// Which tiers a command applies to.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum Storage {
    Memory,
    Disk,
    Hybrid,
}

impl From<Storage> for StorageStrategy {
    fn from(storage: Storage) -> Self {
        match storage {
            Storage::Memory => StorageStrategy::Memory,
            Storage::Disk => StorageStrategy::Disk,
            Storage::Hybrid => StorageStrategy::Hybrid,
        }
    }
}

/// How the caches are consulted before fetching.
#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum Strategy {
    #[default]
    CacheFirst,
    EtagValidation,
    ForceDownload,
}

impl From<Strategy> for CacheStrategy {
    fn from(strategy: Strategy) -> Self {
        match strategy {
            Strategy::CacheFirst => CacheStrategy::CacheFirst,
            Strategy::EtagValidation => CacheStrategy::EtagValidation,
            Strategy::ForceDownload => CacheStrategy::ForceDownload,
        }
    }
}

#[derive(Debug, Args)]
struct FetchArgs {
    /// The image to load.
    url: Url,

    /// How to consult the caches before going to the network.
    #[arg(long, value_enum, default_value_t)]
    strategy: Strategy,

    /// The tiers to use. Defaults to the configured storage strategy.
    #[arg(long, value_enum)]
    storage: Option<Storage>,

    /// Extra request headers, as `Name: value`.
    #[arg(long = "header", short = 'H', value_name = "HEADER", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// Resize the image to exactly `WIDTHxHEIGHT`.
    #[arg(long, value_name = "SIZE", value_parser = parse_size, conflicts_with = "thumbnail")]
    resize: Option<(u32, u32)>,

    /// Shrink the image to fit `WIDTHxHEIGHT`, keeping its aspect ratio.
    #[arg(long, value_name = "SIZE", value_parser = parse_size)]
    thumbnail: Option<(u32, u32)>,

    /// Write the image to this file. The format is derived from the extension.
    #[arg(long, short, value_name = "FILE")]
    output: Option<PathBuf>,
}

impl FetchArgs {
    fn load_options(&self) -> LoadOptions {
        let processing = match (self.resize, self.thumbnail) {
            (Some((width, height)), _) => ImageProcessing::Resize { width, height },
            (None, Some((width, height))) => ImageProcessing::Downsample { width, height },
            (None, None) => ImageProcessing::None,
        };

        LoadOptions {
            headers: self.headers.iter().cloned().collect::<RequestHeaders>(),
            cache_strategy: self.strategy.into(),
            storage_strategy: self.storage.map(Into::into),
            processing,
        }
    }
}

/// Imgcache commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Load an image, through the caches.
    Fetch(FetchArgs),

    /// Remove one image from the caches.
    Remove {
        url: Url,
        #[arg(long, value_enum, default_value = "hybrid")]
        storage: Storage,
    },

    /// Remove all images from the caches.
    Clear {
        #[arg(long, value_enum, default_value = "hybrid")]
        storage: Storage,
    },

    /// Remove expired and stray files from the disk cache.
    Cleanup,
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(bin_name = "imgcache", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

fn parse_header(value: &str) -> Result<(String, String), String> {
    let (name, value) = value
        .split_once(':')
        .ok_or_else(|| format!("expected `Name: value`, got `{value}`"))?;
    Ok((name.trim().to_owned(), value.trim().to_owned()))
}

fn parse_size(value: &str) -> Result<(u32, u32), String> {
    let parse = |n: &str| n.parse::<u32>().map_err(|e| format!("invalid size `{value}`: {e}"));
    let (width, height) = value
        .split_once('x')
        .ok_or_else(|| format!("expected `WIDTHxHEIGHT`, got `{value}`"))?;
    Ok((parse(width)?, parse(height)?))
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    // SAFETY: This is safe because we are calling it before spawning any threads.
    unsafe { logging::init_logging(&config) };
    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("imgcache")
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(run(cli.command, config))
}

async fn run(command: Command, config: Config) -> Result<()> {
    let service = ImageService::from_config(&config, tokio::runtime::Handle::current())
        .context("failed to create the image service")?;

    match command {
        Command::Fetch(args) => fetch(&service, args).await?,
        Command::Remove { url, storage } => service.remove_cache(&url, storage.into()),
        Command::Clear { storage } => service.clear_cache(storage.into()),
        Command::Cleanup => {
            let stats = service
                .cleanup()
                .await
                .context("failed to clean up the disk cache")?;
            println!(
                "removed {} files ({} bytes) and {} directories, retained {} files ({} bytes)",
                stats.removed_files,
                stats.removed_bytes,
                stats.removed_dirs,
                stats.retained_files,
                stats.retained_bytes,
            );
        }
    }

    service.flush().await;
    Ok(())
}

async fn fetch(service: &ImageService, args: FetchArgs) -> Result<()> {
    let options = args.load_options();
    let image = service
        .load_image(args.url.clone(), options)
        .await
        .with_context(|| format!("failed to load `{}`", args.url))?;

    println!(
        "{}: {}x{} ({} bytes decoded)",
        args.url,
        image.width(),
        image.height(),
        image.decoded_size(),
    );

    if let Some(ref path) = args.output {
        image
            .as_dynamic()
            .save(path)
            .with_context(|| format!("failed to write `{}`", path.display()))?;
        tracing::info!("Saved image to `{}`", path.display());
    }

    Ok(())
}
