use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::caching::{ExpirationPolicy, StorageStrategy};

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Text, colored when `stderr` is a terminal
    Auto,
    /// Plain text without colors
    Text,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "imgcache".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Sizing and freshness of the two cache tiers.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// The total decoded size (in bytes) the in-memory tier may hold.
    pub memory_capacity: u64,
    /// The total size (in bytes) of image payloads the disk tier may hold.
    ///
    /// Once exceeded, the least recently accessed entries are evicted until the disk tier is
    /// back to 80% of this value.
    pub disk_capacity: u64,
    /// When disk entries become stale, based on their creation time.
    pub expiration: ExpirationPolicy,
    /// The storage strategy used when a request does not name one.
    pub default_storage: StorageStrategy,
    /// JPEG quality (1-100) used when persisting opaque images to disk.
    pub disk_encode_quality: u8,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_capacity: 50_000_000,
            disk_capacity: 100_000_000,
            expiration: ExpirationPolicy::default(),
            default_storage: StorageStrategy::Hybrid,
            disk_encode_quality: 80,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which directory to use when caching images on disk.
    ///
    /// Defaults to an `imgcache` directory in the platform cache directory.
    pub cache_dir: Option<PathBuf>,

    /// Configuration of the cache tiers.
    pub caches: CacheConfig,

    /// Logging configuration.
    pub logging: Logging,

    /// Metrics configuration.
    pub metrics: Metrics,

    /// The timeout for establishing a connection to an image host.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Global timeout for one fetch, including revalidation and decoding.
    #[serde(with = "humantime_serde")]
    pub max_download_timeout: Duration,

    /// The `User-Agent` sent with every request.
    pub user_agent: String,
}

impl Config {
    /// Return the root directory of the disk cache.
    pub fn cache_dir(&self) -> PathBuf {
        match self.cache_dir {
            Some(ref dir) => dir.clone(),
            None => default_cache_dir(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(env::temp_dir)
        .join("imgcache")
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: None,
            caches: CacheConfig::default(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            connect_timeout: Duration::from_secs(15),
            max_download_timeout: Duration::from_secs(60),
            user_agent: concat!("imgcache/", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
