use std::path::Path;

use serde::Deserialize;

use crate::error::Result;

/// Global application configuration, loaded from a TOML file with
/// `VULNWATCH_`-prefixed environment variable overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    #[serde(default = "default_server_bind")]
    pub server_bind: String,
    /// Cadence of the syndicated-feed collector, in seconds.
    #[serde(default = "default_ingest_interval")]
    pub ingest_interval_secs: u64,
    /// Upper bound on a single feed document, in bytes.
    #[serde(default = "default_max_feed_bytes")]
    pub max_feed_bytes: usize,
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
    #[serde(default)]
    pub nvd: NvdConfig,
    #[serde(default)]
    pub kev: KevConfig,
    #[serde(default)]
    pub epss: EpssConfig,
}

/// A single syndicated feed source.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    pub name: String,
    pub url: String,
    /// Optional format hint ("rss" or "atom"); parsing auto-detects either way.
    #[serde(default)]
    pub feed_type: Option<String>,
    /// Extra labels appended to each item's category list.
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NvdConfig {
    pub enabled: bool,
    pub poll_interval_secs: u64,
    pub page_size: u32,
    pub api_key: Option<String>,
    pub url: Option<String>,
}

impl Default for NvdConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval_secs: 3600,
            page_size: 2000,
            api_key: None,
            url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KevConfig {
    pub enabled: bool,
    pub poll_interval_secs: u64,
    pub url: Option<String>,
}

impl Default for KevConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval_secs: 3600,
            url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EpssConfig {
    pub enabled: bool,
    pub poll_interval_secs: u64,
    pub page_size: u32,
    pub url: Option<String>,
}

impl Default for EpssConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval_secs: 3600,
            page_size: 5000,
            url: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from `path` (optional) and the environment.
    /// A missing file is fine as long as `database_url` arrives via the
    /// environment; a missing `database_url` is a start-up failure.
    pub fn load(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("VULNWATCH")
                    .separator("__")
                    .list_separator(","),
            )
            .build()?;

        let cfg: AppConfig = settings.try_deserialize()?;
        Ok(cfg)
    }
}

fn default_server_bind() -> String {
    "0.0.0.0:9101".to_string()
}

fn default_ingest_interval() -> u64 {
    3600
}

fn default_max_feed_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_true() -> bool {
    true
}
