//! Configuration loading and types.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  The `connection` section describes the storage
//! target; `logging` and `observability` govern the ambient stack.

use serde::{Deserialize, Deserializer};
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Storage connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Connection target and caching.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConnectionConfig {
    /// Connection string, e.g. `mongodb://localhost:27017/uploads`.
    #[serde(default)]
    pub url: Option<String>,

    /// Options passed to the connector with the URL.
    #[serde(default)]
    pub options: Option<serde_json::Value>,

    /// `true` for the default cache, a string for a named cache.
    #[serde(default)]
    pub cache: CacheSetting,
}

/// Whether (and under which name) connections are shared.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CacheSetting {
    #[default]
    Disabled,
    /// The cache named [`DEFAULT_CACHE_NAME`].
    Default,
    Named(String),
}

/// Cache name used by `cache: true`.
pub const DEFAULT_CACHE_NAME: &str = "default";

impl CacheSetting {
    /// Cache name, or `None` when caching is disabled.
    pub fn name(&self) -> Option<&str> {
        match self {
            CacheSetting::Disabled => None,
            CacheSetting::Default => Some(DEFAULT_CACHE_NAME),
            CacheSetting::Named(name) => Some(name),
        }
    }
}

impl From<bool> for CacheSetting {
    fn from(enabled: bool) -> Self {
        if enabled {
            CacheSetting::Default
        } else {
            CacheSetting::Disabled
        }
    }
}

impl From<&str> for CacheSetting {
    fn from(name: &str) -> Self {
        CacheSetting::Named(name.to_string())
    }
}

impl<'de> Deserialize<'de> for CacheSetting {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            Name(String),
        }

        Ok(match Option::<Raw>::deserialize(deserializer)? {
            None => CacheSetting::Disabled,
            Some(Raw::Flag(flag)) => CacheSetting::from(flag),
            Some(Raw::Name(name)) => CacheSetting::Named(name),
        })
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Register metric descriptions on startup.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    parse_config(&contents)
}

/// Parse configuration from YAML text.
pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
}
