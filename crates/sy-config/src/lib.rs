//! Switchyard configuration
//!
//! TOML configuration for the routing core. Every section has defaults so a partial file
//! (or no file at all) yields a working configuration. `SWITCHYARD_*` environment variables
//! override file values.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SwitchyardConfig {
    pub logging: LoggingSettings,
    pub multicast: MulticastSettings,
    pub redelivery: RedeliverySettings,
    pub timeout_map: TimeoutMapSettings,
    pub store: StoreSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    /// EnvFilter directive used when RUST_LOG is not set
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MulticastSettings {
    pub parallel: bool,
    pub streaming: bool,
    pub stop_on_exception: bool,
    /// Overall timeout for parallel fan-out; only valid with `parallel`
    pub timeout_ms: Option<u64>,
    /// Maximum concurrent branches; unbounded when absent
    pub pool_size: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RedeliverySettings {
    pub maximum_redeliveries: u32,
    pub redelivery_delay_ms: u64,
    pub use_exponential_backoff: bool,
    pub backoff_multiplier: f64,
    pub maximum_redelivery_delay_ms: u64,
    pub handled: bool,
}

impl Default for RedeliverySettings {
    fn default() -> Self {
        Self {
            maximum_redeliveries: 0,
            redelivery_delay_ms: 1000,
            use_exponential_backoff: false,
            backoff_multiplier: 2.0,
            maximum_redelivery_delay_ms: 60_000,
            handled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutMapSettings {
    pub purge_poll_ms: u64,
    pub use_lock: bool,
}

impl Default for TimeoutMapSettings {
    fn default() -> Self {
        Self {
            purge_poll_ms: 1000,
            use_lock: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreSettings {
    /// Backing page file. The store refuses to start without one.
    pub file: Option<PathBuf>,
    pub page_size: usize,
    /// fsync on every flush
    pub sync: bool,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            file: None,
            page_size: 4096,
            sync: false,
        }
    }
}

impl SwitchyardConfig {
    /// Load from a TOML file, then apply environment overrides and validate
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = Self::from_toml_str(&contents)?;
        config.apply_env_overrides()?;
        config.validate()?;

        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup, so tests don't need to mutate process env
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SWITCHYARD_LOG_FILTER") {
            self.logging.filter = v;
        }
        if let Some(v) = parse_env(&lookup, "SWITCHYARD_LOG_JSON")? {
            self.logging.json = v;
        }
        if let Some(v) = parse_env(&lookup, "SWITCHYARD_MULTICAST_PARALLEL")? {
            self.multicast.parallel = v;
        }
        if let Some(v) = parse_env(&lookup, "SWITCHYARD_MULTICAST_TIMEOUT_MS")? {
            self.multicast.timeout_ms = Some(v);
        }
        if let Some(v) = parse_env(&lookup, "SWITCHYARD_MAXIMUM_REDELIVERIES")? {
            self.redelivery.maximum_redeliveries = v;
        }
        if let Some(v) = parse_env(&lookup, "SWITCHYARD_REDELIVERY_DELAY_MS")? {
            self.redelivery.redelivery_delay_ms = v;
        }
        if let Some(v) = parse_env(&lookup, "SWITCHYARD_PURGE_POLL_MS")? {
            self.timeout_map.purge_poll_ms = v;
        }
        if let Some(v) = lookup("SWITCHYARD_STORE_FILE") {
            self.store.file = Some(PathBuf::from(v));
        }
        if let Some(v) = parse_env(&lookup, "SWITCHYARD_STORE_SYNC")? {
            self.store.sync = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.multicast.timeout_ms.is_some() && !self.multicast.parallel {
            return Err(ConfigError::Validation(
                "multicast.timeout_ms is set but multicast.parallel is not enabled".to_string(),
            ));
        }
        if self.multicast.pool_size == Some(0) {
            return Err(ConfigError::Validation(
                "multicast.pool_size must be greater than zero".to_string(),
            ));
        }
        if self.timeout_map.purge_poll_ms == 0 {
            return Err(ConfigError::Validation(
                "timeout_map.purge_poll_ms must be greater than zero".to_string(),
            ));
        }
        if self.redelivery.backoff_multiplier < 1.0 {
            return Err(ConfigError::Validation(
                "redelivery.backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.store.page_size < 256 {
            return Err(ConfigError::Validation(
                "store.page_size must be at least 256 bytes".to_string(),
            ));
        }
        debug!("Configuration validated");
        Ok(())
    }
}

fn parse_env<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                key: key.to_string(),
                value,
            }),
    }
}
