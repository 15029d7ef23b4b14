//! Configuration loading for the VANTAGE client.
//!
//! The whole component tree is read from one TOML file located via
//! `--config <path>` or `VANTAGE_CONFIG`. Every section is optional and
//! falls back to the component defaults; unknown keys are rejected.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use vantage_cache::{CacheConfig, MutationConfig, ReconcilerConfig};
use vantage_core::ConfigError;
use vantage_realtime::{RealtimeConfig, ReconnectConfig};

use crate::telemetry::TelemetryConfig;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "VANTAGE_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct VantageConfig {
    pub cache: CacheSection,
    pub mutation: MutationSection,
    pub reconciler: ReconcilerSection,
    pub realtime: RealtimeSection,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CacheSection {
    pub max_entries: usize,
    pub change_feed_capacity: usize,
}

impl Default for CacheSection {
    fn default() -> Self {
        let defaults = CacheConfig::default();
        Self {
            max_entries: defaults.max_entries,
            change_feed_capacity: defaults.change_feed_capacity,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MutationSection {
    /// Unset means mutations wait for the remote indefinitely.
    pub remote_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ReconcilerSection {
    pub reorder_window: usize,
    pub refetch_on_reconnect: bool,
}

impl Default for ReconcilerSection {
    fn default() -> Self {
        let defaults = ReconcilerConfig::default();
        Self {
            reorder_window: defaults.reorder_window,
            refetch_on_reconnect: defaults.refetch_on_reconnect,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RealtimeSection {
    pub heartbeat_timeout_ms: u64,
    pub monitor_interval_ms: u64,
    pub reconnect: ReconnectConfig,
}

impl Default for RealtimeSection {
    fn default() -> Self {
        let defaults = RealtimeConfig::default();
        Self {
            heartbeat_timeout_ms: defaults.heartbeat_timeout.as_millis() as u64,
            monitor_interval_ms: defaults.monitor_interval.as_millis() as u64,
            reconnect: defaults.reconnect,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("Missing configuration file path (use --config or VANTAGE_CONFIG)")]
    MissingConfigPath,
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    Invalid(#[from] ConfigError),
}

impl VantageConfig {
    /// Locate, read and validate the configuration file.
    pub fn load() -> Result<Self, ConfigLoadError> {
        let path = config_path_from_args(std::env::args().skip(1)).or_else(config_path_from_env);
        let path = path.ok_or(ConfigLoadError::MissingConfigPath)?;
        let config = Self::from_path(&path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigLoadError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigLoadError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache_config().validate()?;
        self.mutation_config().validate()?;
        self.realtime_config().validate()?;
        Ok(())
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::new()
            .with_max_entries(self.cache.max_entries)
            .with_change_feed_capacity(self.cache.change_feed_capacity)
    }

    pub fn mutation_config(&self) -> MutationConfig {
        MutationConfig {
            remote_timeout: self.mutation.remote_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig::new()
            .with_reorder_window(self.reconciler.reorder_window)
            .with_refetch_on_reconnect(self.reconciler.refetch_on_reconnect)
    }

    pub fn realtime_config(&self) -> RealtimeConfig {
        RealtimeConfig::new()
            .with_heartbeat_timeout(Duration::from_millis(self.realtime.heartbeat_timeout_ms))
            .with_monitor_interval(Duration::from_millis(self.realtime.monitor_interval_ms))
            .with_reconnect(self.realtime.reconnect.clone())
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var(CONFIG_ENV).ok().map(PathBuf::from)
}

fn config_path_from_args(mut args: impl Iterator<Item = String>) -> Option<PathBuf> {
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(path));
        }
    }
    None
}
