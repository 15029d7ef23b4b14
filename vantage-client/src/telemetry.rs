//! Tracing initialisation.
//!
//! Library crates only emit `tracing` events; an application embedding the
//! client calls [`init_tracing`] once at startup to install a subscriber.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding filter directives. Takes precedence over
/// `RUST_LOG` and the configured filter.
pub const LOG_ENV: &str = "VANTAGE_LOG";

/// `[telemetry]` section of the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TelemetryConfig {
    /// Filter directives used when neither `VANTAGE_LOG` nor `RUST_LOG` is set.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: "info,vantage_cache=info,vantage_realtime=info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Invalid log filter '{directives}': {reason}")]
    InvalidFilter { directives: String, reason: String },
    #[error("Failed to init subscriber: {0}")]
    Init(String),
}

/// Pick the filter directives: `VANTAGE_LOG`, then `RUST_LOG`, then the
/// configured fallback. Empty values are skipped.
pub fn resolve_directives(
    vantage_log: Option<String>,
    rust_log: Option<String>,
    fallback: &str,
) -> String {
    [vantage_log, rust_log]
        .into_iter()
        .flatten()
        .find(|value| !value.trim().is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

pub fn env_filter(config: &TelemetryConfig) -> Result<EnvFilter, TelemetryError> {
    let directives = resolve_directives(
        std::env::var(LOG_ENV).ok(),
        std::env::var("RUST_LOG").ok(),
        &config.filter,
    );
    EnvFilter::try_new(&directives).map_err(|e| TelemetryError::InvalidFilter {
        directives,
        reason: e.to_string(),
    })
}

/// Install the global tracing subscriber. Fails if one is already set.
pub fn init_tracing(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let filter = env_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    result.map_err(|e| TelemetryError::Init(e.to_string()))?;

    tracing::info!(json = config.json, "Tracing initialized");
    Ok(())
}
