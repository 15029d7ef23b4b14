//! Configuration for the streaming connection manager.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use vantage_core::ConfigError;

/// Reconnect backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconnectConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_ms: 250,
            max_ms: 30_000,
            multiplier: 2.0,
            jitter_ms: 250,
        }
    }
}

impl ReconnectConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_ms == 0 {
            return Err(invalid("reconnect.initial_ms", &self.initial_ms, "must be > 0"));
        }
        if self.max_ms < self.initial_ms {
            return Err(invalid(
                "reconnect.max_ms",
                &self.max_ms,
                "must be >= reconnect.initial_ms",
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(invalid("reconnect.multiplier", &self.multiplier, "must be >= 1.0"));
        }
        Ok(())
    }
}

/// Configuration for [`crate::ConnectionManager`].
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// A connection with no inbound frame for this long is considered lost.
    pub heartbeat_timeout: Duration,
    /// How often the heartbeat is checked. Must be shorter than the timeout.
    pub monitor_interval: Duration,
    pub reconnect: ReconnectConfig,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(30),
            monitor_interval: Duration::from_secs(5),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl RealtimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.monitor_interval.is_zero() {
            return Err(invalid("realtime.monitor_interval_ms", &0, "must be > 0"));
        }
        if self.heartbeat_timeout <= self.monitor_interval {
            return Err(ConfigError::IncompatibleOptions {
                option_a: format!("realtime.heartbeat_timeout_ms = {}", self.heartbeat_timeout.as_millis()),
                option_b: format!("realtime.monitor_interval_ms = {}", self.monitor_interval.as_millis()),
            });
        }
        self.reconnect.validate()
    }
}

fn invalid(field: &str, value: &dyn std::fmt::Display, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
