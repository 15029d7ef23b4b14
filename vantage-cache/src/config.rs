//! Configuration for the cache components.

use std::time::Duration;
use vantage_core::ConfigError;

/// Configuration for the query cache store.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries before least-recently-used eviction.
    pub max_entries: usize,
    /// Capacity of the store change feed; slow listeners lag beyond this.
    pub change_feed_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 2_000,
            change_feed_capacity: 256,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the max entries.
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    /// Set the change feed capacity.
    pub fn with_change_feed_capacity(mut self, capacity: usize) -> Self {
        self.change_feed_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_entries == 0 {
            return Err(invalid("cache.max_entries", &self.max_entries, "must be > 0"));
        }
        if self.change_feed_capacity == 0 {
            return Err(invalid(
                "cache.change_feed_capacity",
                &self.change_feed_capacity,
                "must be > 0",
            ));
        }
        Ok(())
    }
}

/// Configuration for the optimistic mutation coordinator.
#[derive(Debug, Clone, Default)]
pub struct MutationConfig {
    /// Upper bound on a mutation's remote call. Expiry is handled exactly
    /// like any other remote failure.
    pub remote_timeout: Option<Duration>,
}

impl MutationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = Some(timeout);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote_timeout == Some(Duration::ZERO) {
            return Err(invalid("mutation.remote_timeout_ms", &0, "must be > 0"));
        }
        Ok(())
    }
}

/// Configuration for the change event reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// How many early events may be held waiting for a missing sequence
    /// number before the gap is treated as a lost event. Zero means any
    /// gap triggers a refetch immediately.
    pub reorder_window: usize,
    /// Invalidate every listened entity after the push connection recovers.
    pub refetch_on_reconnect: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            reorder_window: 0,
            refetch_on_reconnect: true,
        }
    }
}

impl ReconcilerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reorder_window(mut self, window: usize) -> Self {
        self.reorder_window = window;
        self
    }

    pub fn with_refetch_on_reconnect(mut self, enabled: bool) -> Self {
        self.refetch_on_reconnect = enabled;
        self
    }
}

fn invalid(field: &str, value: &dyn std::fmt::Display, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
