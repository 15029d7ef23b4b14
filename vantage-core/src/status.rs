//! Entry and connection status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Freshness status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryStatus {
    /// Value reflects the latest known server state.
    Fresh,
    /// Value is still readable but a refetch is due.
    Stale,
    /// A fetch for this key is in flight.
    Fetching,
    /// The last fetch failed; any previous value is still readable.
    Error,
}

impl EntryStatus {
    /// Get the status name as a string for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Fresh => "fresh",
            EntryStatus::Stale => "stale",
            EntryStatus::Fetching => "fetching",
            EntryStatus::Error => "error",
        }
    }

    /// Whether a waiting reader can stop waiting on this status.
    pub fn is_settled(&self) -> bool {
        matches!(self, EntryStatus::Fresh | EntryStatus::Error)
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a push connection.
///
/// Subscriptions are only live while the connection is `Open`. Data observed
/// while `Degraded` or `Reconnecting` may be missing events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Connecting,
    Open,
    /// Heartbeat missed; the channel is being closed.
    Degraded,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    /// Whether consumers should treat live data as possibly incomplete.
    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            ConnectionState::Degraded | ConnectionState::Reconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
