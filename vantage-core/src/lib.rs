//! VANTAGE Core - Shared Types
//!
//! Pure data structures shared by every other crate in the workspace:
//! canonical cache keys, row change events, entry and connection states,
//! row predicates, the error hierarchy, and the remote-call boundary.
//!
//! This crate contains no cache behaviour.

use chrono::{DateTime, Utc};

pub mod error;
pub mod event;
pub mod filter;
pub mod key;
pub mod remote;
pub mod row;
pub mod status;

pub use error::{
    ChannelError, ConfigError, RegistryError, RemoteError, StoreError, VantageError,
    VantageResult,
};
pub use event::{ChangeEvent, ChangeKind, PushMessage};
pub use filter::{compare_values, FilterExpr, FilterOperator, SortSpec};
pub use key::CacheKey;
pub use remote::RemoteCall;
pub use row::{row_id, Row, RowId};
pub use status::{ConnectionState, EntryStatus};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Logical entity name (e.g. `appointments`), the unit of invalidation.
pub type EntityName = String;
