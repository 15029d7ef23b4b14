//! Error types for VANTAGE operations

use std::time::Duration;
use thiserror::Error;

/// Errors returned by the remote procedure boundary.
///
/// Every variant is treated identically by the mutation rollback path.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Network failure calling {procedure}: {reason}")]
    Network { procedure: String, reason: String },

    #[error("Validation failed for {procedure}: {reason}")]
    Validation { procedure: String, reason: String },

    #[error("Remote call {procedure} timed out after {timeout:?}")]
    Timeout { procedure: String, timeout: Duration },

    #[error("Server error from {procedure} (status {status}): {message}")]
    Server {
        procedure: String,
        status: u16,
        message: String,
    },
}

impl RemoteError {
    /// Procedure that produced the error.
    pub fn procedure(&self) -> &str {
        match self {
            RemoteError::Network { procedure, .. }
            | RemoteError::Validation { procedure, .. }
            | RemoteError::Timeout { procedure, .. }
            | RemoteError::Server { procedure, .. } => procedure,
        }
    }
}

/// Cache store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Cache store lock poisoned")]
    LockPoisoned,

    #[error("Cache entry {key} holds a {found} value where a list was expected")]
    ShapeMismatch { key: String, found: &'static str },
}

/// Routing table errors, raised while building the registry or resolving names.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Unknown query {resource}.{operation}")]
    UnknownQuery { resource: String, operation: String },

    #[error("Unknown mutation: {name}")]
    UnknownMutation { name: String },

    #[error("Unknown entity {entity} referenced by {referenced_by}")]
    UnknownEntity {
        entity: String,
        referenced_by: String,
    },

    #[error("Query {resource}.{operation} registered twice")]
    DuplicateQuery { resource: String, operation: String },

    #[error("Resource {resource} does not belong to any entity")]
    OrphanResource { resource: String },

    #[error("Invalid descriptor for {resource}.{operation}: {reason}")]
    InvalidDescriptor {
        resource: String,
        operation: String,
        reason: String,
    },
}

/// Push channel errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Connect failed: {reason}")]
    ConnectFailed { reason: String },

    #[error("Subscribe to {entity} failed: {reason}")]
    SubscribeFailed { entity: String, reason: String },

    #[error("Transport error: {reason}")]
    Transport { reason: String },

    #[error("Channel closed")]
    Closed,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },
}

/// Master error type for all VANTAGE errors.
#[derive(Debug, Clone, Error)]
pub enum VantageError {
    /// A query fetch failed. The entry is left in `Error` status with any
    /// previous value still readable.
    #[error("Fetch failed for {key}: {source}")]
    Fetch {
        key: String,
        #[source]
        source: RemoteError,
    },

    /// A mutation failed and its optimistic writes were rolled back.
    #[error("Mutation {mutation} failed and was rolled back: {source}")]
    Mutation {
        mutation: String,
        #[source]
        source: RemoteError,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl VantageError {
    /// The remote error behind a fetch or mutation failure, if any.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            VantageError::Fetch { source, .. } | VantageError::Mutation { source, .. } => {
                Some(source)
            }
            _ => None,
        }
    }
}

/// Result type alias for VANTAGE operations.
pub type VantageResult<T> = Result<T, VantageError>;

// =============================================================================
// TESTS
// =============================================================================
