//! VANTAGE Cache - Query Cache and Consistency Engine
//!
//! The store holds cached query results; the dispatcher, coordinator and
//! reconciler are the only components allowed to change them:
//!
//! - [`InvalidationDispatcher`]: marks entities stale and refetches what is observed
//! - [`MutationCoordinator`]: optimistic writes with exact rollback
//! - [`ChangeReconciler`]: folds push-channel change events into cached lists
//!
//! Components take their dependencies by constructor; nothing here is global.

pub mod config;
pub mod dispatcher;
pub mod fold;
pub mod mutation;
pub mod reconciler;
pub mod registry;
pub mod store;

pub use config::{CacheConfig, MutationConfig, ReconcilerConfig};
pub use dispatcher::{InvalidationDispatcher, InvalidationReport};
pub use fold::{fold_list, FoldOutcome};
pub use mutation::{MutationContext, MutationCoordinator};
pub use reconciler::{ChangeReconciler, ReconcileOutcome, ReconcilePhase};
pub use registry::{
    ListShape, MutationDescriptor, QueryDescriptor, QueryShape, Registry, RegistryBuilder,
};
pub use store::{
    CacheEntry, CacheStats, CacheStore, FetchToken, Snapshot, StoreBatch, StoreEvent,
    StoreEventKind, StoreResult,
};
