//! VANTAGE Client
//!
//! Entry point for applications: one [`VantageClient`] wires the query
//! cache, invalidation, optimistic mutations, change-event reconciliation
//! and the push connection together, configured from a TOML file.
//!
//! ```no_run
//! # async fn run(
//! #     remote: std::sync::Arc<dyn vantage_client::RemoteCall>,
//! #     push: std::sync::Arc<dyn vantage_client::PushSource>,
//! #     registry: vantage_client::Registry,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! use vantage_client::{init_tracing, VantageClient, VantageConfig};
//!
//! let config = VantageConfig::load()?;
//! init_tracing(&config.telemetry)?;
//! let client = VantageClient::new(&config, registry, remote, push)?;
//! let upcoming = client.query("appointment", "upcoming", serde_json::Value::Null).await?;
//! # let _ = upcoming;
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod query;
pub mod telemetry;

pub use client::VantageClient;
pub use config::{
    CacheSection, ConfigLoadError, MutationSection, RealtimeSection, ReconcilerSection,
    VantageConfig, CONFIG_ENV,
};
pub use query::{QuerySnapshot, QueryWatch};
pub use telemetry::{init_tracing, TelemetryConfig, TelemetryError, LOG_ENV};

pub use vantage_cache::{InvalidationReport, QueryShape, Registry, RegistryBuilder};
pub use vantage_core::{
    CacheKey, ChangeEvent, ConnectionState, EntryStatus, FilterExpr, RemoteCall, RemoteError,
    SortSpec, VantageError, VantageResult,
};
pub use vantage_realtime::{Channel, ChannelSink, LiveSubscription, PushSource, SubscriptionSpec};
