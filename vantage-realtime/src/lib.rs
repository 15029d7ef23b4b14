//! VANTAGE Realtime - Streaming Connection Manager
//!
//! Owns the push channel that feeds change events into the cache:
//! reference-counted live subscriptions over a single channel, heartbeat
//! monitoring, and reconnect with exponential backoff. Received events are
//! handed to a [`ChangeSink`], normally the cache's
//! [`vantage_cache::ChangeReconciler`].

pub mod backoff;
pub mod config;
pub mod manager;
pub mod sink;
pub mod source;

pub use backoff::{jittered_backoff, Backoff};
pub use config::{RealtimeConfig, ReconnectConfig};
pub use manager::{ConnectionManager, LiveSubscription};
pub use sink::ChangeSink;
pub use source::{
    Channel, ChannelSink, ConnectionId, Inbound, InboundFrame, PushSource, Subscription,
    SubscriptionKey, SubscriptionSpec,
};
