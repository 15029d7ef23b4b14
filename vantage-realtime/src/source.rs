//! Push source and channel abstractions.
//!
//! A [`PushSource`] opens channels; each channel pushes its traffic into the
//! [`ChannelSink`] it was created with. Every frame is tagged with the
//! connection id of the channel that produced it, so frames from a channel
//! that has since been replaced can be told apart.

use async_trait::async_trait;
use tokio::sync::mpsc;
use vantage_core::{ChangeEvent, ChannelError, FilterExpr, PushMessage};

/// Identifies one connection attempt of a manager.
pub type ConnectionId = u64;

/// Inbound traffic from a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(PushMessage),
    /// Transport failure; the channel is unusable.
    Error(ChannelError),
    /// The remote end closed the channel.
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub connection_id: ConnectionId,
    pub payload: Inbound,
}

/// Write half handed to [`PushSource::connect`].
#[derive(Debug, Clone)]
pub struct ChannelSink {
    connection_id: ConnectionId,
    tx: mpsc::UnboundedSender<InboundFrame>,
}

impl ChannelSink {
    pub fn new(connection_id: ConnectionId, tx: mpsc::UnboundedSender<InboundFrame>) -> Self {
        Self { connection_id, tx }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Push a frame. Returns `false` once the manager has gone away.
    pub fn push(&self, payload: Inbound) -> bool {
        self.tx
            .send(InboundFrame {
                connection_id: self.connection_id,
                payload,
            })
            .is_ok()
    }

    pub fn message(&self, message: PushMessage) -> bool {
        self.push(Inbound::Message(message))
    }

    pub fn change(&self, event: ChangeEvent) -> bool {
        self.message(PushMessage::Change(event))
    }

    pub fn keep_alive(&self) -> bool {
        self.message(PushMessage::KeepAlive)
    }

    pub fn error(&self, error: ChannelError) -> bool {
        self.push(Inbound::Error(error))
    }

    pub fn closed(&self) -> bool {
        self.push(Inbound::Closed)
    }
}

/// What a caller wants to hear about: one entity, optionally filtered.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionSpec {
    pub entity: String,
    pub filter: Option<FilterExpr>,
}

impl SubscriptionSpec {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            filter: None,
        }
    }

    pub fn filtered(entity: impl Into<String>, filter: FilterExpr) -> Self {
        Self {
            entity: entity.into(),
            filter: Some(filter),
        }
    }

    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey {
            entity: self.entity.clone(),
            filter: self.filter.as_ref().map(FilterExpr::canonical),
        }
    }
}

/// Identity of a subscription: entity plus canonical filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    pub entity: String,
    pub filter: Option<String>,
}

/// Reported state of an active subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub entity: String,
    pub filter: Option<FilterExpr>,
    /// Connection currently carrying the subscription, if any.
    pub connection_id: Option<ConnectionId>,
    /// Sequence of the last event reconciled for the entity.
    pub last_event_sequence: Option<u64>,
    /// Number of callers sharing this subscription.
    pub holders: usize,
}

/// An open push channel.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn subscribe(&self, spec: &SubscriptionSpec) -> Result<(), ChannelError>;

    async fn unsubscribe(&self, spec: &SubscriptionSpec) -> Result<(), ChannelError>;

    /// Release the channel. Must be idempotent.
    async fn close(&self);
}

/// Opens push channels.
#[async_trait]
pub trait PushSource: Send + Sync {
    async fn connect(&self, sink: ChannelSink) -> Result<Box<dyn Channel>, ChannelError>;
}
