//! Where received change events go.

use vantage_cache::ChangeReconciler;
use vantage_core::{ChangeEvent, VantageResult};

use crate::source::SubscriptionSpec;

/// Consumer of change events delivered by the connection manager.
pub trait ChangeSink: Send + Sync {
    /// A subscription for `spec` is starting.
    fn listen(&self, spec: &SubscriptionSpec) -> VantageResult<()>;

    /// A subscription for `spec` ended.
    fn forget(&self, spec: &SubscriptionSpec) -> VantageResult<()>;

    fn deliver(&self, event: ChangeEvent) -> VantageResult<()>;

    /// The connection was re-established after a loss; events may have
    /// been missed.
    fn reconnected(&self) -> VantageResult<()>;

    fn last_sequence(&self, entity: &str) -> Option<u64>;
}

impl ChangeSink for ChangeReconciler {
    fn listen(&self, spec: &SubscriptionSpec) -> VantageResult<()> {
        ChangeReconciler::listen(self, &spec.entity, spec.filter.clone())
    }

    fn forget(&self, spec: &SubscriptionSpec) -> VantageResult<()> {
        self.stop(&spec.entity, spec.filter.as_ref())
    }

    fn deliver(&self, event: ChangeEvent) -> VantageResult<()> {
        self.on_event(event).map(|_| ())
    }

    fn reconnected(&self) -> VantageResult<()> {
        self.on_reconnected().map(|_| ())
    }

    fn last_sequence(&self, entity: &str) -> Option<u64> {
        ChangeReconciler::last_sequence(self, entity)
    }
}
