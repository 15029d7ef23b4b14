//! Query results handed to callers.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};
use vantage_cache::{CacheEntry, CacheStore, StoreEvent, StoreEventKind};
use vantage_core::{CacheKey, EntryStatus, VantageResult};

/// Value and freshness of one cached query at the time it was read.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySnapshot {
    pub key: CacheKey,
    pub value: Option<Value>,
    pub status: EntryStatus,
    /// Message of the last failed fetch while `status == Error`.
    pub error: Option<String>,
}

impl QuerySnapshot {
    pub fn is_fresh(&self) -> bool {
        self.status == EntryStatus::Fresh
    }
}

impl From<CacheEntry> for QuerySnapshot {
    fn from(entry: CacheEntry) -> Self {
        Self {
            key: entry.key,
            value: entry.value,
            status: entry.status,
            error: entry.error,
        }
    }
}

/// An observed query. While it lives the key counts as observed, so
/// invalidations refetch it in the background. Dropping it unsubscribes.
pub struct QueryWatch {
    store: Arc<CacheStore>,
    key: CacheKey,
    changes: broadcast::Receiver<StoreEvent>,
    active: bool,
}

impl QueryWatch {
    pub(crate) fn new(store: Arc<CacheStore>, key: CacheKey) -> VantageResult<Self> {
        // Listen before subscribing so no write after this point is missed.
        let changes = store.changes();
        store.subscribe(&key)?;
        Ok(Self {
            store,
            key,
            changes,
            active: true,
        })
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Current state of the watched entry.
    pub fn current(&self) -> VantageResult<Option<QuerySnapshot>> {
        Ok(self.store.peek(&self.key)?.map(QuerySnapshot::from))
    }

    /// Wait for the next write to the watched key and return the entry as
    /// it is afterwards. `None` once the entry was removed or the store is
    /// gone.
    pub async fn changed(&mut self) -> VantageResult<Option<QuerySnapshot>> {
        loop {
            match self.changes.recv().await {
                Ok(event) if event.key == self.key => {
                    if event.kind == StoreEventKind::Removed {
                        return Ok(None);
                    }
                    return self.current();
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(key = %self.key, skipped, "Query watch lagged, re-reading entry");
                    return self.current();
                }
                Err(RecvError::Closed) => return Ok(None),
            }
        }
    }

    /// Wait until the entry settles (`Fresh` or `Error`).
    pub async fn settled(&self) -> VantageResult<Option<QuerySnapshot>> {
        Ok(self
            .store
            .wait_until_settled(&self.key)
            .await?
            .map(QuerySnapshot::from))
    }

    pub fn unsubscribe(mut self) -> VantageResult<()> {
        self.active = false;
        self.store.unsubscribe(&self.key)?;
        Ok(())
    }
}

impl Drop for QueryWatch {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Err(err) = self.store.unsubscribe(&self.key) {
            warn!(key = %self.key, error = %err, "Failed to release query watch");
        }
    }
}
