//! Invalidation dispatcher.
//!
//! Resolves an entity name to the cached keys that depend on it, marks them
//! stale and refetches the ones somebody is observing. All fetches, whether
//! triggered by a first-time query or by invalidation, go through
//! [`InvalidationDispatcher::fetch`], which keeps at most one request in
//! flight per key: concurrent requesters share the same result.

use futures_util::future::{join_all, BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};
use vantage_core::{CacheKey, RemoteCall, RemoteError, StoreError, VantageError, VantageResult};

use crate::registry::Registry;
use crate::store::{CacheStore, FetchToken};

type SharedFetch = Shared<BoxFuture<'static, Result<Value, RemoteError>>>;
type InFlightMap = Arc<Mutex<HashMap<CacheKey, InFlight>>>;

struct InFlight {
    token: FetchToken,
    future: SharedFetch,
}

/// Summary of one `invalidate` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvalidationReport {
    pub entity: String,
    /// Keys marked stale.
    pub marked: usize,
    /// Observed keys a refetch was scheduled (or joined) for.
    pub refetched: Vec<CacheKey>,
}

pub struct InvalidationDispatcher {
    store: Arc<CacheStore>,
    registry: Arc<Registry>,
    remote: Arc<dyn RemoteCall>,
    in_flight: InFlightMap,
}

impl InvalidationDispatcher {
    pub fn new(store: Arc<CacheStore>, registry: Arc<Registry>, remote: Arc<dyn RemoteCall>) -> Self {
        Self {
            store,
            registry,
            remote,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn in_flight(&self) -> Result<MutexGuard<'_, HashMap<CacheKey, InFlight>>, StoreError> {
        self.in_flight.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Mark every cached key of `entity` stale and refetch the observed ones.
    ///
    /// Idempotent: repeating the call while refetches are in flight joins
    /// the existing fetches instead of issuing new ones. Must be called from
    /// within a Tokio runtime.
    pub fn invalidate(&self, entity: &str) -> VantageResult<InvalidationReport> {
        let resources = self.registry.resources_of(entity)?;
        let keys = self.store.keys_for_resources(&resources)?;

        let mut report = InvalidationReport {
            entity: entity.to_string(),
            ..InvalidationReport::default()
        };
        for key in keys {
            let observed = self.store.batch(|b| {
                b.mark_stale(&key);
                b.subscribers(&key) > 0
            })?;
            report.marked += 1;
            if observed {
                self.start_fetch(&key)?;
                report.refetched.push(key);
            }
        }

        info!(
            entity = %entity,
            marked = report.marked,
            refetched = report.refetched.len(),
            "Invalidated entity"
        );
        Ok(report)
    }

    /// Refetch `key` if anybody observes it; otherwise just mark it stale.
    /// Returns whether a fetch was scheduled.
    pub fn refetch(&self, key: &CacheKey) -> VantageResult<bool> {
        let observed = self.store.batch(|b| {
            b.mark_stale(key);
            b.subscribers(key) > 0
        })?;
        if observed {
            self.start_fetch(key)?;
        }
        Ok(observed)
    }

    /// Start a fetch in the background without waiting for it.
    pub fn schedule_refetch(&self, key: &CacheKey) -> VantageResult<()> {
        self.start_fetch(key)?;
        Ok(())
    }

    /// Fetch `key` from the remote, joining the in-flight fetch if there is one.
    pub async fn fetch(&self, key: &CacheKey) -> VantageResult<Value> {
        let fetch = self.start_fetch(key)?;
        fetch.await.map_err(|source| VantageError::Fetch {
            key: key.to_string(),
            source,
        })
    }

    /// Supersede the in-flight fetch of `key`, if any. Its result will not be
    /// written to the store. Returns whether a fetch was cancelled.
    pub fn cancel(&self, key: &CacheKey) -> VantageResult<bool> {
        let mut in_flight = self.in_flight()?;
        let removed = in_flight.remove(key).is_some();
        let cancelled = self.store.cancel_fetch(key)?;
        if removed || cancelled {
            debug!(key = %key, "Cancelled in-flight fetch");
        }
        Ok(removed || cancelled)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.in_flight()
            .map(|m| m.contains_key(key))
            .unwrap_or(false)
    }

    /// Wait until no fetch is in flight.
    pub async fn settle(&self) {
        loop {
            let pending: Vec<SharedFetch> = match self.in_flight() {
                Ok(map) => map.values().map(|f| f.future.clone()).collect(),
                Err(_) => return,
            };
            if pending.is_empty() {
                return;
            }
            join_all(pending).await;
            tokio::task::yield_now().await;
        }
    }

    fn start_fetch(&self, key: &CacheKey) -> VantageResult<SharedFetch> {
        let mut in_flight = self.in_flight()?;
        if let Some(existing) = in_flight.get(key) {
            debug!(key = %key, "Joining in-flight fetch");
            return Ok(existing.future.clone());
        }

        let token = self.store.begin_fetch(key)?;
        let procedure = key.procedure();
        let task = tokio::spawn(run_fetch(
            self.store.clone(),
            self.remote.clone(),
            self.in_flight.clone(),
            key.clone(),
            token,
        ));
        let future = async move {
            match task.await {
                Ok(result) => result,
                Err(join) => Err(RemoteError::Network {
                    procedure,
                    reason: format!("fetch task failed: {}", join),
                }),
            }
        }
        .boxed()
        .shared();

        in_flight.insert(
            key.clone(),
            InFlight {
                token,
                future: future.clone(),
            },
        );
        debug!(key = %key, "Started fetch");
        Ok(future)
    }
}

async fn run_fetch(
    store: Arc<CacheStore>,
    remote: Arc<dyn RemoteCall>,
    in_flight: InFlightMap,
    key: CacheKey,
    token: FetchToken,
) -> Result<Value, RemoteError> {
    let result = remote.call(&key.procedure(), key.params().clone()).await;

    let applied = match &result {
        Ok(value) => store.complete_fetch(&key, token, value.clone()),
        Err(err) => {
            warn!(key = %key, error = %err, "Fetch failed");
            store.fail_fetch(&key, token, err)
        }
    };
    if let Err(err) = applied {
        error!(key = %key, error = %err, "Failed to record fetch result");
    }

    if let Ok(mut map) = in_flight.lock() {
        if map.get(&key).map(|f| f.token) == Some(token) {
            map.remove(&key);
        }
    }
    result
}
