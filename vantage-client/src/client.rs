//! The client context object.
//!
//! [`VantageClient`] assembles one instance of every component around a
//! shared store and tears the push connection down on `shutdown`. There is
//! no global state: two clients in one process are fully independent.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};
use vantage_cache::{
    CacheStats, CacheStore, ChangeReconciler, InvalidationDispatcher, InvalidationReport,
    MutationCoordinator, Registry,
};
use vantage_core::{
    CacheKey, ConnectionState, EntryStatus, FilterExpr, RemoteCall, VantageResult,
};
use vantage_realtime::{ChangeSink, ConnectionManager, LiveSubscription, PushSource, SubscriptionSpec};

use crate::config::VantageConfig;
use crate::query::{QuerySnapshot, QueryWatch};

pub struct VantageClient {
    registry: Arc<Registry>,
    store: Arc<CacheStore>,
    dispatcher: Arc<InvalidationDispatcher>,
    coordinator: MutationCoordinator,
    reconciler: Arc<ChangeReconciler>,
    connections: Arc<ConnectionManager>,
}

impl VantageClient {
    /// Build a client. The configuration is validated first; the registry
    /// was validated when it was built.
    pub fn new(
        config: &VantageConfig,
        registry: Registry,
        remote: Arc<dyn RemoteCall>,
        push: Arc<dyn PushSource>,
    ) -> VantageResult<Self> {
        config.validate()?;

        let registry = Arc::new(registry);
        let store = Arc::new(CacheStore::new(config.cache_config()));
        let dispatcher = Arc::new(InvalidationDispatcher::new(
            store.clone(),
            registry.clone(),
            remote.clone(),
        ));
        let coordinator = MutationCoordinator::new(
            store.clone(),
            registry.clone(),
            dispatcher.clone(),
            remote,
            config.mutation_config(),
        );
        let reconciler = Arc::new(ChangeReconciler::new(
            store.clone(),
            registry.clone(),
            dispatcher.clone(),
            config.reconciler_config(),
        ));
        let sink: Arc<dyn ChangeSink> = reconciler.clone();
        let connections = Arc::new(ConnectionManager::new(push, sink, config.realtime_config()));

        info!(
            max_entries = config.cache.max_entries,
            entities = registry.entities().count(),
            "VANTAGE client ready"
        );
        Ok(Self {
            registry,
            store,
            dispatcher,
            coordinator,
            reconciler,
            connections,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn reconciler(&self) -> &ChangeReconciler {
        &self.reconciler
    }

    /// Canonical key of a registered query.
    pub fn key(&self, resource: &str, operation: &str, params: Value) -> VantageResult<CacheKey> {
        Ok(self.registry.key(resource, operation, params)?)
    }

    pub async fn query(&self, resource: &str, operation: &str, params: Value) -> VantageResult<QuerySnapshot> {
        let key = self.key(resource, operation, params)?;
        self.query_key(&key).await
    }

    /// Read `key` through the cache.
    ///
    /// A fresh value is returned as is. A stale or failed value is returned
    /// immediately while a refetch runs in the background. Without a value
    /// the call waits for the (shared) fetch.
    pub async fn query_key(&self, key: &CacheKey) -> VantageResult<QuerySnapshot> {
        if let Some(entry) = self.store.get(key)? {
            if entry.value.is_some() {
                match entry.status {
                    EntryStatus::Fresh | EntryStatus::Fetching => {}
                    EntryStatus::Stale | EntryStatus::Error => {
                        debug!(key = %key, status = %entry.status, "Serving stale value, revalidating");
                        self.dispatcher.schedule_refetch(key)?;
                    }
                }
                return Ok(entry.into());
            }
        }

        let value = self.dispatcher.fetch(key).await?;
        Ok(match self.store.peek(key)? {
            Some(entry) if entry.value.is_some() => entry.into(),
            _ => QuerySnapshot {
                key: key.clone(),
                value: Some(value),
                status: EntryStatus::Fresh,
                error: None,
            },
        })
    }

    /// Cached state of `key` without fetching or touching recency.
    pub fn peek(&self, key: &CacheKey) -> VantageResult<Option<QuerySnapshot>> {
        Ok(self.store.peek(key)?.map(QuerySnapshot::from))
    }

    /// Observe a query. The entry is fetched in the background unless it is
    /// already fresh or being fetched.
    pub fn watch_query(&self, resource: &str, operation: &str, params: Value) -> VantageResult<QueryWatch> {
        let key = self.key(resource, operation, params)?;
        self.watch_key(key)
    }

    pub fn watch_key(&self, key: CacheKey) -> VantageResult<QueryWatch> {
        let watch = QueryWatch::new(self.store.clone(), key.clone())?;
        let settled = self
            .store
            .peek(&key)?
            .map(|entry| entry.value.is_some() && matches!(entry.status, EntryStatus::Fresh | EntryStatus::Fetching))
            .unwrap_or(false);
        if !settled {
            self.dispatcher.schedule_refetch(&key)?;
        }
        Ok(watch)
    }

    /// Run a registered mutation with an optimistic cache update.
    ///
    /// `update_cache` sees every cached key of the mutation's entities and
    /// returns the speculative value for the keys it wants to change.
    pub async fn mutate<F>(&self, mutation: &str, input: Value, update_cache: F) -> VantageResult<Value>
    where
        F: FnMut(&CacheKey, Option<&Value>) -> Option<Value>,
    {
        self.coordinator.run(mutation, input, update_cache).await
    }

    /// Like [`VantageClient::mutate`], also offering `targets` that may not
    /// be cached yet.
    pub async fn mutate_targeted<F>(
        &self,
        mutation: &str,
        input: Value,
        targets: &[CacheKey],
        update_cache: F,
    ) -> VantageResult<Value>
    where
        F: FnMut(&CacheKey, Option<&Value>) -> Option<Value>,
    {
        self.coordinator
            .run_targeted(mutation, input, targets, update_cache)
            .await
    }

    /// Mark every cached query of `entity` stale and refetch observed ones.
    pub fn invalidate(&self, entity: &str) -> VantageResult<InvalidationReport> {
        self.dispatcher.invalidate(entity)
    }

    /// Receive change events for `entity`, optionally restricted by `filter`.
    pub fn subscribe_live(&self, entity: &str, filter: Option<FilterExpr>) -> VantageResult<LiveSubscription> {
        let spec = match filter {
            Some(filter) => SubscriptionSpec::filtered(entity, filter),
            None => SubscriptionSpec::new(entity),
        };
        self.connections.subscribe(spec)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connections.state()
    }

    /// Watch connection state; `Degraded` or `Reconnecting` means live
    /// updates may be missing.
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connections.watch_state()
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn stats(&self) -> VantageResult<CacheStats> {
        Ok(self.store.stats()?)
    }

    /// Wait until no query fetch is in flight.
    pub async fn settle(&self) {
        self.dispatcher.settle().await;
    }

    /// Close the push connection and release every live subscription.
    pub async fn shutdown(&self) {
        self.connections.shutdown().await;
        info!("VANTAGE client shut down");
    }
}
