//! Shared wiring for cache integration tests.

#![allow(dead_code)]

use serde_json::Value;
use std::sync::Arc;
use vantage_test_utils::fixtures::{appointment, booking_registry, slot, BookingServer};
use vantage_test_utils::{
    CacheKey, CacheStore, ChangeReconciler, InvalidationDispatcher, MockRemote, MutationConfig,
    MutationCoordinator, ReconcilerConfig, RemoteCall,
};

pub struct Harness {
    pub store: Arc<CacheStore>,
    pub remote: Arc<MockRemote>,
    pub dispatcher: Arc<InvalidationDispatcher>,
    pub coordinator: MutationCoordinator,
    pub reconciler: ChangeReconciler,
    pub server: BookingServer,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_configs(ReconcilerConfig::default(), MutationConfig::default())
    }

    pub fn with_configs(reconciler: ReconcilerConfig, mutation: MutationConfig) -> Self {
        Self::build(BookingServer::new(), reconciler, mutation)
    }

    /// Harness over a table holding appointments 1, 2 and 3 at 08:00, 09:00
    /// and 10:00, all booked.
    pub fn seeded() -> Self {
        Self::build(seed_server(), ReconcilerConfig::default(), MutationConfig::default())
    }

    pub fn seeded_with(reconciler: ReconcilerConfig, mutation: MutationConfig) -> Self {
        Self::build(seed_server(), reconciler, mutation)
    }

    fn build(server: BookingServer, reconciler: ReconcilerConfig, mutation: MutationConfig) -> Self {
        let store = Arc::new(CacheStore::with_defaults());
        let registry = Arc::new(booking_registry());
        let remote = Arc::new(MockRemote::new());
        server.install(&remote);

        let call: Arc<dyn RemoteCall> = remote.clone();
        let dispatcher = Arc::new(InvalidationDispatcher::new(
            store.clone(),
            registry.clone(),
            call.clone(),
        ));
        let coordinator = MutationCoordinator::new(
            store.clone(),
            registry.clone(),
            dispatcher.clone(),
            call,
            mutation,
        );
        let reconciler = ChangeReconciler::new(store.clone(), registry, dispatcher.clone(), reconciler);

        Self {
            store,
            remote,
            dispatcher,
            coordinator,
            reconciler,
            server,
        }
    }

    /// Fetch `key` into the store.
    pub async fn load(&self, key: &CacheKey) -> Value {
        self.dispatcher.fetch(key).await.expect("fetch should succeed")
    }

    /// Fetch `key` and register an observer for it.
    pub async fn load_observed(&self, key: &CacheKey) -> Value {
        let value = self.load(key).await;
        self.store.subscribe(key).expect("subscribe");
        value
    }

    pub fn value(&self, key: &CacheKey) -> Option<Value> {
        self.store.peek(key).expect("peek").and_then(|entry| entry.value)
    }
}

fn seed_server() -> BookingServer {
    BookingServer::with_rows(vec![
        appointment(1, &slot(8, 1), "booked"),
        appointment(2, &slot(9, 2), "booked"),
        appointment(3, &slot(10, 3), "booked"),
    ])
}

/// Ids of the rows of a cached list, in order.
pub fn ids(list: &Value) -> Vec<u64> {
    list.as_array()
        .map(|rows| rows.iter().filter_map(|row| row["id"].as_u64()).collect())
        .unwrap_or_default()
}

/// `list` without the row `id`.
pub fn without(list: &Value, id: u64) -> Value {
    Value::Array(
        list.as_array()
            .map(|rows| {
                rows.iter()
                    .filter(|row| row["id"].as_u64() != Some(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default(),
    )
}

/// `list` with the status of row `id` replaced.
pub fn with_status(list: &Value, id: u64, status: &str) -> Value {
    let mut list = list.clone();
    if let Some(rows) = list.as_array_mut() {
        for row in rows.iter_mut() {
            if row["id"].as_u64() == Some(id) {
                row["status"] = Value::from(status);
            }
        }
    }
    list
}

/// Give spawned tasks a chance to run on the current-thread runtime.
pub async fn drain_tasks() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}
