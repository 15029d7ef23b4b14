//! End-to-end tests: change events pushed through the connection manager
//! land in cached query results via the change reconciler.

use std::sync::Arc;
use std::time::Duration;
use vantage_cache::ReconcilerConfig;
use vantage_realtime::{ChangeSink, ConnectionManager, RealtimeConfig, ReconnectConfig, SubscriptionSpec};
use vantage_test_utils::fixtures::{
    appointment, booking_registry, list_key, slot, BookingServer, APPOINTMENTS,
};
use vantage_test_utils::{
    CacheStore, ChangeReconciler, ChannelError, ConnectionState, InvalidationDispatcher,
    MockPushSource, MockRemote, RegistryError, RemoteCall, VantageError,
};

// ============================================================================
// TEST CONFIGURATION
// ============================================================================

struct Live {
    store: Arc<CacheStore>,
    remote: Arc<MockRemote>,
    dispatcher: Arc<InvalidationDispatcher>,
    source: Arc<MockPushSource>,
    manager: Arc<ConnectionManager>,
    server: BookingServer,
}

fn live() -> Live {
    let server = BookingServer::with_rows(vec![
        appointment(1, &slot(8, 1), "booked"),
        appointment(2, &slot(9, 2), "booked"),
    ]);
    let store = Arc::new(CacheStore::with_defaults());
    let registry = Arc::new(booking_registry());
    let remote = Arc::new(MockRemote::new());
    server.install(&remote);
    let call: Arc<dyn RemoteCall> = remote.clone();

    let dispatcher = Arc::new(InvalidationDispatcher::new(store.clone(), registry.clone(), call));
    let reconciler: Arc<dyn ChangeSink> = Arc::new(ChangeReconciler::new(
        store.clone(),
        registry,
        dispatcher.clone(),
        ReconcilerConfig::default(),
    ));
    let source = Arc::new(MockPushSource::new());
    let config = RealtimeConfig::default().with_reconnect(ReconnectConfig {
        initial_ms: 100,
        max_ms: 1_000,
        multiplier: 2.0,
        jitter_ms: 0,
    });
    let manager = Arc::new(ConnectionManager::new(source.clone(), reconciler, config));

    Live {
        store,
        remote,
        dispatcher,
        source,
        manager,
        server,
    }
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

fn list_ids(store: &CacheStore) -> Vec<u64> {
    store
        .peek(&list_key())
        .unwrap()
        .and_then(|entry| entry.value)
        .and_then(|value| value.as_array().cloned())
        .unwrap_or_default()
        .iter()
        .filter_map(|row| row["id"].as_u64())
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_pushed_events_update_cached_list() {
    let t = live();
    t.dispatcher.fetch(&list_key()).await.unwrap();
    t.store.subscribe(&list_key()).unwrap();

    let _live = t.manager.subscribe(SubscriptionSpec::new(APPOINTMENTS)).unwrap();
    eventually("connection to open", || t.manager.state() == ConnectionState::Open).await;

    let connection = t.source.connection(1).unwrap();
    connection.sink().change(t.server.insert(7, "booked"));
    connection.sink().change(t.server.delete(2).unwrap());
    eventually("list to fold both events", || list_ids(&t.store) == vec![3, 1]).await;

    assert_eq!(t.remote.calls("appointment.list"), 1);
    assert_eq!(t.manager.subscriptions()[0].last_event_sequence, Some(2));
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_refetches_observed_queries() {
    let t = live();
    t.dispatcher.fetch(&list_key()).await.unwrap();
    t.store.subscribe(&list_key()).unwrap();

    let _live = t.manager.subscribe(SubscriptionSpec::new(APPOINTMENTS)).unwrap();
    eventually("connection to open", || t.manager.state() == ConnectionState::Open).await;

    t.source.connection(1).unwrap().sink().error(ChannelError::Transport {
        reason: "connection reset".to_string(),
    });
    // Changes made while the channel is down are never pushed.
    t.server.insert(12, "booked");

    eventually("second connection", || {
        t.source.attempts() == 2 && t.manager.state() == ConnectionState::Open
    })
    .await;
    t.dispatcher.settle().await;

    assert_eq!(t.remote.calls("appointment.list"), 2);
    assert_eq!(list_ids(&t.store), vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_subscription_to_unknown_entity_is_rejected() {
    let t = live();
    let err = t
        .manager
        .subscribe(SubscriptionSpec::new("invoices"))
        .err()
        .expect("unknown entity must be rejected");

    assert!(matches!(
        err,
        VantageError::Registry(RegistryError::UnknownEntity { .. })
    ));
    assert!(!t.manager.is_running());
    assert_eq!(t.manager.state(), ConnectionState::Closed);
}
