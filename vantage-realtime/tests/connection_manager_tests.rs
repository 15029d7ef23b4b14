//! Integration tests for the streaming connection manager: subscription
//! reference counting, heartbeat monitoring, reconnect with backoff and
//! ordered delivery of events buffered across a reconnect.
//!
//! All tests run on a paused clock; sleeps advance virtual time.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use vantage_realtime::{ConnectionManager, RealtimeConfig, ReconnectConfig, SubscriptionSpec};
use vantage_test_utils::fixtures::{appointment, slot, upcoming_filter, APPOINTMENTS, CUSTOMERS};
use vantage_test_utils::{
    ChangeEvent, ChannelError, ConnectionState, MockPushSource, RecordingSink, RowId,
};

// ============================================================================
// TEST CONFIGURATION
// ============================================================================

fn test_config() -> RealtimeConfig {
    RealtimeConfig::default()
        .with_heartbeat_timeout(Duration::from_secs(30))
        .with_monitor_interval(Duration::from_secs(5))
        .with_reconnect(ReconnectConfig {
            initial_ms: 100,
            max_ms: 1_000,
            multiplier: 2.0,
            jitter_ms: 0,
        })
}

struct Fixture {
    manager: Arc<ConnectionManager>,
    source: Arc<MockPushSource>,
    sink: Arc<RecordingSink>,
}

fn fixture() -> Fixture {
    let source = Arc::new(MockPushSource::new());
    let sink = Arc::new(RecordingSink::new());
    let manager = Arc::new(ConnectionManager::new(
        source.clone(),
        sink.clone(),
        test_config(),
    ));
    Fixture {
        manager,
        source,
        sink,
    }
}

fn event(sequence: u64) -> ChangeEvent {
    ChangeEvent::inserted(
        APPOINTMENTS,
        RowId::from(sequence),
        appointment(sequence, &slot(9, sequence), "booked"),
        sequence,
    )
}

/// Poll `condition` for up to one virtual second.
async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn wait_open(f: &Fixture, attempts: usize) {
    eventually("connection to open", || {
        f.manager.state() == ConnectionState::Open && f.source.attempts() == attempts
    })
    .await;
}

// ============================================================================
// SUBSCRIPTIONS
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_first_subscription_opens_connection() {
    let f = fixture();
    assert_eq!(f.manager.state(), ConnectionState::Closed);
    assert!(!f.manager.is_running());

    let _live = f.manager.subscribe(SubscriptionSpec::new(APPOINTMENTS)).unwrap();
    assert_eq!(f.manager.state(), ConnectionState::Connecting);
    wait_open(&f, 1).await;

    let connection = f.source.connection(1).unwrap();
    assert_eq!(connection.subscribed_entities(), vec![APPOINTMENTS.to_string()]);
    assert_eq!(f.sink.listening(), vec![SubscriptionSpec::new(APPOINTMENTS)]);
}

#[tokio::test(start_paused = true)]
async fn test_shared_subscription_is_reference_counted() {
    let f = fixture();
    let first = f.manager.subscribe(SubscriptionSpec::new(APPOINTMENTS)).unwrap();
    let second = f.manager.subscribe(SubscriptionSpec::new(APPOINTMENTS)).unwrap();
    wait_open(&f, 1).await;

    let subscriptions = f.manager.subscriptions();
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(subscriptions[0].holders, 2);
    assert_eq!(subscriptions[0].connection_id, Some(1));
    let connection = f.source.connection(1).unwrap();
    assert_eq!(connection.subscriptions().len(), 1);

    drop(first);
    assert!(f.manager.is_running());
    assert_eq!(f.manager.subscriptions()[0].holders, 1);
    assert_eq!(f.manager.state(), ConnectionState::Open);

    second.unsubscribe().unwrap();
    assert_eq!(f.manager.state(), ConnectionState::Closed);
    assert!(!f.manager.is_running());
    assert!(f.manager.subscriptions().is_empty());
    eventually("channel to close", || connection.is_closed()).await;
    assert!(f.sink.listening().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_subscriptions_on_open_channel_are_forwarded() {
    let f = fixture();
    let _appointments = f.manager.subscribe(SubscriptionSpec::new(APPOINTMENTS)).unwrap();
    wait_open(&f, 1).await;
    let connection = f.source.connection(1).unwrap();

    let customers = f.manager.subscribe(SubscriptionSpec::new(CUSTOMERS)).unwrap();
    let _upcoming = f
        .manager
        .subscribe(SubscriptionSpec::filtered(APPOINTMENTS, upcoming_filter()))
        .unwrap();
    eventually("subscriptions to reach the channel", || connection.subscriptions().len() == 3).await;

    drop(customers);
    eventually("unsubscribe to reach the channel", || {
        !connection.subscribed_entities().contains(&CUSTOMERS.to_string())
    })
    .await;
    assert_eq!(f.manager.state(), ConnectionState::Open);
    assert_eq!(f.source.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_releases_every_subscription() {
    let f = fixture();
    let live = f.manager.subscribe(SubscriptionSpec::new(APPOINTMENTS)).unwrap();
    let _other = f.manager.subscribe(SubscriptionSpec::new(CUSTOMERS)).unwrap();
    wait_open(&f, 1).await;

    f.manager.shutdown().await;
    assert_eq!(f.manager.state(), ConnectionState::Closed);
    assert!(f.source.connection(1).unwrap().is_closed());
    assert!(f.sink.listening().is_empty());

    // Releasing after shutdown is a no-op.
    live.unsubscribe().unwrap();
    assert!(f.sink.listening().is_empty());
}

// ============================================================================
// DELIVERY
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_change_events_are_delivered_in_order() {
    let f = fixture();
    let _live = f.manager.subscribe(SubscriptionSpec::new(APPOINTMENTS)).unwrap();
    wait_open(&f, 1).await;

    let connection = f.source.connection(1).unwrap();
    for sequence in 1..=3 {
        assert!(connection.sink().change(event(sequence)));
    }
    f.sink.wait_for_events(3).await;

    assert_eq!(f.sink.sequences(), vec![1, 2, 3]);
    assert_eq!(f.manager.subscriptions()[0].last_event_sequence, Some(3));
}

#[tokio::test(start_paused = true)]
async fn test_events_during_reconnect_are_buffered_in_order() {
    let f = fixture();
    let gate = f.source.gate_attempt(2);
    let _live = f.manager.subscribe(SubscriptionSpec::new(APPOINTMENTS)).unwrap();
    wait_open(&f, 1).await;

    let first = f.source.connection(1).unwrap();
    first.sink().change(event(1));
    f.sink.wait_for_events(1).await;

    first.sink().closed();
    eventually("second connect attempt", || f.source.attempts() == 2).await;
    assert_eq!(f.manager.state(), ConnectionState::Reconnecting);
    assert!(f.manager.state().is_degraded());
    assert!(first.is_closed());

    let second = f.source.connection(2).unwrap();
    second.sink().change(event(2));
    second.sink().change(event(3));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(f.sink.sequences(), vec![1]);

    gate.open();
    wait_open(&f, 2).await;
    f.sink.wait_for_events(3).await;
    assert_eq!(f.sink.sequences(), vec![1, 2, 3]);

    // Live traffic on the new channel lands after everything buffered.
    second.sink().change(event(4));
    f.sink.wait_for_events(4).await;

    assert_eq!(f.sink.sequences(), vec![1, 2, 3, 4]);
    assert_eq!(f.sink.reconnects(), 1);
    assert_eq!(second.subscribed_entities(), vec![APPOINTMENTS.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_late_events_from_replaced_channel_are_kept() {
    let f = fixture();
    let _live = f.manager.subscribe(SubscriptionSpec::new(APPOINTMENTS)).unwrap();
    wait_open(&f, 1).await;

    let first = f.source.connection(1).unwrap();
    first.sink().error(ChannelError::Transport {
        reason: "reset by peer".to_string(),
    });
    wait_open(&f, 2).await;

    first.sink().change(event(1));
    f.sink.wait_for_events(1).await;
    assert_eq!(f.sink.sequences(), vec![1]);
    assert_eq!(f.manager.state(), ConnectionState::Open);
}

// ============================================================================
// HEARTBEAT AND RECONNECT
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_silent_connection_is_replaced() {
    let f = fixture();
    let _live = f.manager.subscribe(SubscriptionSpec::new(APPOINTMENTS)).unwrap();
    wait_open(&f, 1).await;

    tokio::time::sleep(Duration::from_secs(36)).await;
    wait_open(&f, 2).await;

    assert!(f.source.connection(1).unwrap().is_closed());
    assert_eq!(f.sink.reconnects(), 1);
    assert_eq!(f.manager.subscriptions()[0].connection_id, Some(2));
}

#[tokio::test(start_paused = true)]
async fn test_keep_alives_hold_connection_open() {
    let f = fixture();
    let _live = f.manager.subscribe(SubscriptionSpec::new(APPOINTMENTS)).unwrap();
    wait_open(&f, 1).await;
    let connection = f.source.connection(1).unwrap();

    for _ in 0..6 {
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(connection.sink().keep_alive());
    }

    assert_eq!(f.source.attempts(), 1);
    assert_eq!(f.manager.state(), ConnectionState::Open);
    assert!(!connection.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_failed_connect_retries_after_backoff() {
    let f = fixture();
    f.source.fail_attempt(1);
    f.source.fail_attempt(2);
    let started = Instant::now();

    let _live = f.manager.subscribe(SubscriptionSpec::new(APPOINTMENTS)).unwrap();
    wait_open(&f, 3).await;

    // 100ms then 200ms of backoff.
    assert!(started.elapsed() >= Duration::from_millis(300));
    // Never opened before, so nothing to resynchronise.
    assert_eq!(f.sink.reconnects(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_state_changes_are_observable() {
    let f = fixture();
    let mut states = f.manager.watch_state();
    let _live = f.manager.subscribe(SubscriptionSpec::new(APPOINTMENTS)).unwrap();

    states
        .wait_for(|state| *state == ConnectionState::Open)
        .await
        .unwrap();
    f.source.connection(1).unwrap().sink().closed();
    let degraded = states.wait_for(|state| state.is_degraded()).await.unwrap();
    assert!(matches!(
        *degraded,
        ConnectionState::Degraded | ConnectionState::Reconnecting
    ));
    drop(degraded);

    states
        .wait_for(|state| *state == ConnectionState::Open)
        .await
        .unwrap();
    assert_eq!(f.source.attempts(), 2);
}
