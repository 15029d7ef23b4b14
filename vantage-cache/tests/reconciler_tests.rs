//! Integration tests for the change event reconciler: folding by query
//! shape, sequence gap handling, duplicates, filters and reconnects.

use serde_json::json;
use vantage_cache::{ReconcileOutcome, ReconcilePhase};
use vantage_test_utils::fixtures::{
    appointment, detail_key, list_key, slot, stats_key, upcoming_filter, upcoming_key,
    APPOINTMENTS, CUSTOMERS,
};
use vantage_test_utils::{
    CacheKey, ChangeEvent, EntryStatus, FilterExpr, MutationConfig, ReconcilerConfig,
    RegistryError, RowId, VantageError,
};

#[path = "support/harness.rs"]
mod harness;
use harness::{drain_tasks, ids, Harness};

async fn listening() -> Harness {
    let h = Harness::seeded();
    h.load_observed(&list_key()).await;
    h.reconciler.listen(APPOINTMENTS, None).unwrap();
    h
}

// ============================================================================
// LIFECYCLE
// ============================================================================

#[tokio::test]
async fn test_events_for_idle_entities_are_ignored() {
    let h = Harness::seeded();
    h.load(&list_key()).await;
    let event = h.server.insert(12, "booked");

    assert_eq!(h.reconciler.phase(APPOINTMENTS), ReconcilePhase::Idle);
    assert_eq!(h.reconciler.on_event(event).unwrap(), ReconcileOutcome::Ignored);
    assert_eq!(ids(&h.value(&list_key()).unwrap()), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_listening_to_unknown_entity_fails() {
    let h = Harness::new();
    let err = h.reconciler.listen("invoices", None).unwrap_err();
    assert!(matches!(
        err,
        VantageError::Registry(RegistryError::UnknownEntity { .. })
    ));
}

#[tokio::test]
async fn test_entity_goes_idle_with_last_subscription() {
    let h = Harness::seeded();
    h.reconciler.listen(APPOINTMENTS, None).unwrap();
    h.reconciler.listen(APPOINTMENTS, Some(upcoming_filter())).unwrap();

    h.reconciler.stop(APPOINTMENTS, None).unwrap();
    assert_eq!(h.reconciler.phase(APPOINTMENTS), ReconcilePhase::Listening);
    h.reconciler.stop(APPOINTMENTS, Some(&upcoming_filter())).unwrap();
    assert_eq!(h.reconciler.phase(APPOINTMENTS), ReconcilePhase::Idle);
}

// ============================================================================
// FOLDING BY SHAPE
// ============================================================================

#[tokio::test]
async fn test_list_events_fold_without_refetch() {
    let h = listening().await;
    h.load_observed(&upcoming_key()).await;

    let inserted = h.server.insert(7, "booked");
    assert_eq!(
        h.reconciler.on_event(inserted).unwrap(),
        ReconcileOutcome::Folded { entries: 2 }
    );
    let cancelled = h.server.update(2, 9, "cancelled").unwrap();
    h.reconciler.on_event(cancelled).unwrap();

    assert_eq!(ids(&h.value(&list_key()).unwrap()), vec![4, 1, 2, 3]);
    assert_eq!(ids(&h.value(&upcoming_key()).unwrap()), vec![4, 1, 3]);
    assert_eq!(h.remote.calls("appointment.list"), 1);
    assert_eq!(h.remote.calls("appointment.upcoming"), 1);
    assert_eq!(h.reconciler.last_sequence(APPOINTMENTS), Some(2));
    assert_eq!(h.reconciler.phase(APPOINTMENTS), ReconcilePhase::Listening);
}

#[tokio::test]
async fn test_list_keyed_by_customer_folds_only_that_customers_rows() {
    let h = Harness::seeded();
    let mine = CacheKey::new("appointment", "list", json!({"customer": "customer-1"}));
    h.load_observed(&mine).await;
    h.reconciler.listen(APPOINTMENTS, None).unwrap();
    assert_eq!(ids(&h.value(&mine).unwrap()), vec![1]);

    // Rows 4 and 5 belong to customer-1 and customer-2.
    let fourth = h.server.insert(12, "booked");
    let fifth = h.server.insert(13, "booked");
    h.reconciler.on_event(fourth).unwrap();
    h.reconciler.on_event(fifth).unwrap();

    let list = h.value(&mine).unwrap();
    assert_eq!(ids(&list), vec![1, 4]);
    assert!(list.as_array().unwrap().iter().all(|row| row["customer"] == json!("customer-1")));
    assert_eq!(h.remote.calls("appointment.list"), 1);
}

#[tokio::test]
async fn test_list_with_unbound_param_is_refetched() {
    let h = Harness::seeded();
    let key = CacheKey::new("appointment", "upcoming", json!({"customer": "customer-1"}));
    h.load_observed(&key).await;
    h.reconciler.listen(APPOINTMENTS, None).unwrap();

    let inserted = h.server.insert(12, "booked");
    h.reconciler.on_event(inserted).unwrap();
    h.dispatcher.settle().await;

    assert_eq!(h.remote.calls("appointment.upcoming"), 2);
    assert_eq!(h.store.peek(&key).unwrap().unwrap().status, EntryStatus::Fresh);
}

#[tokio::test]
async fn test_detail_update_replaces_value() {
    let h = listening().await;
    h.load(&detail_key(2)).await;

    let event = h.server.update(2, 15, "completed").unwrap();
    h.reconciler.on_event(event).unwrap();

    let entry = h.store.peek(&detail_key(2)).unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::Fresh);
    assert_eq!(entry.value.unwrap()["status"], json!("completed"));
    assert_eq!(h.remote.calls("appointment.byId"), 1);
}

#[tokio::test]
async fn test_detail_update_supersedes_fetch_in_flight() {
    let h = listening().await;
    let before = h.load_observed(&detail_key(2)).await;
    // The pending refetch answers with the row as it was before the push.
    h.remote.respond("appointment.byId", before);
    let gate = h.remote.gate("appointment.byId");
    assert!(h.dispatcher.refetch(&detail_key(2)).unwrap());
    drain_tasks().await;

    let event = h.server.update(2, 15, "completed").unwrap();
    h.reconciler.on_event(event).unwrap();
    assert!(!h.dispatcher.is_in_flight(&detail_key(2)));

    gate.open();
    h.dispatcher.settle().await;
    drain_tasks().await;
    let entry = h.store.peek(&detail_key(2)).unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::Fresh);
    assert_eq!(entry.value.unwrap()["status"], json!("completed"));
    assert_eq!(h.remote.calls("appointment.byId"), 2);
}

#[tokio::test]
async fn test_detail_delete_marks_entry_stale() {
    let h = listening().await;
    let before = h.load(&detail_key(3)).await;
    h.load(&detail_key(1)).await;

    let event = h.server.delete(3).unwrap();
    h.reconciler.on_event(event).unwrap();

    let deleted = h.store.peek(&detail_key(3)).unwrap().unwrap();
    assert_eq!(deleted.status, EntryStatus::Stale);
    assert_eq!(deleted.value, Some(before));
    // Other ids are not addressed by the event.
    assert_eq!(
        h.store.peek(&detail_key(1)).unwrap().unwrap().status,
        EntryStatus::Fresh
    );
}

#[tokio::test]
async fn test_observed_detail_delete_refetches() {
    let h = listening().await;
    h.load_observed(&detail_key(3)).await;

    let event = h.server.delete(3).unwrap();
    h.reconciler.on_event(event).unwrap();
    h.dispatcher.settle().await;

    assert_eq!(h.remote.calls("appointment.byId"), 2);
    let entry = h.store.peek(&detail_key(3)).unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::Error);
    assert!(entry.value.is_some());
}

#[tokio::test]
async fn test_aggregates_are_refetched_not_folded() {
    let h = listening().await;
    h.load_observed(&stats_key()).await;

    let event = h.server.insert(16, "booked");
    h.reconciler.on_event(event).unwrap();
    h.dispatcher.settle().await;

    assert_eq!(h.remote.calls("dashboard.stats"), 2);
    assert_eq!(h.value(&stats_key()).unwrap()["total"], json!(4));
}

#[tokio::test]
async fn test_unfoldable_value_triggers_refetch() {
    let h = listening().await;
    h.store
        .set(&list_key(), Some(json!({"unexpected": true})), EntryStatus::Fresh)
        .unwrap();

    let event = h.server.insert(11, "booked");
    assert_eq!(
        h.reconciler.on_event(event).unwrap(),
        ReconcileOutcome::Folded { entries: 0 }
    );
    h.dispatcher.settle().await;
    assert_eq!(ids(&h.value(&list_key()).unwrap()), vec![1, 2, 3, 4]);
}

// ============================================================================
// SEQUENCING
// ============================================================================

#[tokio::test]
async fn test_sequence_gap_refetches_once_and_skips_fold() {
    let h = listening().await;
    let first = h.server.insert(11, "booked");
    let second = h.server.insert(12, "booked");
    let _lost = h.server.update(1, 8, "cancelled").unwrap();
    let fourth = h.server.insert(13, "booked");

    h.reconciler.on_event(first).unwrap();
    h.reconciler.on_event(second).unwrap();
    let folded = h.value(&list_key()).unwrap();
    assert_eq!(ids(&folded), vec![1, 2, 3, 4, 5]);

    let gate = h.remote.gate("appointment.list");
    assert_eq!(h.reconciler.on_event(fourth).unwrap(), ReconcileOutcome::Refetched);
    assert_eq!(h.reconciler.phase(APPOINTMENTS), ReconcilePhase::Refetching);
    // The event that exposed the gap was not folded.
    assert_eq!(h.value(&list_key()), Some(folded));

    gate.open();
    h.dispatcher.settle().await;
    assert_eq!(h.remote.calls("appointment.list"), 2);
    assert_eq!(ids(&h.value(&list_key()).unwrap()), vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(h.value(&list_key()).unwrap()[0]["status"], json!("cancelled"));

    // Folding resumes from the resynchronised sequence.
    let fifth = h.server.insert(14, "booked");
    assert_eq!(
        h.reconciler.on_event(fifth).unwrap(),
        ReconcileOutcome::Folded { entries: 1 }
    );
    assert_eq!(h.reconciler.phase(APPOINTMENTS), ReconcilePhase::Listening);
    assert_eq!(h.remote.calls("appointment.list"), 2);
}

#[tokio::test]
async fn test_sequence_at_numeric_limit_folds_without_overflow() {
    let h = listening().await;
    let near = ChangeEvent::inserted(
        APPOINTMENTS,
        RowId::from(4),
        appointment(4, &slot(11, 4), "booked"),
        u64::MAX - 1,
    );
    let last = ChangeEvent::inserted(
        APPOINTMENTS,
        RowId::from(5),
        appointment(5, &slot(12, 5), "booked"),
        u64::MAX,
    );

    h.reconciler.on_event(near).unwrap();
    assert_eq!(
        h.reconciler.on_event(last.clone()).unwrap(),
        ReconcileOutcome::Folded { entries: 1 }
    );
    assert_eq!(h.reconciler.on_event(last).unwrap(), ReconcileOutcome::Duplicate);
    assert_eq!(h.reconciler.last_sequence(APPOINTMENTS), Some(u64::MAX));
    assert_eq!(ids(&h.value(&list_key()).unwrap()), vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_duplicate_events_are_dropped() {
    let h = listening().await;
    let event = h.server.insert(11, "booked");

    h.reconciler.on_event(event.clone()).unwrap();
    let once = h.value(&list_key());
    assert_eq!(h.reconciler.on_event(event).unwrap(), ReconcileOutcome::Duplicate);
    assert_eq!(h.value(&list_key()), once);
}

#[tokio::test]
async fn test_reorder_window_buffers_out_of_order_events() {
    let h = Harness::seeded_with(
        ReconcilerConfig::default().with_reorder_window(2),
        MutationConfig::default(),
    );
    h.load_observed(&list_key()).await;
    h.reconciler.listen(APPOINTMENTS, None).unwrap();

    let first = h.server.insert(11, "booked");
    let second = h.server.insert(12, "booked");
    let third = h.server.delete(2).unwrap();

    h.reconciler.on_event(first).unwrap();
    assert_eq!(h.reconciler.on_event(third).unwrap(), ReconcileOutcome::Buffered);
    assert_eq!(h.reconciler.buffered(APPOINTMENTS), 1);
    assert_eq!(
        h.reconciler.on_event(second).unwrap(),
        ReconcileOutcome::Folded { entries: 2 }
    );

    assert_eq!(h.reconciler.buffered(APPOINTMENTS), 0);
    assert_eq!(h.reconciler.last_sequence(APPOINTMENTS), Some(3));
    assert_eq!(ids(&h.value(&list_key()).unwrap()), vec![1, 3, 4, 5]);
    assert_eq!(h.remote.calls("appointment.list"), 1);
}

#[tokio::test]
async fn test_full_reorder_window_falls_back_to_refetch() {
    let h = Harness::seeded_with(
        ReconcilerConfig::default().with_reorder_window(1),
        MutationConfig::default(),
    );
    h.load_observed(&list_key()).await;
    h.reconciler.listen(APPOINTMENTS, None).unwrap();

    let first = h.server.insert(11, "booked");
    let _second = h.server.insert(12, "booked");
    let third = h.server.insert(13, "booked");
    let fourth = h.server.insert(14, "booked");

    h.reconciler.on_event(first).unwrap();
    assert_eq!(h.reconciler.on_event(third).unwrap(), ReconcileOutcome::Buffered);
    assert_eq!(h.reconciler.on_event(fourth).unwrap(), ReconcileOutcome::Refetched);
    assert_eq!(h.reconciler.buffered(APPOINTMENTS), 0);

    h.dispatcher.settle().await;
    assert_eq!(ids(&h.value(&list_key()).unwrap()), vec![1, 2, 3, 4, 5, 6, 7]);
}

// ============================================================================
// FILTERS AND RECONNECTS
// ============================================================================

#[tokio::test]
async fn test_events_outside_every_filter_only_advance_sequence() {
    let h = Harness::seeded();
    h.load_observed(&list_key()).await;
    h.reconciler
        .listen(APPOINTMENTS, Some(FilterExpr::eq("status", json!("cancelled"))))
        .unwrap();

    let event = h.server.insert(11, "booked");
    assert_eq!(h.reconciler.on_event(event).unwrap(), ReconcileOutcome::Filtered);
    assert_eq!(h.reconciler.last_sequence(APPOINTMENTS), Some(1));
    assert_eq!(ids(&h.value(&list_key()).unwrap()), vec![1, 2, 3]);

    // A row moving into the filtered view is applied.
    let cancelled = h.server.update(2, 9, "cancelled").unwrap();
    assert_eq!(
        h.reconciler.on_event(cancelled).unwrap(),
        ReconcileOutcome::Folded { entries: 1 }
    );
    assert_eq!(h.value(&list_key()).unwrap()[1]["status"], json!("cancelled"));
}

#[tokio::test]
async fn test_reconnect_resets_baseline_and_refetches() {
    let h = listening().await;
    h.reconciler.on_event(h.server.insert(11, "booked")).unwrap();
    let _missed = h.server.insert(12, "booked");

    let reports = h.reconciler.on_reconnected().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].refetched, vec![list_key()]);
    assert_eq!(h.reconciler.last_sequence(APPOINTMENTS), None);
    h.dispatcher.settle().await;
    assert_eq!(ids(&h.value(&list_key()).unwrap()), vec![1, 2, 3, 4, 5]);

    // The first event after a reconnect becomes the new baseline.
    let next = h.server.insert(13, "booked");
    assert_eq!(
        h.reconciler.on_event(next).unwrap(),
        ReconcileOutcome::Folded { entries: 1 }
    );
    assert_eq!(h.reconciler.last_sequence(APPOINTMENTS), Some(3));
}

#[tokio::test]
async fn test_reconnect_without_refetch_keeps_entries() {
    let h = Harness::seeded_with(
        ReconcilerConfig::default().with_refetch_on_reconnect(false),
        MutationConfig::default(),
    );
    h.load_observed(&list_key()).await;
    h.reconciler.listen(APPOINTMENTS, None).unwrap();
    h.reconciler.listen(CUSTOMERS, None).unwrap();

    assert!(h.reconciler.on_reconnected().unwrap().is_empty());
    assert_eq!(
        h.store.peek(&list_key()).unwrap().unwrap().status,
        EntryStatus::Fresh
    );
}
