//! Query cache store.
//!
//! The store is the single shared mutable structure of the engine: every
//! other component reads and writes cached values only through this API.
//! State lives behind a synchronous mutex that is never held across an
//! `.await`; multi-key operations go through [`CacheStore::batch`], which
//! runs a closure under one lock acquisition so no other writer can observe
//! a half-applied batch.
//!
//! # Guarantees
//!
//! - `set`, `fold` and `mark_stale` are idempotent for identical input.
//! - An entry is never `Fresh` without a value: `set(key, None, Fresh)` is
//!   stored as `Stale`.
//! - Fetch results carry a [`FetchToken`]; a result whose token is no longer
//!   the latest for its key is dropped silently.

use chrono::Utc;
use lru::LruCache;
use serde_json::Value;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, trace};
use vantage_core::{CacheKey, EntryStatus, RemoteError, StoreError, Timestamp};

use crate::config::CacheConfig;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// A cached query result plus metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub value: Option<Value>,
    pub status: EntryStatus,
    pub last_updated: Timestamp,
    /// Number of live observers of this key.
    pub subscribers: usize,
    /// Message of the last failed fetch, while `status == Error`.
    pub error: Option<String>,
}

impl CacheEntry {
    fn placeholder(key: CacheKey, status: EntryStatus) -> Self {
        Self {
            key,
            value: None,
            status,
            last_updated: Utc::now(),
            subscribers: 0,
            error: None,
        }
    }
}

/// Exact pre-mutation state of one key.
#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot {
    /// No entry existed.
    Absent,
    /// The entry's value and status.
    Present {
        value: Option<Value>,
        status: EntryStatus,
    },
}

impl Snapshot {
    pub fn value(&self) -> Option<&Value> {
        match self {
            Snapshot::Absent => None,
            Snapshot::Present { value, .. } => value.as_ref(),
        }
    }
}

/// Identifies one fetch attempt for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FetchToken(u64);

/// Change notification published after every store write.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreEvent {
    pub key: CacheKey,
    pub kind: StoreEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEventKind {
    Updated(EntryStatus),
    Removed,
}

/// Statistics about store usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads that found a value.
    pub hits: u64,
    /// Reads that found no value.
    pub misses: u64,
    /// Number of entries currently in the store.
    pub entry_count: u64,
    /// Number of evictions due to capacity.
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Slot {
    entry: CacheEntry,
    /// Token of the fetch whose result will be accepted, if any.
    in_flight: Option<u64>,
}

struct StoreState {
    entries: LruCache<CacheKey, Slot>,
    next_token: u64,
    stats: CacheStats,
}

/// In-memory map from canonical key to cached result.
pub struct CacheStore {
    state: Mutex<StoreState>,
    config: CacheConfig,
    changes: broadcast::Sender<StoreEvent>,
}

impl CacheStore {
    pub fn new(config: CacheConfig) -> Self {
        let (changes, _rx) = broadcast::channel(config.change_feed_capacity.max(1));
        Self {
            state: Mutex::new(StoreState {
                entries: LruCache::unbounded(),
                next_token: 1,
                stats: CacheStats::default(),
            }),
            config,
            changes,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(CacheConfig::default())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, StoreState>> {
        self.state.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Run several reads and writes under a single lock acquisition.
    ///
    /// The closure must not block; change events are published after the
    /// lock is released.
    pub fn batch<R>(&self, f: impl FnOnce(&mut StoreBatch<'_>) -> R) -> StoreResult<R> {
        let (result, events) = {
            let mut guard = self.lock()?;
            let mut batch = StoreBatch {
                state: &mut *guard,
                max_entries: self.config.max_entries,
                now: Utc::now(),
                events: Vec::new(),
            };
            let result = f(&mut batch);
            let events = std::mem::take(&mut batch.events);
            guard.stats.entry_count = guard.entries.len() as u64;
            (result, events)
        };
        for event in events {
            // No receivers is fine.
            let _ = self.changes.send(event);
        }
        Ok(result)
    }

    /// Read an entry, marking it most recently used.
    pub fn get(&self, key: &CacheKey) -> StoreResult<Option<CacheEntry>> {
        let mut guard = self.lock()?;
        let entry = guard.entries.get(key).map(|slot| slot.entry.clone());
        match entry.as_ref().and_then(|e| e.value.as_ref()) {
            Some(_) => guard.stats.hits += 1,
            None => guard.stats.misses += 1,
        }
        Ok(entry)
    }

    /// Read an entry without touching recency or statistics.
    pub fn peek(&self, key: &CacheKey) -> StoreResult<Option<CacheEntry>> {
        let guard = self.lock()?;
        Ok(guard.entries.peek(key).map(|slot| slot.entry.clone()))
    }

    /// Replace the value and status of `key`.
    pub fn set(&self, key: &CacheKey, value: Option<Value>, status: EntryStatus) -> StoreResult<()> {
        self.batch(|b| b.set(key, value, status))
    }

    /// Mark `key` stale, leaving its value readable.
    pub fn mark_stale(&self, key: &CacheKey) -> StoreResult<bool> {
        self.batch(|b| b.mark_stale(key))
    }

    /// Transform the cached value in place. Returns `false` when there is no
    /// value to transform.
    pub fn fold(&self, key: &CacheKey, updater: impl FnOnce(&Value) -> Value) -> StoreResult<bool> {
        self.batch(|b| b.fold(key, updater))
    }

    /// Remove `key` if nobody observes it.
    pub fn evict(&self, key: &CacheKey) -> StoreResult<bool> {
        self.batch(|b| {
            let removable = b
                .state
                .entries
                .peek(key)
                .map(|slot| slot.entry.subscribers == 0)
                .unwrap_or(false);
            if removable {
                b.remove(key);
            }
            removable
        })
    }

    /// Register an observer of `key`, creating a stale placeholder if needed.
    pub fn subscribe(&self, key: &CacheKey) -> StoreResult<usize> {
        self.batch(|b| {
            let slot = b.slot_or_insert(key, EntryStatus::Stale);
            slot.entry.subscribers += 1;
            slot.entry.subscribers
        })
    }

    /// Drop one observer of `key`.
    pub fn unsubscribe(&self, key: &CacheKey) -> StoreResult<usize> {
        let mut guard = self.lock()?;
        Ok(match guard.entries.peek_mut(key) {
            Some(slot) => {
                slot.entry.subscribers = slot.entry.subscribers.saturating_sub(1);
                slot.entry.subscribers
            }
            None => 0,
        })
    }

    /// Start a fetch for `key`, superseding any fetch already in flight.
    pub fn begin_fetch(&self, key: &CacheKey) -> StoreResult<FetchToken> {
        self.batch(|b| {
            let token = b.state.next_token;
            b.state.next_token += 1;
            let now = b.now;
            let slot = b.slot_or_insert(key, EntryStatus::Fetching);
            slot.in_flight = Some(token);
            slot.entry.status = EntryStatus::Fetching;
            slot.entry.last_updated = now;
            b.events.push(StoreEvent {
                key: key.clone(),
                kind: StoreEventKind::Updated(EntryStatus::Fetching),
            });
            FetchToken(token)
        })
    }

    /// Apply a fetch result if `token` is still the latest for `key`.
    pub fn complete_fetch(&self, key: &CacheKey, token: FetchToken, value: Value) -> StoreResult<bool> {
        self.batch(|b| {
            let now = b.now;
            let accepted = match b.state.entries.get_mut(key) {
                Some(slot) if slot.in_flight == Some(token.0) => {
                    slot.in_flight = None;
                    slot.entry.value = Some(value);
                    slot.entry.status = EntryStatus::Fresh;
                    slot.entry.error = None;
                    slot.entry.last_updated = now;
                    true
                }
                _ => false,
            };
            if accepted {
                b.events.push(StoreEvent {
                    key: key.clone(),
                    kind: StoreEventKind::Updated(EntryStatus::Fresh),
                });
            } else {
                debug!(key = %key, "Dropping superseded fetch result");
            }
            accepted
        })
    }

    /// Record a failed fetch if `token` is still the latest for `key`.
    pub fn fail_fetch(&self, key: &CacheKey, token: FetchToken, error: &RemoteError) -> StoreResult<bool> {
        self.batch(|b| {
            let now = b.now;
            let accepted = match b.state.entries.get_mut(key) {
                Some(slot) if slot.in_flight == Some(token.0) => {
                    slot.in_flight = None;
                    slot.entry.status = EntryStatus::Error;
                    slot.entry.error = Some(error.to_string());
                    slot.entry.last_updated = now;
                    true
                }
                _ => false,
            };
            if accepted {
                b.events.push(StoreEvent {
                    key: key.clone(),
                    kind: StoreEventKind::Updated(EntryStatus::Error),
                });
            }
            accepted
        })
    }

    /// Invalidate the in-flight fetch token for `key` so its result is dropped.
    pub fn cancel_fetch(&self, key: &CacheKey) -> StoreResult<bool> {
        self.batch(|b| b.cancel_fetch(key))
    }

    /// Whether a fetch for `key` is in flight.
    pub fn is_fetching(&self, key: &CacheKey) -> StoreResult<bool> {
        let guard = self.lock()?;
        Ok(guard
            .entries
            .peek(key)
            .map(|slot| slot.in_flight.is_some())
            .unwrap_or(false))
    }

    /// Keys whose resource is one of `resources`.
    pub fn keys_for_resources(&self, resources: &[&str]) -> StoreResult<Vec<CacheKey>> {
        let guard = self.lock()?;
        Ok(guard
            .entries
            .iter()
            .filter(|(key, _)| resources.contains(&key.resource()))
            .map(|(key, _)| key.clone())
            .collect())
    }

    pub fn len(&self) -> StoreResult<usize> {
        Ok(self.lock()?.entries.len())
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn stats(&self) -> StoreResult<CacheStats> {
        Ok(self.lock()?.stats.clone())
    }

    /// Subscribe to the store change feed.
    pub fn changes(&self) -> broadcast::Receiver<StoreEvent> {
        self.changes.subscribe()
    }

    /// Wait until `key` reaches a settled status (`Fresh` or `Error`).
    ///
    /// Returns `None` if the entry disappears.
    pub async fn wait_until_settled(&self, key: &CacheKey) -> StoreResult<Option<CacheEntry>> {
        let mut rx = self.changes.subscribe();
        loop {
            match self.peek(key)? {
                None => return Ok(None),
                Some(entry) if entry.status.is_settled() => return Ok(Some(entry)),
                Some(_) => {}
            }
            loop {
                match rx.recv().await {
                    Ok(event) if &event.key == key => break,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => return self.peek(key),
                }
            }
        }
    }
}

/// Mutable view of the store inside [`CacheStore::batch`].
pub struct StoreBatch<'a> {
    state: &'a mut StoreState,
    max_entries: usize,
    now: Timestamp,
    events: Vec<StoreEvent>,
}

impl StoreBatch<'_> {
    pub fn entry(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.state.entries.peek(key).map(|slot| &slot.entry)
    }

    pub fn value(&self, key: &CacheKey) -> Option<&Value> {
        self.entry(key).and_then(|e| e.value.as_ref())
    }

    pub fn subscribers(&self, key: &CacheKey) -> usize {
        self.entry(key).map(|e| e.subscribers).unwrap_or(0)
    }

    /// Capture the exact state of `key`.
    pub fn snapshot(&self, key: &CacheKey) -> Snapshot {
        match self.entry(key) {
            None => Snapshot::Absent,
            Some(entry) => Snapshot::Present {
                value: entry.value.clone(),
                status: entry.status,
            },
        }
    }

    pub fn set(&mut self, key: &CacheKey, value: Option<Value>, status: EntryStatus) {
        let status = if value.is_none() && status == EntryStatus::Fresh {
            EntryStatus::Stale
        } else {
            status
        };
        let now = self.now;
        let slot = self.slot_or_insert(key, status);
        slot.entry.value = value;
        slot.entry.status = status;
        slot.entry.last_updated = now;
        if status != EntryStatus::Error {
            slot.entry.error = None;
        }
        trace!(key = %key, status = %status, "Cache set");
        self.events.push(StoreEvent {
            key: key.clone(),
            kind: StoreEventKind::Updated(status),
        });
    }

    /// Mark `key` stale. An entry with a fetch in flight keeps `Fetching`:
    /// the pending result supersedes the stale value.
    pub fn mark_stale(&mut self, key: &CacheKey) -> bool {
        let Some(slot) = self.state.entries.peek_mut(key) else {
            return false;
        };
        if slot.in_flight.is_none() && slot.entry.status != EntryStatus::Stale {
            slot.entry.status = EntryStatus::Stale;
            self.events.push(StoreEvent {
                key: key.clone(),
                kind: StoreEventKind::Updated(EntryStatus::Stale),
            });
        }
        true
    }

    pub fn fold(&mut self, key: &CacheKey, updater: impl FnOnce(&Value) -> Value) -> bool {
        let now = self.now;
        let Some(slot) = self.state.entries.get_mut(key) else {
            return false;
        };
        let Some(old) = slot.entry.value.as_ref() else {
            return false;
        };
        let new = updater(old);
        if &new != old {
            slot.entry.value = Some(new);
            slot.entry.last_updated = now;
            let status = slot.entry.status;
            self.events.push(StoreEvent {
                key: key.clone(),
                kind: StoreEventKind::Updated(status),
            });
        }
        true
    }

    /// Put `key` back exactly as captured by [`StoreBatch::snapshot`].
    ///
    /// Restoring `Absent` removes the entry; if observers registered in the
    /// meantime the entry is kept as an empty stale placeholder instead so
    /// their reference counts survive.
    pub fn restore(&mut self, key: &CacheKey, snapshot: Snapshot) {
        match snapshot {
            Snapshot::Absent => {
                let observed = self.subscribers(key) > 0;
                if observed {
                    let now = self.now;
                    if let Some(slot) = self.state.entries.peek_mut(key) {
                        slot.entry.value = None;
                        slot.entry.status = EntryStatus::Stale;
                        slot.entry.last_updated = now;
                    }
                    self.events.push(StoreEvent {
                        key: key.clone(),
                        kind: StoreEventKind::Updated(EntryStatus::Stale),
                    });
                } else {
                    self.remove(key);
                }
            }
            Snapshot::Present { value, status } => {
                let now = self.now;
                let slot = self.slot_or_insert(key, status);
                slot.entry.value = value;
                slot.entry.status = status;
                slot.entry.last_updated = now;
                self.events.push(StoreEvent {
                    key: key.clone(),
                    kind: StoreEventKind::Updated(status),
                });
            }
        }
    }

    pub fn cancel_fetch(&mut self, key: &CacheKey) -> bool {
        let Some(slot) = self.state.entries.peek_mut(key) else {
            return false;
        };
        if slot.in_flight.take().is_none() {
            return false;
        }
        if slot.entry.status == EntryStatus::Fetching {
            slot.entry.status = EntryStatus::Stale;
            self.events.push(StoreEvent {
                key: key.clone(),
                kind: StoreEventKind::Updated(EntryStatus::Stale),
            });
        }
        true
    }

    fn remove(&mut self, key: &CacheKey) -> bool {
        let removed = self.state.entries.pop(key).is_some();
        if removed {
            self.events.push(StoreEvent {
                key: key.clone(),
                kind: StoreEventKind::Removed,
            });
        }
        removed
    }

    fn slot_or_insert(&mut self, key: &CacheKey, status: EntryStatus) -> &mut Slot {
        if !self.state.entries.contains(key) {
            self.state.entries.put(
                key.clone(),
                Slot {
                    entry: CacheEntry::placeholder(key.clone(), status),
                    in_flight: None,
                },
            );
            self.enforce_capacity(key);
        }
        self.state
            .entries
            .get_or_insert_mut(key.clone(), || Slot {
                entry: CacheEntry::placeholder(key.clone(), status),
                in_flight: None,
            })
    }

    /// Evict least-recently-used entries that nobody observes and that have
    /// no fetch in flight until the store fits its capacity.
    fn enforce_capacity(&mut self, protect: &CacheKey) {
        while self.state.entries.len() > self.max_entries {
            let victim = self
                .state
                .entries
                .iter()
                .rev()
                .find(|(key, slot)| {
                    *key != protect && slot.entry.subscribers == 0 && slot.in_flight.is_none()
                })
                .map(|(key, _)| key.clone());
            let Some(victim) = victim else {
                break;
            };
            self.state.entries.pop(&victim);
            self.state.stats.evictions += 1;
            debug!(key = %victim, "Evicted least-recently-used cache entry");
            self.events.push(StoreEvent {
                key: victim,
                kind: StoreEventKind::Removed,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(op: &str) -> CacheKey {
        CacheKey::new("appointment", op, json!({}))
    }

    #[test]
    fn test_set_then_get() {
        let store = CacheStore::with_defaults();
        let k = key("list");
        store.set(&k, Some(json!([1, 2])), EntryStatus::Fresh).unwrap();

        let entry = store.get(&k).unwrap().unwrap();
        assert_eq!(entry.value, Some(json!([1, 2])));
        assert_eq!(entry.status, EntryStatus::Fresh);
        assert_eq!(store.stats().unwrap().hits, 1);
    }

    #[test]
    fn test_fresh_without_value_is_stored_stale() {
        let store = CacheStore::with_defaults();
        let k = key("list");
        store.set(&k, None, EntryStatus::Fresh).unwrap();
        assert_eq!(store.peek(&k).unwrap().unwrap().status, EntryStatus::Stale);
    }

    #[test]
    fn test_mark_stale_keeps_value_and_is_idempotent() {
        let store = CacheStore::with_defaults();
        let k = key("list");
        store.set(&k, Some(json!(["a"])), EntryStatus::Fresh).unwrap();

        let mut rx = store.changes();
        assert!(store.mark_stale(&k).unwrap());
        assert!(store.mark_stale(&k).unwrap());

        let entry = store.peek(&k).unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Stale);
        assert_eq!(entry.value, Some(json!(["a"])));
        // Only the first call changed anything.
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert!(!store.mark_stale(&key("missing")).unwrap());
    }

    #[test]
    fn test_fold_requires_value() {
        let store = CacheStore::with_defaults();
        let k = key("count");
        assert!(!store.fold(&k, |v| v.clone()).unwrap());

        store.set(&k, Some(json!(1)), EntryStatus::Fresh).unwrap();
        assert!(store
            .fold(&k, |v| json!(v.as_i64().unwrap_or(0) + 1))
            .unwrap());
        assert_eq!(store.peek(&k).unwrap().unwrap().value, Some(json!(2)));
    }

    #[test]
    fn test_evict_respects_subscribers() {
        let store = CacheStore::with_defaults();
        let k = key("list");
        store.set(&k, Some(json!([])), EntryStatus::Fresh).unwrap();
        store.subscribe(&k).unwrap();

        assert!(!store.evict(&k).unwrap());
        assert_eq!(store.unsubscribe(&k).unwrap(), 0);
        assert!(store.evict(&k).unwrap());
        assert!(store.peek(&k).unwrap().is_none());
    }

    #[test]
    fn test_lru_eviction_skips_observed_entries() {
        let store = CacheStore::new(CacheConfig::new().with_max_entries(2));
        let a = key("a");
        let b = key("b");
        let c = key("c");

        store.set(&a, Some(json!(1)), EntryStatus::Fresh).unwrap();
        store.subscribe(&a).unwrap();
        store.set(&b, Some(json!(2)), EntryStatus::Fresh).unwrap();
        store.set(&c, Some(json!(3)), EntryStatus::Fresh).unwrap();

        // `a` is least recently used but observed, so `b` goes.
        assert!(store.peek(&a).unwrap().is_some());
        assert!(store.peek(&b).unwrap().is_none());
        assert!(store.peek(&c).unwrap().is_some());
        assert_eq!(store.stats().unwrap().evictions, 1);
    }

    #[test]
    fn test_superseded_fetch_result_is_dropped() {
        let store = CacheStore::with_defaults();
        let k = key("list");

        let first = store.begin_fetch(&k).unwrap();
        let second = store.begin_fetch(&k).unwrap();
        assert!(!store.complete_fetch(&k, first, json!(["old"])).unwrap());
        assert_eq!(store.peek(&k).unwrap().unwrap().status, EntryStatus::Fetching);

        assert!(store.complete_fetch(&k, second, json!(["new"])).unwrap());
        let entry = store.peek(&k).unwrap().unwrap();
        assert_eq!(entry.value, Some(json!(["new"])));
        assert_eq!(entry.status, EntryStatus::Fresh);
    }

    #[test]
    fn test_cancelled_fetch_result_is_dropped() {
        let store = CacheStore::with_defaults();
        let k = key("list");
        store.set(&k, Some(json!(["cached"])), EntryStatus::Stale).unwrap();

        let token = store.begin_fetch(&k).unwrap();
        assert!(store.cancel_fetch(&k).unwrap());
        assert!(!store.complete_fetch(&k, token, json!(["late"])).unwrap());

        let entry = store.peek(&k).unwrap().unwrap();
        assert_eq!(entry.value, Some(json!(["cached"])));
        assert_eq!(entry.status, EntryStatus::Stale);
    }

    #[test]
    fn test_failed_fetch_keeps_stale_value() {
        let store = CacheStore::with_defaults();
        let k = key("list");
        store.set(&k, Some(json!(["cached"])), EntryStatus::Stale).unwrap();

        let token = store.begin_fetch(&k).unwrap();
        let error = RemoteError::Network {
            procedure: "appointment.list".to_string(),
            reason: "offline".to_string(),
        };
        assert!(store.fail_fetch(&k, token, &error).unwrap());

        let entry = store.peek(&k).unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Error);
        assert_eq!(entry.value, Some(json!(["cached"])));
        assert!(entry.error.unwrap().contains("offline"));
    }

    #[test]
    fn test_restore_absent_removes_entry() {
        let store = CacheStore::with_defaults();
        let k = key("list");
        let snapshot = store.batch(|b| b.snapshot(&k)).unwrap();
        assert_eq!(snapshot, Snapshot::Absent);

        store.set(&k, Some(json!(["speculative"])), EntryStatus::Fresh).unwrap();
        store.batch(|b| b.restore(&k, snapshot)).unwrap();
        assert!(store.peek(&k).unwrap().is_none());
    }

    #[test]
    fn test_restore_present_is_exact() {
        let store = CacheStore::with_defaults();
        let k = key("list");
        store.set(&k, Some(json!(["a"])), EntryStatus::Stale).unwrap();
        let snapshot = store.batch(|b| b.snapshot(&k)).unwrap();

        store.set(&k, Some(json!(["b"])), EntryStatus::Fresh).unwrap();
        store.batch(|b| b.restore(&k, snapshot)).unwrap();

        let entry = store.peek(&k).unwrap().unwrap();
        assert_eq!(entry.value, Some(json!(["a"])));
        assert_eq!(entry.status, EntryStatus::Stale);
    }

    #[test]
    fn test_keys_for_resources() {
        let store = CacheStore::with_defaults();
        store.set(&key("list"), Some(json!([])), EntryStatus::Fresh).unwrap();
        store
            .set(&CacheKey::bare("dashboard", "stats"), Some(json!({})), EntryStatus::Fresh)
            .unwrap();

        let keys = store.keys_for_resources(&["appointment"]).unwrap();
        assert_eq!(keys, vec![key("list")]);
        assert_eq!(store.keys_for_resources(&["appointment", "dashboard"]).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_wait_until_settled_completes_on_set() {
        let store = std::sync::Arc::new(CacheStore::with_defaults());
        let k = key("list");
        let token = store.begin_fetch(&k).unwrap();

        let waiter = {
            let store = store.clone();
            let k = k.clone();
            tokio::spawn(async move { store.wait_until_settled(&k).await })
        };
        tokio::task::yield_now().await;
        store.complete_fetch(&k, token, json!(["done"])).unwrap();

        let entry = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(entry.value, Some(json!(["done"])));
    }

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);
        assert!((CacheStats::default().hit_rate() - 0.0).abs() < 0.001);
    }
}
