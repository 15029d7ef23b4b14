//! Change event reconciler.
//!
//! Applies push-channel change events to cached entries. Each listened
//! entity runs a small state machine:
//!
//! ```text
//! Idle -> Listening -> (Folding | Refetching) -> Listening
//! ```
//!
//! Events are folded into cached values only while their sequence numbers
//! are contiguous. A gap means an event was lost; the reconciler then stops
//! folding, invalidates the entity once and resynchronises on the event that
//! exposed the gap.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};
use vantage_core::{
    CacheKey, ChangeEvent, ChangeKind, EntryStatus, FilterExpr, RegistryError, StoreError,
    VantageResult,
};

use crate::config::ReconcilerConfig;
use crate::dispatcher::{InvalidationDispatcher, InvalidationReport};
use crate::fold::{fold_list, FoldOutcome};
use crate::registry::{ListShape, QueryShape, Registry};
use crate::store::CacheStore;

/// Per-entity reconciliation phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilePhase {
    /// Nobody listens to the entity.
    Idle,
    /// Waiting for the next event.
    Listening,
    /// Applying an event to cached entries.
    Folding,
    /// A gap was detected; the entity was invalidated and awaits its next
    /// contiguous event.
    Refetching,
}

impl ReconcilePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcilePhase::Idle => "idle",
            ReconcilePhase::Listening => "listening",
            ReconcilePhase::Folding => "folding",
            ReconcilePhase::Refetching => "refetching",
        }
    }
}

/// What `on_event` did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Folded into `entries` cached values (plus any buffered successors).
    Folded { entries: usize },
    /// Held until the missing sequence numbers arrive.
    Buffered,
    /// Already applied.
    Duplicate,
    /// A gap forced an invalidation of the entity.
    Refetched,
    /// Outside every live subscription filter; only the sequence advanced.
    Filtered,
    /// No live subscription for the entity.
    Ignored,
}

#[derive(Debug)]
struct EntityStream {
    phase: ReconcilePhase,
    last_sequence: Option<u64>,
    pending: BTreeMap<u64, ChangeEvent>,
    filters: Vec<Option<FilterExpr>>,
}

impl EntityStream {
    fn new() -> Self {
        Self {
            phase: ReconcilePhase::Listening,
            last_sequence: None,
            pending: BTreeMap::new(),
            filters: Vec::new(),
        }
    }

    /// Whether any live subscription wants the event. Both row images are
    /// checked so rows leaving a filtered view are still removed.
    fn admits(&self, event: &ChangeEvent) -> bool {
        if self.filters.iter().any(Option::is_none) {
            return true;
        }
        let images: Vec<&Value> = event.before.iter().chain(event.after.iter()).collect();
        if images.is_empty() {
            return true;
        }
        self.filters
            .iter()
            .flatten()
            .any(|filter| images.iter().any(|row| filter.matches(row)))
    }
}

pub struct ChangeReconciler {
    store: Arc<CacheStore>,
    registry: Arc<Registry>,
    dispatcher: Arc<InvalidationDispatcher>,
    config: ReconcilerConfig,
    streams: Mutex<HashMap<String, EntityStream>>,
}

impl ChangeReconciler {
    pub fn new(
        store: Arc<CacheStore>,
        registry: Arc<Registry>,
        dispatcher: Arc<InvalidationDispatcher>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            dispatcher,
            config,
            streams: Mutex::new(HashMap::new()),
        }
    }

    fn streams(&self) -> Result<MutexGuard<'_, HashMap<String, EntityStream>>, StoreError> {
        self.streams.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Start reconciling `entity` for a subscription with `filter`.
    pub fn listen(&self, entity: &str, filter: Option<FilterExpr>) -> VantageResult<()> {
        if !self.registry.has_entity(entity) {
            return Err(RegistryError::UnknownEntity {
                entity: entity.to_string(),
                referenced_by: "live subscription".to_string(),
            }
            .into());
        }
        let mut streams = self.streams()?;
        streams
            .entry(entity.to_string())
            .or_insert_with(EntityStream::new)
            .filters
            .push(filter);
        debug!(entity = %entity, "Listening for change events");
        Ok(())
    }

    /// Drop one subscription of `entity`; the entity goes idle with the last one.
    pub fn stop(&self, entity: &str, filter: Option<&FilterExpr>) -> VantageResult<()> {
        let mut streams = self.streams()?;
        let Some(stream) = streams.get_mut(entity) else {
            return Ok(());
        };
        if let Some(index) = stream.filters.iter().position(|f| f.as_ref() == filter) {
            stream.filters.remove(index);
        }
        if stream.filters.is_empty() {
            streams.remove(entity);
            debug!(entity = %entity, "Stopped reconciling entity");
        }
        Ok(())
    }

    pub fn phase(&self, entity: &str) -> ReconcilePhase {
        self.streams()
            .ok()
            .and_then(|s| s.get(entity).map(|stream| stream.phase))
            .unwrap_or(ReconcilePhase::Idle)
    }

    pub fn last_sequence(&self, entity: &str) -> Option<u64> {
        self.streams()
            .ok()
            .and_then(|s| s.get(entity).and_then(|stream| stream.last_sequence))
    }

    pub fn buffered(&self, entity: &str) -> usize {
        self.streams()
            .ok()
            .and_then(|s| s.get(entity).map(|stream| stream.pending.len()))
            .unwrap_or(0)
    }

    /// Apply one change event. Must be called from within a Tokio runtime,
    /// since invalidation schedules background refetches.
    pub fn on_event(&self, event: ChangeEvent) -> VantageResult<ReconcileOutcome> {
        let mut streams = self.streams()?;
        let Some(stream) = streams.get_mut(&event.entity) else {
            debug!(entity = %event.entity, sequence = event.sequence, "Ignoring event for idle entity");
            return Ok(ReconcileOutcome::Ignored);
        };

        let sequence = event.sequence;
        match stream.last_sequence {
            Some(last) if sequence <= last => {
                debug!(entity = %event.entity, sequence, last, "Dropping duplicate event");
                Ok(ReconcileOutcome::Duplicate)
            }
            Some(last) if last.checked_add(1) != Some(sequence) => {
                if stream.pending.len() < self.config.reorder_window {
                    stream.pending.insert(sequence, event);
                    return Ok(ReconcileOutcome::Buffered);
                }
                warn!(
                    entity = %event.entity,
                    expected = ?last.checked_add(1),
                    received = sequence,
                    "Sequence gap, refetching entity"
                );
                stream.phase = ReconcilePhase::Refetching;
                stream.pending.clear();
                stream.last_sequence = Some(sequence);
                self.dispatcher.invalidate(&event.entity)?;
                Ok(ReconcileOutcome::Refetched)
            }
            // Contiguous, or the first event since listening began.
            _ => {
                let mut folded = 0;
                let mut admitted = false;
                let mut next = Some(event);
                while let Some(event) = next.take() {
                    stream.last_sequence = Some(event.sequence);
                    if stream.admits(&event) {
                        admitted = true;
                        stream.phase = ReconcilePhase::Folding;
                        folded += self.apply(&event)?;
                    }
                    next = event
                        .sequence
                        .checked_add(1)
                        .and_then(|following| stream.pending.remove(&following));
                }
                let last = stream.last_sequence.unwrap_or(sequence);
                stream.pending.retain(|seq, _| *seq > last);
                stream.phase = ReconcilePhase::Listening;

                if admitted {
                    Ok(ReconcileOutcome::Folded { entries: folded })
                } else {
                    Ok(ReconcileOutcome::Filtered)
                }
            }
        }
    }

    /// Forget sequence baselines after the push connection was re-established
    /// and, if configured, invalidate every listened entity.
    pub fn on_reconnected(&self) -> VantageResult<Vec<InvalidationReport>> {
        let entities: Vec<String> = {
            let mut streams = self.streams()?;
            for stream in streams.values_mut() {
                stream.last_sequence = None;
                stream.pending.clear();
                stream.phase = ReconcilePhase::Listening;
            }
            streams.keys().cloned().collect()
        };

        if !self.config.refetch_on_reconnect {
            return Ok(Vec::new());
        }
        entities
            .iter()
            .map(|entity| self.dispatcher.invalidate(entity))
            .collect()
    }

    /// Apply `event` to every cached entry of its entity. Returns how many
    /// entries changed in place.
    fn apply(&self, event: &ChangeEvent) -> VantageResult<usize> {
        let resources = self.registry.resources_of(&event.entity)?;
        let keys = self.store.keys_for_resources(&resources)?;

        let mut changed = 0;
        for key in keys {
            let Some(shape) = self.registry.shape_of(&key) else {
                continue;
            };
            match shape {
                QueryShape::List(list) => {
                    if self.fold_list_entry(&key, list, event)? {
                        changed += 1;
                    }
                }
                QueryShape::Detail { id_param } => {
                    let addressed = key
                        .param(id_param)
                        .map_or(false, |id| event.row_id.matches(id));
                    if !addressed {
                        continue;
                    }
                    match (event.change_kind, event.after.as_ref()) {
                        (ChangeKind::Inserted | ChangeKind::Updated, Some(after)) => {
                            // An older fetch must not overwrite the pushed row.
                            self.store.batch(|b| {
                                b.cancel_fetch(&key);
                                b.set(&key, Some(after.clone()), EntryStatus::Fresh);
                            })?;
                            self.dispatcher.cancel(&key)?;
                            changed += 1;
                        }
                        _ => {
                            self.dispatcher.refetch(&key)?;
                        }
                    }
                }
                QueryShape::Aggregate => {
                    self.dispatcher.refetch(&key)?;
                }
            }
        }

        debug!(
            entity = %event.entity,
            sequence = event.sequence,
            kind = ?event.change_kind,
            changed,
            "Applied change event"
        );
        Ok(changed)
    }

    fn fold_list_entry(&self, key: &CacheKey, shape: &ListShape, event: &ChangeEvent) -> VantageResult<bool> {
        let outcome = self.store.batch(|b| {
            let Some(current) = b.value(key) else {
                return Ok(FoldOutcome::Unchanged);
            };
            let outcome = fold_list(key, shape, current, event)?;
            if let FoldOutcome::Changed(next) = &outcome {
                let next = next.clone();
                b.fold(key, move |_| next);
            }
            Ok::<_, StoreError>(outcome)
        })?;

        match outcome {
            Ok(FoldOutcome::Changed(_)) => Ok(true),
            Ok(FoldOutcome::Unchanged) => Ok(false),
            Ok(FoldOutcome::NeedsRefetch) => {
                self.dispatcher.refetch(key)?;
                Ok(false)
            }
            Err(err) => {
                warn!(key = %key, error = %err, "Cannot fold event into entry, refetching");
                self.dispatcher.refetch(key)?;
                Ok(false)
            }
        }
    }
}
