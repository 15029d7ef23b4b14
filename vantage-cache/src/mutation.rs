//! Optimistic mutation coordinator.
//!
//! A mutation snapshots every cached key it is about to touch, applies the
//! caller's speculative update synchronously, then calls the server. On
//! success the affected entities are invalidated so the speculative values
//! are replaced by server truth; on failure every snapshot is restored in a
//! single store batch before the error is returned.
//!
//! Overlapping mutations are tracked per key in a generation ledger:
//!
//! - a failing mutation that is still the newest writer of a key restores
//!   its snapshot;
//! - a failing mutation with a newer mutation still pending on the key
//!   hands its snapshot to that successor, whose own snapshot captured the
//!   speculative value being undone;
//! - a failing mutation whose successors already committed cannot restore
//!   anything meaningful and invalidates the key's entities instead.
//!
//! Once the remote call has started, settlement (commit or rollback) runs in
//! its own task and completes even if the caller stops waiting.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};
use vantage_core::{
    CacheKey, EntryStatus, RegistryError, RemoteCall, RemoteError, StoreError, VantageError,
    VantageResult,
};

use crate::config::MutationConfig;
use crate::dispatcher::InvalidationDispatcher;
use crate::registry::Registry;
use crate::store::{CacheStore, Snapshot};

/// Keys written by one mutation run.
#[derive(Debug, Clone)]
pub struct MutationContext {
    pub mutation: String,
    pub generation: u64,
    /// Every cached key of the mutation's entities.
    pub affected_keys: Vec<CacheKey>,
    /// Keys the optimistic update actually wrote.
    pub written_keys: Vec<CacheKey>,
    /// Written keys whose in-flight fetch was superseded by the write.
    pub cancelled_keys: Vec<CacheKey>,
}

pub struct MutationCoordinator {
    store: Arc<CacheStore>,
    registry: Arc<Registry>,
    dispatcher: Arc<InvalidationDispatcher>,
    remote: Arc<dyn RemoteCall>,
    config: MutationConfig,
    ledger: Arc<Mutex<MutationLedger>>,
    next_generation: AtomicU64,
}

impl MutationCoordinator {
    pub fn new(
        store: Arc<CacheStore>,
        registry: Arc<Registry>,
        dispatcher: Arc<InvalidationDispatcher>,
        remote: Arc<dyn RemoteCall>,
        config: MutationConfig,
    ) -> Self {
        Self {
            store,
            registry,
            dispatcher,
            remote,
            config,
            ledger: Arc::new(Mutex::new(MutationLedger::default())),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Run a registered mutation against its registered procedure.
    ///
    /// `update` receives each affected key and its current value and returns
    /// the speculative value, or `None` to leave the key untouched. It runs
    /// under the store lock and must not block.
    pub async fn run<F>(&self, mutation: &str, input: Value, update: F) -> VantageResult<Value>
    where
        F: FnMut(&CacheKey, Option<&Value>) -> Option<Value>,
    {
        self.run_targeted(mutation, input, &[], update).await
    }

    /// Like [`MutationCoordinator::run`], additionally offering `targets` to
    /// `update` even when they are not cached yet (e.g. the detail entry of
    /// a row being created). A target that was absent is removed again on
    /// rollback.
    pub async fn run_targeted<F>(
        &self,
        mutation: &str,
        input: Value,
        targets: &[CacheKey],
        update: F,
    ) -> VantageResult<Value>
    where
        F: FnMut(&CacheKey, Option<&Value>) -> Option<Value>,
    {
        let procedure = self.registry.mutation(mutation)?.procedure.clone();
        let remote = self.remote.clone();
        self.run_with(mutation, input, targets, update, move |input| async move {
            remote.call(&procedure, input).await
        })
        .await
    }

    /// Run a registered mutation with a caller-supplied remote call.
    pub async fn run_with<F, R, Fut>(
        &self,
        mutation: &str,
        input: Value,
        targets: &[CacheKey],
        update: F,
        remote_call: R,
    ) -> VantageResult<Value>
    where
        F: FnMut(&CacheKey, Option<&Value>) -> Option<Value>,
        R: FnOnce(Value) -> Fut,
        Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
    {
        let descriptor = self.registry.mutation(mutation)?;
        let affects = descriptor.affects.clone();
        let procedure = descriptor.procedure.clone();

        let context = self.apply(mutation, &affects, targets, update)?;
        debug!(
            mutation = %mutation,
            generation = context.generation,
            written = context.written_keys.len(),
            "Applied optimistic update"
        );

        let call = remote_call(input);
        let timeout = self.config.remote_timeout;
        let settlement = Settlement {
            store: self.store.clone(),
            dispatcher: self.dispatcher.clone(),
            ledger: self.ledger.clone(),
            affects,
            context,
        };

        let task = tokio::spawn(async move {
            let result = match timeout {
                Some(limit) => match tokio::time::timeout(limit, call).await {
                    Ok(result) => result,
                    Err(_) => Err(RemoteError::Timeout {
                        procedure,
                        timeout: limit,
                    }),
                },
                None => call.await,
            };
            settlement.settle(result)
        });

        match task.await {
            Ok(result) => result,
            Err(join) => Err(VantageError::Mutation {
                mutation: mutation.to_string(),
                source: RemoteError::Network {
                    procedure: mutation.to_string(),
                    reason: format!("mutation task failed: {}", join),
                },
            }),
        }
    }

    /// Number of keys with an unsettled optimistic write.
    pub fn pending_keys(&self) -> usize {
        self.ledger.lock().map(|l| l.keys.len()).unwrap_or(0)
    }

    fn apply<F>(
        &self,
        mutation: &str,
        affects: &[String],
        targets: &[CacheKey],
        mut update: F,
    ) -> VantageResult<MutationContext>
    where
        F: FnMut(&CacheKey, Option<&Value>) -> Option<Value>,
    {
        let affected_keys = self.affected_keys(affects, targets)?;

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let mut ledger = lock_ledger(&self.ledger)?;
        let (written_keys, cancelled_keys) = self.store.batch(|b| {
            let mut written = Vec::new();
            let mut cancelled = Vec::new();
            for key in &affected_keys {
                let Some(next) = update(key, b.value(key)) else {
                    continue;
                };
                // A fetch started before the write would overwrite it.
                if b.cancel_fetch(key) {
                    cancelled.push(key.clone());
                }
                let snapshot = b.snapshot(key);
                b.set(key, Some(next), EntryStatus::Fresh);
                ledger.record(generation, key, snapshot);
                written.push(key.clone());
            }
            (written, cancelled)
        })?;
        drop(ledger);

        for key in &cancelled_keys {
            self.dispatcher.cancel(key)?;
        }

        Ok(MutationContext {
            mutation: mutation.to_string(),
            generation,
            affected_keys,
            written_keys,
            cancelled_keys,
        })
    }

    fn affected_keys(&self, affects: &[String], targets: &[CacheKey]) -> VantageResult<Vec<CacheKey>> {
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        for key in targets {
            if self.registry.shape_of(key).is_none() {
                return Err(RegistryError::UnknownQuery {
                    resource: key.resource().to_string(),
                    operation: key.operation().to_string(),
                }
                .into());
            }
            if seen.insert(key.clone()) {
                keys.push(key.clone());
            }
        }
        for entity in affects {
            let resources = self.registry.resources_of(entity)?;
            for key in self.store.keys_for_resources(&resources)? {
                if seen.insert(key.clone()) {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }
}

struct Settlement {
    store: Arc<CacheStore>,
    dispatcher: Arc<InvalidationDispatcher>,
    ledger: Arc<Mutex<MutationLedger>>,
    affects: Vec<String>,
    context: MutationContext,
}

impl Settlement {
    fn settle(self, result: Result<Value, RemoteError>) -> VantageResult<Value> {
        match result {
            Ok(value) => {
                self.commit();
                Ok(value)
            }
            Err(source) => {
                warn!(
                    mutation = %self.context.mutation,
                    generation = self.context.generation,
                    error = %source,
                    "Mutation failed, rolling back"
                );
                self.rollback()?;
                Err(VantageError::Mutation {
                    mutation: self.context.mutation,
                    source,
                })
            }
        }
    }

    fn commit(&self) {
        match lock_ledger(&self.ledger) {
            Ok(mut ledger) => {
                for key in &self.context.written_keys {
                    ledger.commit(self.context.generation, key);
                }
            }
            Err(err) => error!(error = %err, "Mutation ledger unavailable on commit"),
        }
        info!(
            mutation = %self.context.mutation,
            generation = self.context.generation,
            "Mutation committed"
        );
        self.invalidate_all();
    }

    fn rollback(&self) -> VantageResult<()> {
        let generation = self.context.generation;
        let (needs_invalidation, restored) = {
            let mut ledger = lock_ledger(&self.ledger)?;
            self.store.batch(|b| {
                let mut needs_invalidation = false;
                let mut restored = Vec::new();
                for key in &self.context.written_keys {
                    let Some(step) = ledger.rollback(generation, key) else {
                        continue;
                    };
                    needs_invalidation |= step.committed_since;
                    match step.action {
                        RollbackAction::Restore(snapshot) => {
                            b.restore(key, snapshot);
                            restored.push(key.clone());
                        }
                        RollbackAction::HandedForward => {
                            debug!(key = %key, generation, "Rollback handed to newer mutation");
                        }
                        RollbackAction::Superseded => needs_invalidation = true,
                    }
                }
                (needs_invalidation, restored)
            })?
        };

        if needs_invalidation {
            self.invalidate_all();
            return Ok(());
        }
        // Restored keys whose fetch the write dropped need a new one.
        for key in restored
            .iter()
            .filter(|key| self.context.cancelled_keys.contains(*key))
        {
            self.dispatcher.refetch(key)?;
        }
        Ok(())
    }

    fn invalidate_all(&self) {
        for entity in &self.affects {
            if let Err(err) = self.dispatcher.invalidate(entity) {
                error!(entity = %entity, error = %err, "Post-mutation invalidation failed");
            }
        }
    }
}

fn lock_ledger(ledger: &Mutex<MutationLedger>) -> Result<MutexGuard<'_, MutationLedger>, StoreError> {
    ledger.lock().map_err(|_| StoreError::LockPoisoned)
}

// =============================================================================
// GENERATION LEDGER
// =============================================================================

#[derive(Debug)]
struct PendingWrite {
    snapshot: Snapshot,
    commits_at_start: u64,
}

#[derive(Debug, Default)]
struct KeyLedger {
    latest: u64,
    commits: u64,
    pending: BTreeMap<u64, PendingWrite>,
}

#[derive(Debug, Clone, PartialEq)]
enum RollbackAction {
    Restore(Snapshot),
    HandedForward,
    Superseded,
}

#[derive(Debug)]
struct RollbackStep {
    action: RollbackAction,
    /// Another mutation committed on the key while this one was in flight.
    committed_since: bool,
}

#[derive(Debug, Default)]
struct MutationLedger {
    keys: HashMap<CacheKey, KeyLedger>,
}

impl MutationLedger {
    fn record(&mut self, generation: u64, key: &CacheKey, snapshot: Snapshot) {
        let ledger = self.keys.entry(key.clone()).or_default();
        let commits_at_start = ledger.commits;
        ledger.pending.insert(
            generation,
            PendingWrite {
                snapshot,
                commits_at_start,
            },
        );
        ledger.latest = generation;
    }

    fn commit(&mut self, generation: u64, key: &CacheKey) {
        let Some(ledger) = self.keys.get_mut(key) else {
            return;
        };
        if ledger.pending.remove(&generation).is_some() {
            ledger.commits += 1;
        }
        if ledger.pending.is_empty() {
            self.keys.remove(key);
        }
    }

    fn rollback(&mut self, generation: u64, key: &CacheKey) -> Option<RollbackStep> {
        let ledger = self.keys.get_mut(key)?;
        let write = ledger.pending.remove(&generation)?;
        let committed_since = ledger.commits > write.commits_at_start;

        let action = if ledger.latest == generation {
            ledger.latest = ledger.pending.keys().next_back().copied().unwrap_or(generation);
            RollbackAction::Restore(write.snapshot)
        } else if let Some((_, next)) = ledger.pending.range_mut(generation + 1..).next() {
            next.snapshot = write.snapshot;
            next.commits_at_start = next.commits_at_start.min(write.commits_at_start);
            RollbackAction::HandedForward
        } else {
            RollbackAction::Superseded
        };

        if ledger.pending.is_empty() {
            self.keys.remove(key);
        }
        Some(RollbackStep {
            action,
            committed_since,
        })
    }
}
