//! VANTAGE Test Utilities
//!
//! Centralized test infrastructure for the VANTAGE workspace:
//! - Mock remote procedure boundary and push source
//! - A recording change sink for connection manager tests
//! - Booking-domain fixtures (routing table, rows, fake server)
//! - Proptest generators

pub use vantage_cache::{
    CacheConfig, CacheStore, ChangeReconciler, InvalidationDispatcher, ListShape, MutationConfig,
    MutationCoordinator, QueryShape, ReconcilerConfig, Registry,
};
pub use vantage_core::{
    CacheKey, ChangeEvent, ChangeKind, ChannelError, ConfigError, ConnectionState, EntryStatus, FilterExpr,
    PushMessage, RegistryError, RemoteCall, RemoteError, Row, RowId, SortSpec, VantageError,
    VantageResult,
};
pub use vantage_realtime::{
    Channel, ChannelSink, ChangeSink, ConnectionManager, PushSource, RealtimeConfig,
    ReconnectConfig, SubscriptionSpec,
};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// GATE
// ============================================================================

/// One-shot latch used to hold a mocked call until the test releases it.
#[derive(Debug, Clone)]
pub struct Gate {
    tx: Arc<watch::Sender<bool>>,
}

impl Gate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// MOCK REMOTE
// ============================================================================

type Handler = Arc<dyn Fn(&Value) -> Result<Value, RemoteError> + Send + Sync>;

#[derive(Default)]
struct RemoteState {
    handlers: HashMap<String, Handler>,
    gates: HashMap<String, Gate>,
    calls: Vec<(String, Value)>,
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
}

/// Scriptable [`RemoteCall`] that records every call.
#[derive(Default)]
pub struct MockRemote {
    state: Mutex<RemoteState>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `procedure` with a fixed value.
    pub fn respond(&self, procedure: &str, value: Value) {
        self.handle(procedure, move |_| Ok(value.clone()));
    }

    /// Answer `procedure` by running `handler` on the input.
    pub fn handle<F>(&self, procedure: &str, handler: F)
    where
        F: Fn(&Value) -> Result<Value, RemoteError> + Send + Sync + 'static,
    {
        lock(&self.state)
            .handlers
            .insert(procedure.to_string(), Arc::new(handler));
    }

    /// Fail every call of `procedure` with `error`.
    pub fn fail(&self, procedure: &str, error: RemoteError) {
        self.handle(procedure, move |_| Err(error.clone()));
    }

    /// Reject every call of `procedure` as a validation failure.
    pub fn reject(&self, procedure: &str, reason: &str) {
        self.fail(
            procedure,
            RemoteError::Validation {
                procedure: procedure.to_string(),
                reason: reason.to_string(),
            },
        );
    }

    /// Hold calls of `procedure` until the returned gate opens.
    pub fn gate(&self, procedure: &str) -> Gate {
        let gate = Gate::new();
        lock(&self.state)
            .gates
            .insert(procedure.to_string(), gate.clone());
        gate
    }

    pub fn calls(&self, procedure: &str) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|(p, _)| p == procedure)
            .count()
    }

    pub fn inputs(&self, procedure: &str) -> Vec<Value> {
        lock(&self.state)
            .calls
            .iter()
            .filter(|(p, _)| p == procedure)
            .map(|(_, input)| input.clone())
            .collect()
    }

    pub fn total_calls(&self) -> usize {
        lock(&self.state).calls.len()
    }

    /// Highest number of simultaneous calls seen for `procedure`.
    pub fn max_concurrent(&self, procedure: &str) -> usize {
        lock(&self.state)
            .max_in_flight
            .get(procedure)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl RemoteCall for MockRemote {
    async fn call(&self, procedure: &str, input: Value) -> Result<Value, RemoteError> {
        let gate = {
            let mut state = lock(&self.state);
            state.calls.push((procedure.to_string(), input.clone()));
            let running = state.in_flight.entry(procedure.to_string()).or_insert(0);
            *running += 1;
            let running = *running;
            let max = state.max_in_flight.entry(procedure.to_string()).or_insert(0);
            *max = (*max).max(running);
            state.gates.get(procedure).cloned()
        };

        if let Some(gate) = gate {
            gate.wait().await;
        }

        let handler = {
            let mut state = lock(&self.state);
            if let Some(running) = state.in_flight.get_mut(procedure) {
                *running = running.saturating_sub(1);
            }
            state.handlers.get(procedure).cloned()
        };
        match handler {
            Some(handler) => handler(&input),
            None => Err(RemoteError::Network {
                procedure: procedure.to_string(),
                reason: "no handler registered".to_string(),
            }),
        }
    }
}

// ============================================================================
// MOCK PUSH SOURCE
// ============================================================================

/// Test-side view of one connection attempt.
#[derive(Debug, Clone)]
pub struct MockConnection {
    sink: ChannelSink,
    subscriptions: Arc<Mutex<Vec<SubscriptionSpec>>>,
    closed: Arc<AtomicBool>,
}

impl MockConnection {
    /// Push traffic into the manager as this connection.
    pub fn sink(&self) -> &ChannelSink {
        &self.sink
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionSpec> {
        lock(&self.subscriptions).clone()
    }

    pub fn subscribed_entities(&self) -> Vec<String> {
        lock(&self.subscriptions)
            .iter()
            .map(|spec| spec.entity.clone())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct MockChannel {
    subscriptions: Arc<Mutex<Vec<SubscriptionSpec>>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Channel for MockChannel {
    async fn subscribe(&self, spec: &SubscriptionSpec) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        lock(&self.subscriptions).push(spec.clone());
        Ok(())
    }

    async fn unsubscribe(&self, spec: &SubscriptionSpec) -> Result<(), ChannelError> {
        let mut subscriptions = lock(&self.subscriptions);
        if let Some(index) = subscriptions.iter().position(|s| s == spec) {
            subscriptions.remove(index);
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct PushState {
    connections: Vec<MockConnection>,
    gates: HashMap<usize, Gate>,
    failures: HashSet<usize>,
}

/// Scriptable [`PushSource`]. Attempts are numbered from 1.
///
/// The connection handle is recorded as soon as `connect` is called, so a
/// test can push frames through a connection that is still being gated.
#[derive(Default)]
pub struct MockPushSource {
    state: Mutex<PushState>,
}

impl MockPushSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold connect attempt `attempt` until the returned gate opens.
    pub fn gate_attempt(&self, attempt: usize) -> Gate {
        let gate = Gate::new();
        lock(&self.state).gates.insert(attempt, gate.clone());
        gate
    }

    /// Make connect attempt `attempt` fail.
    pub fn fail_attempt(&self, attempt: usize) {
        lock(&self.state).failures.insert(attempt);
    }

    pub fn attempts(&self) -> usize {
        lock(&self.state).connections.len()
    }

    pub fn connection(&self, attempt: usize) -> Option<MockConnection> {
        let index = attempt.checked_sub(1)?;
        lock(&self.state).connections.get(index).cloned()
    }

    pub fn latest(&self) -> Option<MockConnection> {
        lock(&self.state).connections.last().cloned()
    }
}

#[async_trait]
impl PushSource for MockPushSource {
    async fn connect(&self, sink: ChannelSink) -> Result<Box<dyn Channel>, ChannelError> {
        let (attempt, gate, fail, connection) = {
            let mut state = lock(&self.state);
            let connection = MockConnection {
                sink,
                subscriptions: Arc::new(Mutex::new(Vec::new())),
                closed: Arc::new(AtomicBool::new(false)),
            };
            state.connections.push(connection.clone());
            let attempt = state.connections.len();
            (
                attempt,
                state.gates.get(&attempt).cloned(),
                state.failures.contains(&attempt),
                connection,
            )
        };

        if let Some(gate) = gate {
            gate.wait().await;
        }
        if fail {
            connection.closed.store(true, Ordering::SeqCst);
            return Err(ChannelError::ConnectFailed {
                reason: format!("attempt {} refused", attempt),
            });
        }
        Ok(Box::new(MockChannel {
            subscriptions: connection.subscriptions.clone(),
            closed: connection.closed.clone(),
        }))
    }
}

// ============================================================================
// RECORDING SINK
// ============================================================================

#[derive(Default)]
struct RecordingState {
    events: Vec<ChangeEvent>,
    listening: Vec<SubscriptionSpec>,
    reconnects: usize,
}

/// [`ChangeSink`] that records what the connection manager hands it.
pub struct RecordingSink {
    state: Mutex<RecordingState>,
    delivered: watch::Sender<usize>,
}

impl RecordingSink {
    pub fn new() -> Self {
        let (delivered, _rx) = watch::channel(0);
        Self {
            state: Mutex::new(RecordingState::default()),
            delivered,
        }
    }

    pub fn events(&self) -> Vec<ChangeEvent> {
        lock(&self.state).events.clone()
    }

    pub fn sequences(&self) -> Vec<u64> {
        lock(&self.state).events.iter().map(|e| e.sequence).collect()
    }

    pub fn listening(&self) -> Vec<SubscriptionSpec> {
        lock(&self.state).listening.clone()
    }

    pub fn reconnects(&self) -> usize {
        lock(&self.state).reconnects
    }

    /// Wait until at least `count` events were delivered.
    pub async fn wait_for_events(&self, count: usize) {
        let mut rx = self.delivered.subscribe();
        let _ = rx.wait_for(|delivered| *delivered >= count).await;
    }
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeSink for RecordingSink {
    fn listen(&self, spec: &SubscriptionSpec) -> VantageResult<()> {
        lock(&self.state).listening.push(spec.clone());
        Ok(())
    }

    fn forget(&self, spec: &SubscriptionSpec) -> VantageResult<()> {
        let mut state = lock(&self.state);
        if let Some(index) = state.listening.iter().position(|s| s == spec) {
            state.listening.remove(index);
        }
        Ok(())
    }

    fn deliver(&self, event: ChangeEvent) -> VantageResult<()> {
        let count = {
            let mut state = lock(&self.state);
            state.events.push(event);
            state.events.len()
        };
        self.delivered.send_replace(count);
        Ok(())
    }

    fn reconnected(&self) -> VantageResult<()> {
        lock(&self.state).reconnects += 1;
        Ok(())
    }

    fn last_sequence(&self, entity: &str) -> Option<u64> {
        lock(&self.state)
            .events
            .iter()
            .filter(|e| e.entity == entity)
            .map(|e| e.sequence)
            .max()
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Booking-domain fixtures: appointments, customers and a dashboard.

    use super::*;
    use serde_json::json;

    pub const APPOINTMENTS: &str = "appointments";
    pub const CUSTOMERS: &str = "customers";
    pub const DASHBOARD: &str = "dashboard-stats";

    /// Filter of the `appointment.upcoming` query.
    pub fn upcoming_filter() -> FilterExpr {
        FilterExpr::eq("status", json!("booked"))
    }

    /// Sort of every appointment list.
    pub fn by_slot() -> SortSpec {
        SortSpec::ascending("slot")
    }

    /// Routing table of a small booking app.
    pub fn booking_registry() -> Registry {
        let built = Registry::builder()
            .entity(APPOINTMENTS, ["appointment", "dashboard"])
            .entity(DASHBOARD, ["dashboard"])
            .entity(CUSTOMERS, ["customer"])
            .query(
                "appointment",
                "list",
                QueryShape::list_with(None, Some(by_slot())).bind_param("customer", "customer"),
            )
            .query(
                "appointment",
                "upcoming",
                QueryShape::list_with(Some(upcoming_filter()), Some(by_slot())),
            )
            .query("appointment", "byId", QueryShape::detail("id"))
            .query("dashboard", "stats", QueryShape::Aggregate)
            .query("customer", "list", QueryShape::list())
            .query("customer", "byId", QueryShape::detail("id"))
            .mutation("cancel-appointment", "appointment.cancel")
            .mutation("create-appointment", "appointment.create")
            .mutation("delete-appointment", "appointment.delete")
            .mutation("update-customer", "customer.update")
            .register_dependency("cancel-appointment", [APPOINTMENTS, DASHBOARD])
            .register_dependency("create-appointment", [APPOINTMENTS, DASHBOARD])
            .register_dependency("delete-appointment", [APPOINTMENTS, DASHBOARD])
            .register_dependency("update-customer", [CUSTOMERS])
            .build();
        match built {
            Ok(registry) => registry,
            Err(err) => panic!("booking registry is invalid: {}", err),
        }
    }

    pub fn appointment(id: u64, slot: &str, status: &str) -> Row {
        json!({
            "id": id,
            "slot": slot,
            "status": status,
            "customer": format!("customer-{}", id % 3),
        })
    }

    /// Slot string unique per appointment id, ordered by hour first.
    pub fn slot(hour: u32, id: u64) -> String {
        format!("{:02}:00#{:04}", hour, id)
    }

    pub fn list_key() -> CacheKey {
        CacheKey::bare("appointment", "list")
    }

    pub fn upcoming_key() -> CacheKey {
        CacheKey::bare("appointment", "upcoming")
    }

    pub fn detail_key(id: u64) -> CacheKey {
        CacheKey::new("appointment", "byId", json!({ "id": id }))
    }

    pub fn stats_key() -> CacheKey {
        CacheKey::bare("dashboard", "stats")
    }

    /// Mutation applied to the fake server by property tests.
    #[derive(Debug, Clone, PartialEq)]
    pub enum BookingOp {
        Insert { hour: u32, status: String },
        Update { pick: usize, hour: u32, status: String },
        Delete { pick: usize },
    }

    #[derive(Default)]
    struct ServerState {
        rows: Vec<Row>,
        next_id: u64,
        sequence: u64,
    }

    /// In-memory source of truth for the `appointments` entity. Every change
    /// produces the sequenced change event a real server would push.
    #[derive(Clone, Default)]
    pub struct BookingServer {
        inner: Arc<Mutex<ServerState>>,
    }

    impl BookingServer {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_rows(rows: Vec<Row>) -> Self {
            let next_id = rows
                .iter()
                .filter_map(|row| row["id"].as_u64())
                .max()
                .unwrap_or(0);
            Self {
                inner: Arc::new(Mutex::new(ServerState {
                    rows,
                    next_id,
                    sequence: 0,
                })),
            }
        }

        pub fn rows(&self) -> Vec<Row> {
            lock(&self.inner).rows.clone()
        }

        pub fn sequence(&self) -> u64 {
            lock(&self.inner).sequence
        }

        /// Insert a new appointment, assigning the next id.
        pub fn insert(&self, hour: u32, status: &str) -> ChangeEvent {
            let mut state = lock(&self.inner);
            state.next_id += 1;
            state.sequence += 1;
            let id = state.next_id;
            let row = appointment(id, &slot(hour, id), status);
            state.rows.push(row.clone());
            ChangeEvent::inserted(APPOINTMENTS, RowId::from(id), row, state.sequence)
        }

        pub fn update(&self, id: u64, hour: u32, status: &str) -> Option<ChangeEvent> {
            let mut state = lock(&self.inner);
            let index = state.rows.iter().position(|row| row["id"] == json!(id))?;
            let before = state.rows[index].clone();
            let after = appointment(id, &slot(hour, id), status);
            state.rows[index] = after.clone();
            state.sequence += 1;
            Some(ChangeEvent::updated(
                APPOINTMENTS,
                RowId::from(id),
                Some(before),
                after,
                state.sequence,
            ))
        }

        pub fn delete(&self, id: u64) -> Option<ChangeEvent> {
            let mut state = lock(&self.inner);
            let index = state.rows.iter().position(|row| row["id"] == json!(id))?;
            let before = state.rows.remove(index);
            state.sequence += 1;
            Some(ChangeEvent::deleted(
                APPOINTMENTS,
                RowId::from(id),
                Some(before),
                state.sequence,
            ))
        }

        /// Apply a generated operation. `pick` selects an existing row
        /// modulo the row count; operations on an empty table do nothing.
        pub fn apply(&self, op: &BookingOp) -> Option<ChangeEvent> {
            match op {
                BookingOp::Insert { hour, status } => Some(self.insert(*hour, status)),
                BookingOp::Update { pick, hour, status } => {
                    let id = self.pick(*pick)?;
                    self.update(id, *hour, status)
                }
                BookingOp::Delete { pick } => {
                    let id = self.pick(*pick)?;
                    self.delete(id)
                }
            }
        }

        fn pick(&self, pick: usize) -> Option<u64> {
            let state = lock(&self.inner);
            if state.rows.is_empty() {
                return None;
            }
            state.rows[pick % state.rows.len()]["id"].as_u64()
        }

        /// What a list query with `shape` returns right now.
        pub fn list(&self, shape: &ListShape) -> Value {
            let mut rows: Vec<Row> = self
                .rows()
                .into_iter()
                .filter(|row| shape.filter.as_ref().map_or(true, |f| f.matches(row)))
                .collect();
            if let Some(sort) = &shape.sort {
                rows.sort_by(|a, b| sort.compare(a, b));
            }
            Value::Array(rows)
        }

        pub fn get(&self, id: &Value) -> Option<Row> {
            let id = RowId::from_value(id)?;
            self.rows()
                .into_iter()
                .find(|row| id.matches(&row["id"]))
        }

        pub fn stats(&self) -> Value {
            let rows = self.rows();
            let booked = rows.iter().filter(|row| row["status"] == json!("booked")).count();
            json!({ "total": rows.len(), "booked": booked })
        }

        /// Register query handlers backed by this server on `remote`.
        pub fn install(&self, remote: &MockRemote) {
            let server = self.clone();
            remote.handle("appointment.list", move |input| {
                let filter = input
                    .get("customer")
                    .map(|customer| FilterExpr::eq("customer", customer.clone()));
                Ok(server.list(&ListShape {
                    filter,
                    sort: Some(by_slot()),
                    ..ListShape::default()
                }))
            });

            let server = self.clone();
            remote.handle("appointment.upcoming", move |_| {
                Ok(server.list(&ListShape {
                    filter: Some(upcoming_filter()),
                    sort: Some(by_slot()),
                    ..ListShape::default()
                }))
            });

            let server = self.clone();
            remote.handle("appointment.byId", move |input| {
                server
                    .get(&input["id"])
                    .ok_or_else(|| RemoteError::Server {
                        procedure: "appointment.byId".to_string(),
                        status: 404,
                        message: format!("appointment {} not found", input["id"]),
                    })
            });

            let server = self.clone();
            remote.handle("dashboard.stats", move |_| Ok(server.stats()));
        }
    }
}

// ============================================================================
// GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for VANTAGE types.

    use super::fixtures::BookingOp;
    use proptest::prelude::*;

    pub fn arb_status() -> impl Strategy<Value = String> {
        prop_oneof![Just("booked"), Just("cancelled"), Just("completed")].prop_map(String::from)
    }

    pub fn arb_hour() -> impl Strategy<Value = u32> {
        6u32..20
    }

    pub fn arb_booking_op() -> impl Strategy<Value = BookingOp> {
        prop_oneof![
            3 => (arb_hour(), arb_status())
                .prop_map(|(hour, status)| BookingOp::Insert { hour, status }),
            3 => (any::<usize>(), arb_hour(), arb_status())
                .prop_map(|(pick, hour, status)| BookingOp::Update { pick, hour, status }),
            1 => any::<usize>().prop_map(|pick| BookingOp::Delete { pick }),
        ]
    }

    pub fn arb_booking_ops(max: usize) -> impl Strategy<Value = Vec<BookingOp>> {
        prop::collection::vec(arb_booking_op(), 0..max)
    }

    /// Initial table contents as `(hour, status)` pairs.
    pub fn arb_seed(max: usize) -> impl Strategy<Value = Vec<(u32, String)>> {
        prop::collection::vec((arb_hour(), arb_status()), 0..max)
    }
}
