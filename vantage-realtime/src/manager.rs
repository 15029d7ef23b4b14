//! Streaming connection manager.
//!
//! One manager owns one push channel shared by every live subscription.
//! Subscriptions are reference counted: the first holder of a subscription
//! starts the connection actor, the last release tears it down.
//!
//! Connection lifecycle:
//!
//! ```text
//! Connecting -> Open -> Degraded -> Reconnecting -> Open | Closed
//! ```
//!
//! While `Open`, every frame from the current channel refreshes the
//! heartbeat. A monitor tick finding the heartbeat older than the timeout
//! degrades the connection, closes the channel and reconnects with backoff.
//! Change events received while not `Open` are buffered and handed to the
//! sink in arrival order as soon as the new channel is open.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use vantage_core::{ChangeEvent, ChannelError, ConnectionState, PushMessage, StoreError, VantageResult};

use crate::backoff::Backoff;
use crate::config::RealtimeConfig;
use crate::sink::ChangeSink;
use crate::source::{
    Channel, ChannelSink, ConnectionId, Inbound, InboundFrame, PushSource, Subscription,
    SubscriptionKey, SubscriptionSpec,
};

enum Command {
    Subscribe(SubscriptionSpec),
    Unsubscribe(SubscriptionSpec),
    Shutdown,
}

/// Connection state plus the epoch of the actor allowed to publish it.
struct StateChannel {
    tx: watch::Sender<ConnectionState>,
    epoch: Mutex<u64>,
}

impl StateChannel {
    fn publish(&self, epoch: u64, state: ConnectionState) -> bool {
        let current = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != epoch {
            return false;
        }
        self.tx.send_replace(state);
        true
    }

    /// Retire the running actor (if any) and publish `state`.
    fn advance(&self, state: ConnectionState) -> u64 {
        let mut current = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
        *current += 1;
        self.tx.send_replace(state);
        *current
    }
}

struct Held {
    spec: SubscriptionSpec,
    holders: usize,
}

struct ActorHandle {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct ManagerInner {
    subscriptions: BTreeMap<SubscriptionKey, Held>,
    actor: Option<ActorHandle>,
}

pub struct ConnectionManager {
    source: Arc<dyn PushSource>,
    sink: Arc<dyn ChangeSink>,
    config: RealtimeConfig,
    state: Arc<StateChannel>,
    current_connection: Arc<AtomicU64>,
    connection_counter: Arc<AtomicU64>,
    inner: Mutex<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(source: Arc<dyn PushSource>, sink: Arc<dyn ChangeSink>, config: RealtimeConfig) -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Closed);
        Self {
            source,
            sink,
            config,
            state: Arc::new(StateChannel {
                tx,
                epoch: Mutex::new(0),
            }),
            current_connection: Arc::new(AtomicU64::new(0)),
            connection_counter: Arc::new(AtomicU64::new(0)),
            inner: Mutex::new(ManagerInner::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, ManagerInner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::LockPoisoned)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.tx.borrow()
    }

    /// Receiver for connection state changes ("live updates degraded").
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.lock().map(|inner| inner.actor.is_some()).unwrap_or(false)
    }

    /// Add a holder of `spec`, starting the connection if this is the first
    /// subscription. Must be called from within a Tokio runtime.
    pub fn subscribe(self: &Arc<Self>, spec: SubscriptionSpec) -> VantageResult<LiveSubscription> {
        self.sink.listen(&spec)?;

        let mut inner = self.lock()?;
        let key = spec.key();
        let is_new = match inner.subscriptions.get_mut(&key) {
            Some(held) => {
                held.holders += 1;
                false
            }
            None => {
                inner.subscriptions.insert(
                    key,
                    Held {
                        spec: spec.clone(),
                        holders: 1,
                    },
                );
                true
            }
        };

        if inner.actor.is_none() {
            let specs = inner.subscriptions.values().map(|h| h.spec.clone()).collect();
            let actor = self.spawn_actor(specs);
            inner.actor = Some(actor);
        } else if is_new {
            if let Some(actor) = &inner.actor {
                let _ = actor.commands.send(Command::Subscribe(spec.clone()));
            }
        }
        debug!(entity = %spec.entity, shared = !is_new, "Live subscription added");

        Ok(LiveSubscription {
            manager: self.clone(),
            spec,
            active: true,
        })
    }

    /// Active subscriptions with their holder counts.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        let Ok(inner) = self.lock() else {
            return Vec::new();
        };
        let connection = match self.current_connection.load(Ordering::SeqCst) {
            0 => None,
            id => Some(id),
        };
        inner
            .subscriptions
            .values()
            .map(|held| Subscription {
                entity: held.spec.entity.clone(),
                filter: held.spec.filter.clone(),
                connection_id: connection,
                last_event_sequence: self.sink.last_sequence(&held.spec.entity),
                holders: held.holders,
            })
            .collect()
    }

    /// Stop the connection and drop every subscription.
    pub async fn shutdown(&self) {
        let (actor, released) = match self.lock() {
            Ok(mut inner) => {
                let released: Vec<Held> = std::mem::take(&mut inner.subscriptions).into_values().collect();
                (inner.actor.take(), released)
            }
            Err(_) => return,
        };
        self.state.advance(ConnectionState::Closed);
        self.current_connection.store(0, Ordering::SeqCst);

        for held in &released {
            for _ in 0..held.holders {
                if let Err(err) = self.sink.forget(&held.spec) {
                    warn!(entity = %held.spec.entity, error = %err, "Failed to release subscription");
                }
            }
        }
        if let Some(actor) = actor {
            let _ = actor.commands.send(Command::Shutdown);
            let _ = actor.task.await;
        }
        info!("Connection manager shut down");
    }

    fn release(&self, spec: &SubscriptionSpec) -> VantageResult<()> {
        let retired = {
            let mut inner = self.lock()?;
            let key = spec.key();
            let Some(held) = inner.subscriptions.get_mut(&key) else {
                return Ok(());
            };
            held.holders -= 1;
            let remaining = held.holders;

            if remaining == 0 {
                inner.subscriptions.remove(&key);
                if let Some(actor) = &inner.actor {
                    let _ = actor.commands.send(Command::Unsubscribe(spec.clone()));
                }
            }
            if inner.subscriptions.is_empty() {
                inner.actor.take()
            } else {
                None
            }
        };

        if let Some(actor) = retired {
            let _ = actor.commands.send(Command::Shutdown);
            self.state.advance(ConnectionState::Closed);
            self.current_connection.store(0, Ordering::SeqCst);
            info!("Last live subscription released, connection closed");
        }
        self.sink.forget(spec)
    }

    fn spawn_actor(&self, specs: Vec<SubscriptionSpec>) -> ActorHandle {
        let epoch = self.state.advance(ConnectionState::Connecting);
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let actor = Actor {
            source: self.source.clone(),
            sink: self.sink.clone(),
            config: self.config.clone(),
            state: self.state.clone(),
            epoch,
            commands: command_rx,
            inbound_tx,
            inbound_rx,
            specs: specs.into_iter().map(|spec| (spec.key(), spec)).collect(),
            buffer: Vec::new(),
            backoff: Backoff::new(self.config.reconnect.clone()),
            current: 0,
            current_connection: self.current_connection.clone(),
            connection_counter: self.connection_counter.clone(),
        };
        info!(epoch, "Starting push connection");
        ActorHandle {
            commands,
            task: tokio::spawn(actor.run()),
        }
    }
}

/// Handle for one holder of a live subscription. Dropping it unsubscribes.
pub struct LiveSubscription {
    manager: Arc<ConnectionManager>,
    spec: SubscriptionSpec,
    active: bool,
}

impl LiveSubscription {
    pub fn spec(&self) -> &SubscriptionSpec {
        &self.spec
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn unsubscribe(mut self) -> VantageResult<()> {
        self.active = false;
        self.manager.release(&self.spec)
    }
}

impl Drop for LiveSubscription {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Err(err) = self.manager.release(&self.spec) {
            warn!(entity = %self.spec.entity, error = %err, "Failed to release live subscription");
        }
    }
}

// ============================================================================
// CONNECTION ACTOR
// ============================================================================

enum Exit {
    Shutdown,
    Lost,
}

struct Actor {
    source: Arc<dyn PushSource>,
    sink: Arc<dyn ChangeSink>,
    config: RealtimeConfig,
    state: Arc<StateChannel>,
    epoch: u64,
    commands: mpsc::UnboundedReceiver<Command>,
    inbound_tx: mpsc::UnboundedSender<InboundFrame>,
    inbound_rx: mpsc::UnboundedReceiver<InboundFrame>,
    specs: BTreeMap<SubscriptionKey, SubscriptionSpec>,
    /// Change events received while no channel is open.
    buffer: Vec<ChangeEvent>,
    backoff: Backoff,
    current: ConnectionId,
    current_connection: Arc<AtomicU64>,
    connection_counter: Arc<AtomicU64>,
}

impl Actor {
    async fn run(mut self) {
        let mut reconnecting = false;
        let mut ever_opened = false;

        loop {
            if reconnecting {
                self.publish(ConnectionState::Reconnecting);
                if !self.wait_backoff().await {
                    break;
                }
            }

            let channel = match self.connect().await {
                Ok(Some(channel)) => channel,
                Ok(None) => break,
                Err(err) => {
                    warn!(
                        connection_id = self.current,
                        attempt = self.backoff.attempts() + 1,
                        error = %err,
                        "Push channel connect failed"
                    );
                    reconnecting = true;
                    continue;
                }
            };

            self.publish(ConnectionState::Open);
            self.backoff.reset();
            info!(
                connection_id = self.current,
                subscriptions = self.specs.len(),
                buffered = self.buffer.len(),
                "Push channel open"
            );

            for event in std::mem::take(&mut self.buffer) {
                self.deliver(event);
            }
            if ever_opened {
                if let Err(err) = self.sink.reconnected() {
                    warn!(error = %err, "Post-reconnect resync failed");
                }
            }
            ever_opened = true;

            match self.live(channel).await {
                Exit::Shutdown => break,
                Exit::Lost => reconnecting = true,
            }
        }
        debug!(epoch = self.epoch, "Connection actor stopped");
    }

    fn publish(&self, state: ConnectionState) {
        if self.state.publish(self.epoch, state) {
            debug!(connection_id = self.current, state = %state, "Connection state changed");
        }
    }

    /// Open a channel and subscribe every spec on it. `Ok(None)` means the
    /// manager shut down meanwhile.
    async fn connect(&mut self) -> Result<Option<Box<dyn Channel>>, ChannelError> {
        let id = self.connection_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.current = id;
        self.current_connection.store(id, Ordering::SeqCst);

        let source = self.source.clone();
        let connect = source.connect(ChannelSink::new(id, self.inbound_tx.clone()));
        tokio::pin!(connect);

        let channel = loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => {
                    if !self.apply_offline(command) {
                        return Ok(None);
                    }
                }
                Some(frame) = self.inbound_rx.recv() => self.buffer_frame(frame),
                result = &mut connect => break result?,
            }
        };

        for spec in self.specs.values() {
            if let Err(err) = channel.subscribe(spec).await {
                channel.close().await;
                return Err(err);
            }
        }
        Ok(Some(channel))
    }

    /// Sleep for the next backoff delay. Returns `false` on shutdown.
    async fn wait_backoff(&mut self) -> bool {
        let delay = self.backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "Waiting before reconnect");
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => {
                    if !self.apply_offline(command) {
                        return false;
                    }
                }
                Some(frame) = self.inbound_rx.recv() => self.buffer_frame(frame),
                _ = &mut sleep => return true,
            }
        }
    }

    async fn live(&mut self, channel: Box<dyn Channel>) -> Exit {
        let mut last_heartbeat = Instant::now();
        let mut monitor = interval(self.config.monitor_interval);
        monitor.set_missed_tick_behavior(MissedTickBehavior::Skip);
        monitor.reset();

        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => {
                        channel.close().await;
                        return Exit::Shutdown;
                    }
                    Some(Command::Subscribe(spec)) => {
                        let result = channel.subscribe(&spec).await;
                        self.specs.insert(spec.key(), spec);
                        if let Err(err) = result {
                            warn!(connection_id = self.current, error = %err, "Subscribe failed on open channel");
                            return self.lose(channel).await;
                        }
                    }
                    Some(Command::Unsubscribe(spec)) => {
                        self.specs.remove(&spec.key());
                        if let Err(err) = channel.unsubscribe(&spec).await {
                            debug!(entity = %spec.entity, error = %err, "Unsubscribe failed");
                        }
                    }
                },
                Some(frame) = self.inbound_rx.recv() => {
                    if frame.connection_id != self.current {
                        // Late traffic from a replaced channel: the data is real,
                        // its liveness is not.
                        if let Inbound::Message(PushMessage::Change(event)) = frame.payload {
                            self.deliver(event);
                        }
                        continue;
                    }
                    last_heartbeat = Instant::now();
                    match frame.payload {
                        Inbound::Message(PushMessage::Change(event)) => self.deliver(event),
                        Inbound::Message(PushMessage::KeepAlive) => {
                            trace!(connection_id = self.current, "Keep-alive");
                        }
                        Inbound::Error(err) => {
                            warn!(connection_id = self.current, error = %err, "Push channel transport error");
                            return self.lose(channel).await;
                        }
                        Inbound::Closed => {
                            warn!(connection_id = self.current, "Push channel closed by remote");
                            return self.lose(channel).await;
                        }
                    }
                }
                _ = monitor.tick() => {
                    let silent = last_heartbeat.elapsed();
                    if silent >= self.config.heartbeat_timeout {
                        warn!(
                            connection_id = self.current,
                            silent_ms = silent.as_millis() as u64,
                            "Heartbeat timeout"
                        );
                        return self.lose(channel).await;
                    }
                }
            }
        }
    }

    async fn lose(&self, channel: Box<dyn Channel>) -> Exit {
        self.publish(ConnectionState::Degraded);
        channel.close().await;
        Exit::Lost
    }

    fn apply_offline(&mut self, command: Option<Command>) -> bool {
        match command {
            None | Some(Command::Shutdown) => false,
            Some(Command::Subscribe(spec)) => {
                self.specs.insert(spec.key(), spec);
                true
            }
            Some(Command::Unsubscribe(spec)) => {
                self.specs.remove(&spec.key());
                true
            }
        }
    }

    fn buffer_frame(&mut self, frame: InboundFrame) {
        match frame.payload {
            Inbound::Message(PushMessage::Change(event)) => {
                trace!(
                    connection_id = frame.connection_id,
                    entity = %event.entity,
                    sequence = event.sequence,
                    "Buffering change event"
                );
                self.buffer.push(event);
            }
            Inbound::Message(PushMessage::KeepAlive) | Inbound::Closed => {}
            Inbound::Error(err) => {
                debug!(connection_id = frame.connection_id, error = %err, "Ignoring error while not open");
            }
        }
    }

    fn deliver(&self, event: ChangeEvent) {
        let entity = event.entity.clone();
        let sequence = event.sequence;
        if let Err(err) = self.sink.deliver(event) {
            warn!(entity = %entity, sequence, error = %err, "Failed to reconcile change event");
        }
    }
}
