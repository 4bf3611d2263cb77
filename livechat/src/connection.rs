//! Connection lifecycle management.
//!
//! [`ConnectionManager`] owns at most one live [`Channel`] per session. It
//! publishes its [`ConnectionState`] on a `watch` channel, fans inbound
//! [`ServerEvent`]s out on a `broadcast` channel, and reconnects with
//! capped exponential backoff when the channel drops. Transport failures
//! never escape as errors: they become state transitions.
//!
//! Components that only need to emit depend on the narrow [`EventSink`]
//! trait instead of the manager itself.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use livechat_proto::events::{ClientEvent, Probe, ServerEvent};

use crate::transport::{AuthToken, Channel, ChannelEvent, ChannelTasks, Transport, TransportError};

/// Default capacity of the inbound event broadcast.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Process-wide connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No channel and no reconnect in progress.
    #[default]
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// A channel is open and authenticated.
    Connected,
    /// The channel dropped; automatic attempts are running.
    Reconnecting,
    /// Attempts exhausted or auth rejected; waiting for an explicit `connect`.
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Error returned when an event cannot be handed to the channel.
///
/// Callers treat this as a delivery failure, not a fault.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EmitError {
    /// There is no connected channel.
    #[error("not connected")]
    NotConnected,
    /// The outbound buffer is full.
    #[error("outbound buffer full")]
    Backpressure,
    /// The channel closed while emitting.
    #[error("channel closed")]
    ChannelClosed,
}

/// Narrow emit interface shared by presence, typing, and delivery.
pub trait EventSink: Send + Sync + 'static {
    /// Hand an event to the live channel without waiting.
    ///
    /// # Errors
    ///
    /// Fails immediately if there is no connected channel.
    fn emit(&self, event: ClientEvent) -> Result<(), EmitError>;

    /// Whether emits can currently succeed.
    fn is_connected(&self) -> bool;
}

/// Reconnect policy: capped exponential backoff with an attempt ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Attempts before giving up and entering [`ConnectionState::Failed`].
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectConfig {
    /// Delay before the given 1-based attempt: `initial * 2^(attempt-1)`,
    /// capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// The live channel plus the pump task draining it.
struct Link {
    id: u64,
    outbound: mpsc::Sender<ClientEvent>,
    tasks: ChannelTasks,
    _pump: ChannelTasks,
}

#[derive(Default)]
struct ReconnectSlot {
    active: Option<u64>,
    task: Option<JoinHandle<()>>,
}

struct Inner<T> {
    transport: T,
    config: ReconnectConfig,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<ServerEvent>,
    token: Mutex<Option<AuthToken>>,
    link: Mutex<Option<Link>>,
    reconnect: Mutex<ReconnectSlot>,
    probes: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    generation: AtomicU64,
    seq: AtomicU64,
}

/// Owns the session's channel and keeps it alive.
///
/// Cheap to clone; clones share the same connection.
pub struct ConnectionManager<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for ConnectionManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> fmt::Debug for ConnectionManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("transport", &self.inner.transport.transport_type())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> ConnectionManager<T> {
    /// Create a manager in the `Disconnected` state.
    pub fn new(transport: T, config: ReconnectConfig) -> Self {
        Self::with_capacity(transport, config, DEFAULT_EVENT_CAPACITY)
    }

    /// Create a manager with a custom inbound broadcast capacity.
    pub fn with_capacity(transport: T, config: ReconnectConfig, capacity: usize) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                state_tx,
                events_tx,
                token: Mutex::new(None),
                link: Mutex::new(None),
                reconnect: Mutex::new(ReconnectSlot::default()),
                probes: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                seq: AtomicU64::new(0),
            }),
        }
    }

    /// Open a channel authenticated with `token`.
    ///
    /// A no-op when already connected. On a network failure the manager
    /// starts reconnecting in the background; an auth rejection goes
    /// straight to [`ConnectionState::Failed`]. Returns the state reached.
    pub async fn connect(&self, token: AuthToken) -> ConnectionState {
        if self.is_connected() {
            return ConnectionState::Connected;
        }
        let generation = self.inner.begin_epoch();
        *self.inner.token.lock() = Some(token.clone());
        self.inner.set_state(ConnectionState::Connecting);

        match self.inner.transport.open(&token).await {
            Ok(channel) => {
                if self.inner.is_stale(generation) {
                    tracing::debug!("connect superseded, dropping channel");
                    return self.state();
                }
                Inner::install(&self.inner, channel);
                self.inner.set_state(ConnectionState::Connected);
            }
            Err(TransportError::AuthRejected(reason)) => {
                tracing::warn!(%reason, "authentication rejected");
                if !self.inner.is_stale(generation) {
                    self.inner.set_state(ConnectionState::Failed);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "connect failed");
                if !self.inner.is_stale(generation) {
                    Inner::spawn_reconnect(&self.inner);
                }
            }
        }
        self.state()
    }

    /// Tear down the channel and stop reconnecting. Idempotent.
    pub fn disconnect(&self) {
        self.inner.begin_epoch();
        *self.inner.token.lock() = None;
        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// Like [`disconnect`](Self::disconnect), but lets the channel flush
    /// queued outbound events for up to `grace` before tearing it down.
    pub async fn close(&self, grace: Duration) {
        let link = self.inner.link.lock().take();
        self.disconnect();
        if let Some(Link { outbound, tasks, .. }) = link {
            drop(outbound);
            tasks.finish(grace).await;
        }
    }

    /// Drop the current channel and reconnect with the same token.
    ///
    /// Returns `false` without doing anything if a reconnect is already in
    /// flight or there is no session token.
    pub fn force_reconnect(&self) -> bool {
        if self.inner.token.lock().is_none() {
            return false;
        }
        tracing::info!("forcing reconnect");
        Inner::spawn_reconnect(&self.inner)
    }

    /// Send a ping and wait up to `timeout` for the matching pong.
    pub async fn probe(&self, timeout: Duration) -> bool {
        let nonce = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.probes.lock().insert(nonce, tx);

        if let Err(e) = self.emit(ClientEvent::Ping(Probe { nonce })) {
            tracing::debug!(error = %e, "probe not sent");
            self.inner.probes.lock().remove(&nonce);
            return false;
        }
        let answered = matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(())));
        self.inner.probes.lock().remove(&nonce);
        if !answered {
            tracing::warn!(nonce, "health probe unanswered");
        }
        answered
    }

    /// Subscribe to inbound server events (`pong` excluded).
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Observe connection state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Whether a channel is open and authenticated.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected && self.inner.link.lock().is_some()
    }

    /// Hand an event to the live channel.
    ///
    /// # Errors
    ///
    /// [`EmitError::NotConnected`] when there is no connected channel,
    /// [`EmitError::Backpressure`] when the outbound buffer is full.
    pub fn emit(&self, event: ClientEvent) -> Result<(), EmitError> {
        if self.state() != ConnectionState::Connected {
            return Err(EmitError::NotConnected);
        }
        let link = self.inner.link.lock();
        let link = link.as_ref().ok_or(EmitError::NotConnected)?;
        link.outbound.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EmitError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => EmitError::ChannelClosed,
        })
    }

    /// The reconnect policy in effect.
    #[must_use]
    pub fn reconnect_config(&self) -> ReconnectConfig {
        self.inner.config
    }
}

impl<T: Transport> EventSink for ConnectionManager<T> {
    fn emit(&self, event: ClientEvent) -> Result<(), EmitError> {
        Self::emit(self, event)
    }

    fn is_connected(&self) -> bool {
        Self::is_connected(self)
    }
}

impl<T: Transport> Inner<T> {
    fn set_state(&self, next: ConnectionState) {
        self.state_tx.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            tracing::info!(from = %state, to = %next, "connection state changed");
            *state = next;
            true
        });
    }

    fn is_stale(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) != generation
    }

    /// Starts a new session epoch: cancels reconnect loops, drops the
    /// channel, and fails outstanding probes.
    fn begin_epoch(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut slot = self.reconnect.lock();
            if let Some(task) = slot.task.take() {
                task.abort();
            }
            slot.active = None;
        }
        let link = self.link.lock().take();
        drop(link);
        self.probes.lock().clear();
        generation
    }

    fn install(inner: &Arc<Self>, channel: Channel) {
        let (outbound, inbound, tasks) = channel.into_parts();
        let id = inner.seq.fetch_add(1, Ordering::Relaxed);
        let mut link = inner.link.lock();
        let pump_task = tokio::spawn(pump(Arc::clone(inner), inbound, id));
        *link = Some(Link {
            id,
            outbound,
            tasks,
            _pump: ChannelTasks::new(vec![pump_task]),
        });
    }

    /// Starts a reconnect loop unless one is already in flight.
    fn spawn_reconnect(inner: &Arc<Self>) -> bool {
        let mut slot = inner.reconnect.lock();
        if slot.active.is_some() {
            tracing::debug!("reconnect already in flight");
            return false;
        }
        let old = inner.link.lock().take();
        drop(old);
        inner.probes.lock().clear();

        let loop_id = inner.seq.fetch_add(1, Ordering::Relaxed);
        let generation = inner.generation.load(Ordering::SeqCst);
        inner.set_state(ConnectionState::Reconnecting);
        slot.active = Some(loop_id);
        slot.task = Some(tokio::spawn(reconnect_loop(
            Arc::clone(inner),
            generation,
            loop_id,
        )));
        true
    }

    /// Ends a reconnect loop with the given outcome, unless superseded.
    fn finish_reconnect(inner: &Arc<Self>, loop_id: u64, outcome: Result<Channel, ConnectionState>) {
        let mut slot = inner.reconnect.lock();
        if slot.active != Some(loop_id) {
            return;
        }
        match outcome {
            Ok(channel) => {
                Self::install(inner, channel);
                inner.set_state(ConnectionState::Connected);
            }
            Err(state) => inner.set_state(state),
        }
        slot.active = None;
    }

    fn on_link_failure(inner: &Arc<Self>, link_id: u64, reason: &str, auth_failure: bool) {
        let link = {
            let mut current = inner.link.lock();
            if current.as_ref().map(|l| l.id) != Some(link_id) {
                return;
            }
            current.take()
        };
        tracing::warn!(%reason, "channel lost");
        inner.probes.lock().clear();
        if auth_failure {
            inner.set_state(ConnectionState::Failed);
        } else {
            Self::spawn_reconnect(inner);
        }
        // Dropping the link aborts this pump; keep it last.
        drop(link);
    }
}

/// Drains one channel: resolves probes, fans out events, reports loss.
async fn pump<T: Transport>(
    inner: Arc<Inner<T>>,
    mut inbound: mpsc::Receiver<ChannelEvent>,
    link_id: u64,
) {
    let (reason, auth_failure) = loop {
        match inbound.recv().await {
            Some(ChannelEvent::Event(ServerEvent::Pong(probe))) => {
                if let Some(tx) = inner.probes.lock().remove(&probe.nonce) {
                    let _ = tx.send(());
                }
            }
            Some(ChannelEvent::Event(ServerEvent::SocketError(err))) => {
                let auth = err.is_auth_failure();
                let reason = format!("server error: {err}");
                let _ = inner.events_tx.send(ServerEvent::SocketError(err));
                break (reason, auth);
            }
            Some(ChannelEvent::Event(ServerEvent::Disconnect)) => {
                let _ = inner.events_tx.send(ServerEvent::Disconnect);
                break ("server disconnected".to_string(), false);
            }
            Some(ChannelEvent::Event(event)) => {
                tracing::trace!(event = event.name(), "dispatching event");
                let _ = inner.events_tx.send(event);
            }
            Some(ChannelEvent::Closed { reason }) => break (reason, false),
            None => break ("channel dropped".to_string(), false),
        }
    };
    Inner::on_link_failure(&inner, link_id, &reason, auth_failure);
}

async fn reconnect_loop<T: Transport>(inner: Arc<Inner<T>>, generation: u64, loop_id: u64) {
    let Some(token) = inner.token.lock().clone() else {
        Inner::finish_reconnect(&inner, loop_id, Err(ConnectionState::Disconnected));
        return;
    };
    let max_attempts = inner.config.max_attempts;
    for attempt in 1..=max_attempts {
        let delay = inner.config.delay_for(attempt);
        tracing::info!(
            attempt,
            max_attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "scheduling reconnect"
        );
        tokio::time::sleep(delay).await;
        if inner.is_stale(generation) {
            return;
        }
        match inner.transport.open(&token).await {
            Ok(channel) => {
                tracing::info!(attempt, "reconnected");
                Inner::finish_reconnect(&inner, loop_id, Ok(channel));
                return;
            }
            Err(TransportError::AuthRejected(reason)) => {
                tracing::warn!(%reason, "authentication rejected on reconnect");
                Inner::finish_reconnect(&inner, loop_id, Err(ConnectionState::Failed));
                return;
            }
            Err(e) => {
                tracing::warn!(attempt, error = %e, "reconnect attempt failed");
            }
        }
    }
    tracing::error!(max_attempts, "reconnect attempts exhausted");
    Inner::finish_reconnect(&inner, loop_id, Err(ConnectionState::Failed));
}

/// An [`EventSink`] that records emitted events, for tests and demos.
#[derive(Debug, Default)]
pub struct RecordingSink {
    connected: std::sync::atomic::AtomicBool,
    events: Mutex<Vec<ClientEvent>>,
}

impl RecordingSink {
    /// A sink that accepts emits.
    #[must_use]
    pub fn connected() -> Self {
        Self {
            connected: std::sync::atomic::AtomicBool::new(true),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Toggle whether emits succeed.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Events emitted so far, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<ClientEvent> {
        self.events.lock().clone()
    }

    /// Remove and return everything recorded.
    pub fn take(&self) -> Vec<ClientEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: ClientEvent) -> Result<(), EmitError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(EmitError::NotConnected);
        }
        self.events.lock().push(event);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
