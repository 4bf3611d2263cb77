//! Connection recovery orchestrator.
//!
//! A long-running task that supervises the [`ConnectionManager`] without
//! owning it. Each of these triggers can start a health check on its own:
//!
//! - a periodic interval while the connection is `Connected`,
//! - the host becoming visible after a period of staleness,
//! - the host coming back online (after a short settle delay).
//!
//! A failed probe always forces a reconnect. When the connection reaches
//! `Connected`, or a visibility or online trigger finds it healthy, the
//! orchestrator resyncs: it refreshes the chat list, replays the pending
//! queue, and re-announces presence. Going offline announces it on a
//! best-effort basis.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::api::ChatApi;
use crate::chat::delivery::DeliveryManager;
use crate::chat::directory::ChatDirectory;
use crate::chat::queue::RetryReport;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::presence::PresenceTracker;
use crate::transport::Transport;

/// Host lifecycle signals fed to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The UI became visible.
    Visible,
    /// The UI was hidden.
    Hidden,
    /// Network connectivity returned.
    Online,
    /// Network connectivity was lost.
    Offline,
}

/// Orchestrator timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryConfig {
    /// Period of the health check while connected.
    pub health_interval: Duration,
    /// How long a probe waits for its pong.
    pub probe_timeout: Duration,
    /// Idle time after which becoming visible triggers a probe.
    pub staleness: Duration,
    /// Delay between an `Online` signal and the probe.
    pub settle_delay: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            staleness: Duration::from_secs(5 * 60),
            settle_delay: Duration::from_secs(1),
        }
    }
}

/// What a resync did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResyncReport {
    /// Chats listed after the refresh, `None` if the refresh failed.
    pub chats: Option<usize>,
    /// Outcome of the queue replay.
    pub retry: RetryReport,
    /// Whether the online announcement went out.
    pub announced: bool,
}

/// Supervises one connection and the state that depends on it.
pub struct RecoveryOrchestrator<T: Transport, A: ChatApi> {
    connection: ConnectionManager<T>,
    api: Arc<A>,
    directory: Arc<ChatDirectory>,
    delivery: Arc<DeliveryManager<A, ConnectionManager<T>>>,
    presence: Arc<PresenceTracker<ConnectionManager<T>>>,
    config: RecoveryConfig,
    state_rx: watch::Receiver<ConnectionState>,
    last_active: Instant,
}

impl<T: Transport, A: ChatApi> std::fmt::Debug for RecoveryOrchestrator<T, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryOrchestrator")
            .field("config", &self.config)
            .field("state", &self.connection.state())
            .finish_non_exhaustive()
    }
}

impl<T: Transport, A: ChatApi> RecoveryOrchestrator<T, A> {
    /// Build an orchestrator over already-wired components.
    ///
    /// State changes are observed from this call on, so build it before
    /// connecting to see the first `Connected`.
    pub fn new(
        connection: ConnectionManager<T>,
        api: Arc<A>,
        directory: Arc<ChatDirectory>,
        delivery: Arc<DeliveryManager<A, ConnectionManager<T>>>,
        presence: Arc<PresenceTracker<ConnectionManager<T>>>,
        config: RecoveryConfig,
    ) -> Self {
        let state_rx = connection.watch_state();
        Self {
            connection,
            api,
            directory,
            delivery,
            presence,
            config,
            state_rx,
            last_active: Instant::now(),
        }
    }

    /// Run the orchestrator on its own task until `shutdown` flips to
    /// `true` or its sender is dropped.
    pub fn spawn(
        self,
        lifecycle: mpsc::Receiver<LifecycleEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(lifecycle, shutdown))
    }

    /// The orchestrator loop.
    pub async fn run(
        mut self,
        mut lifecycle: mpsc::Receiver<LifecycleEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let period = self.config.health_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut state_rx = self.state_rx.clone();
        let mut lifecycle_open = true;

        tracing::debug!(interval_secs = period.as_secs(), "recovery orchestrator started");
        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if self.connection.state() == ConnectionState::Connected {
                        self.check_health("interval").await;
                    }
                }
                event = lifecycle.recv(), if lifecycle_open => match event {
                    Some(event) => self.on_lifecycle(event).await,
                    None => lifecycle_open = false,
                },
                res = state_rx.changed() => {
                    if res.is_err() {
                        break;
                    }
                    let state = *state_rx.borrow_and_update();
                    if state == ConnectionState::Connected && self.check_health("connected").await {
                        self.resync().await;
                    }
                }
            }
        }
        tracing::debug!("recovery orchestrator stopped");
    }

    /// Probe the connection; force a reconnect if the probe fails.
    ///
    /// Returns whether the connection is healthy.
    pub async fn check_health(&mut self, trigger: &'static str) -> bool {
        if self.connection.probe(self.config.probe_timeout).await {
            self.last_active = Instant::now();
            tracing::trace!(trigger, "connection healthy");
            return true;
        }
        let started = self.connection.force_reconnect();
        tracing::warn!(
            trigger,
            state = %self.connection.state(),
            reconnect_started = started,
            "health check failed"
        );
        false
    }

    /// Refresh the chat list, replay the pending queue, and announce
    /// presence. Each step runs even if an earlier one failed.
    pub async fn resync(&mut self) -> ResyncReport {
        let chats = match self.directory.refresh(&*self.api).await {
            Ok(count) => Some(count),
            Err(e) => {
                tracing::warn!(error = %e, "chat list refresh failed");
                None
            }
        };

        let delivery = Arc::clone(&self.delivery);
        let retry = self
            .delivery
            .queue()
            .retry_failed_messages(|pending| {
                let delivery = Arc::clone(&delivery);
                async move { delivery.redeliver(&pending).await }
            })
            .await;

        let announced = match self.presence.announce_online() {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(error = %e, "online announcement not sent");
                false
            }
        };
        tracing::info!(
            chats = ?chats,
            replayed = retry.delivered.len(),
            still_pending = self.delivery.queue().len(),
            "resync complete"
        );
        ResyncReport {
            chats,
            retry,
            announced,
        }
    }

    async fn on_lifecycle(&mut self, event: LifecycleEvent) {
        tracing::debug!(?event, "lifecycle event");
        match event {
            LifecycleEvent::Visible => {
                let idle = self.last_active.elapsed();
                self.last_active = Instant::now();
                if idle > self.config.staleness {
                    tracing::info!(idle_secs = idle.as_secs(), "stale on resume, probing");
                    if self.check_health("visible").await {
                        self.resync().await;
                    }
                }
            }
            LifecycleEvent::Hidden => self.last_active = Instant::now(),
            LifecycleEvent::Online => {
                tokio::time::sleep(self.config.settle_delay).await;
                if self.check_health("online").await {
                    self.resync().await;
                }
            }
            LifecycleEvent::Offline => {
                if let Err(e) = self.presence.announce_offline() {
                    tracing::debug!(error = %e, "offline announcement not sent");
                }
            }
        }
    }
}
