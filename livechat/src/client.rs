//! Client facade.
//!
//! [`ChatClient`] wires the connection manager, message cache, delivery
//! state machine, chat directory, presence and typing trackers, and the
//! recovery orchestrator into one session object.
//!
//! # Architecture
//!
//! ```text
//! UI ── send / typing / lifecycle ──▶ ChatClient ──▶ DeliveryManager ──▶ ChatApi
//!                                        │                 │
//!                                        ▼                 ▼
//!                               ConnectionManager ◀── EventSink emits
//!                                        │
//!                         broadcast<ServerEvent> ──▶ dispatch task
//!                                                     ├─▶ DeliveryManager
//!                                                     ├─▶ ChatDirectory
//!                                                     ├─▶ PresenceTracker
//!                                                     └─▶ TypingTracker
//! ```
//!
//! Two background tasks run per session: the inbound dispatch task and the
//! [`RecoveryOrchestrator`]. Both are started by [`ChatClient::start`] and
//! stopped by [`ChatClient::shutdown`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use livechat_proto::events::ServerEvent;
use livechat_proto::message::{ChatId, Message, MessageId, MessageStatus, UserId, ValidationError};

use crate::api::{ApiError, ChatApi};
use crate::chat::MessageCache;
use crate::chat::delivery::{DeliveryError, DeliveryManager};
use crate::chat::directory::ChatDirectory;
use crate::chat::queue::{PendingQueue, QueueConfig};
use crate::connection::{ConnectionManager, ConnectionState, ReconnectConfig};
use crate::presence::PresenceTracker;
use crate::recovery::{LifecycleEvent, RecoveryConfig, RecoveryOrchestrator};
use crate::transport::{AuthToken, Transport};
use crate::typing::{TypingConfig, TypingTracker};

/// Default capacity of the lifecycle signal channel.
const LIFECYCLE_CAPACITY: usize = 16;

/// How long shutdown waits for queued outbound events to flush.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Tuning for every component of a [`ChatClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientSettings {
    /// Reconnect backoff.
    pub reconnect: ReconnectConfig,
    /// Pending queue retry policy.
    pub queue: QueueConfig,
    /// Typing rate limit and expiry.
    pub typing: TypingConfig,
    /// Health check timing.
    pub recovery: RecoveryConfig,
    /// Capacity of the inbound event broadcast.
    pub event_capacity: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            queue: QueueConfig::default(),
            typing: TypingConfig::default(),
            recovery: RecoveryConfig::default(),
            event_capacity: 256,
        }
    }
}

/// Handles for the tasks of a started session.
struct Session {
    dispatch: JoinHandle<()>,
    recovery: JoinHandle<()>,
    lifecycle: mpsc::Sender<LifecycleEvent>,
    shutdown: watch::Sender<bool>,
}

/// Routes inbound server events to the component that owns them.
struct Router<T: Transport, A: ChatApi> {
    delivery: Arc<DeliveryManager<A, ConnectionManager<T>>>,
    directory: Arc<ChatDirectory>,
    presence: Arc<PresenceTracker<ConnectionManager<T>>>,
    typing: TypingTracker<ConnectionManager<T>>,
}

impl<T: Transport, A: ChatApi> Router<T, A> {
    fn route(&self, event: ServerEvent) {
        match event {
            ServerEvent::MessageReceived(message) => {
                self.delivery.apply_received(message);
            }
            ServerEvent::MessageEdited(message) => {
                self.delivery.apply_edited(message);
            }
            ServerEvent::MessageReaction(message) => {
                self.delivery.apply_reaction(message);
            }
            ServerEvent::MessageDeleted(target) => {
                self.delivery.apply_deleted(&target);
            }
            ServerEvent::NewChat(_)
            | ServerEvent::ChatUpdated(_)
            | ServerEvent::ChatDeleted(_)
            | ServerEvent::RemovedFromChat(_)
            | ServerEvent::MessagePinned(_)
            | ServerEvent::MessageUnpinned(_) => {
                self.directory.apply(&event);
            }
            ServerEvent::Typing(_) | ServerEvent::StopTyping(_) => {
                self.typing.apply(&event);
            }
            ServerEvent::UserIsOnline(_)
            | ServerEvent::UserIsOffline(_)
            | ServerEvent::OnlineUserIdsList(_) => {
                self.presence.apply(&event);
            }
            ServerEvent::SocketError(err) => {
                tracing::warn!(error = %err, "server reported an error");
            }
            ServerEvent::Connect | ServerEvent::Disconnect | ServerEvent::Pong(_) => {}
        }
    }
}

async fn dispatch_loop<T: Transport, A: ChatApi>(
    router: Router<T, A>,
    mut events: broadcast::Receiver<ServerEvent>,
) {
    loop {
        match events.recv().await {
            Ok(event) => router.route(event),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "inbound dispatch lagged, events dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
    tracing::debug!("inbound dispatch stopped");
}

/// One authenticated chat session.
pub struct ChatClient<T: Transport, A: ChatApi> {
    user_id: UserId,
    settings: ClientSettings,
    connection: ConnectionManager<T>,
    api: Arc<A>,
    cache: Arc<MessageCache>,
    directory: Arc<ChatDirectory>,
    delivery: Arc<DeliveryManager<A, ConnectionManager<T>>>,
    presence: Arc<PresenceTracker<ConnectionManager<T>>>,
    typing: TypingTracker<ConnectionManager<T>>,
    session: Mutex<Option<Session>>,
}

impl<T: Transport, A: ChatApi> std::fmt::Debug for ChatClient<T, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("user_id", &self.user_id)
            .field("connection", &self.connection)
            .field("started", &self.session.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl<T: Transport, A: ChatApi> ChatClient<T, A> {
    /// Wire a client for `user_id` over `transport` and `api`.
    pub fn new(transport: T, api: Arc<A>, user_id: UserId, settings: ClientSettings) -> Self {
        let connection =
            ConnectionManager::with_capacity(transport, settings.reconnect, settings.event_capacity);
        let sink = Arc::new(connection.clone());
        let cache = Arc::new(MessageCache::default());
        let queue = Arc::new(PendingQueue::new(settings.queue));
        let delivery = Arc::new(DeliveryManager::new(
            Arc::clone(&api),
            Arc::clone(&sink),
            Arc::clone(&cache),
            queue,
            user_id.clone(),
        ));
        let directory = Arc::new(ChatDirectory::new(Arc::clone(&cache)));
        let presence = Arc::new(PresenceTracker::new(Arc::clone(&sink)));
        let typing = TypingTracker::new(sink, user_id.clone(), settings.typing);
        Self {
            user_id,
            settings,
            connection,
            api,
            cache,
            directory,
            delivery,
            presence,
            typing,
            session: Mutex::new(None),
        }
    }

    /// Start the background tasks and connect with `token`.
    ///
    /// Calling `start` on a started client only (re)connects.
    pub async fn start(&self, token: AuthToken) -> ConnectionState {
        {
            let mut session = self.session.lock();
            if session.is_none() {
                *session = Some(self.spawn_session());
            }
        }
        tracing::info!(user_id = %self.user_id, "starting session");
        self.connection.connect(token).await
    }

    fn spawn_session(&self) -> Session {
        let router = Router {
            delivery: Arc::clone(&self.delivery),
            directory: Arc::clone(&self.directory),
            presence: Arc::clone(&self.presence),
            typing: self.typing.clone(),
        };
        let dispatch = tokio::spawn(dispatch_loop(router, self.connection.subscribe()));

        let (lifecycle, lifecycle_rx) = mpsc::channel(LIFECYCLE_CAPACITY);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let recovery = RecoveryOrchestrator::new(
            self.connection.clone(),
            Arc::clone(&self.api),
            Arc::clone(&self.directory),
            Arc::clone(&self.delivery),
            Arc::clone(&self.presence),
            self.settings.recovery,
        )
        .spawn(lifecycle_rx, shutdown_rx);

        Session {
            dispatch,
            recovery,
            lifecycle,
            shutdown,
        }
    }

    /// Announce offline, stop typing, stop the background tasks, and
    /// disconnect. Idempotent.
    pub async fn shutdown(&self) {
        let Some(session) = self.session.lock().take() else {
            return;
        };
        if let Err(e) = self.presence.announce_offline() {
            tracing::debug!(error = %e, "offline announcement not sent");
        }
        self.typing.shutdown();
        let _ = session.shutdown.send(true);
        session.dispatch.abort();
        session.recovery.abort();
        self.connection.close(CLOSE_GRACE).await;
        tracing::info!(user_id = %self.user_id, "session closed");
    }

    /// Forward a host lifecycle signal to the orchestrator.
    ///
    /// Returns `false` if the client is not started or the signal buffer is
    /// full.
    pub fn notify(&self, event: LifecycleEvent) -> bool {
        self.session
            .lock()
            .as_ref()
            .is_some_and(|s| s.lifecycle.try_send(event).is_ok())
    }

    /// Send a message. The returned copy is the entry as it stands after the
    /// network round-trip (`Sent`, or `Failed` and queued).
    ///
    /// # Errors
    ///
    /// [`ValidationError`] for empty or oversized content.
    pub async fn send_message(
        &self,
        chat_id: ChatId,
        content: impl Into<String>,
        reply_to_id: Option<MessageId>,
    ) -> Result<Message, ValidationError> {
        self.typing.stop_local_typing();
        self.delivery.send(chat_id, content.into(), reply_to_id).await
    }

    /// Retry a `Failed` message in place.
    ///
    /// # Errors
    ///
    /// See [`DeliveryManager::retry`].
    pub async fn retry_message(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
    ) -> Result<MessageStatus, DeliveryError> {
        self.delivery.retry(chat_id, message_id).await
    }

    /// Delete a confirmed message.
    ///
    /// # Errors
    ///
    /// See [`DeliveryManager::delete`].
    pub async fn delete_message(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
    ) -> Result<(), DeliveryError> {
        self.delivery.delete(chat_id, message_id).await
    }

    /// Switch to `chat_id`: end any local typing session and load its
    /// messages. Returns whether the fetched page was stored.
    ///
    /// # Errors
    ///
    /// [`ApiError`] if the fetch fails; cached messages are kept.
    pub async fn open_chat(&self, chat_id: &ChatId) -> Result<bool, ApiError> {
        self.typing.stop_local_typing();
        self.cache.load_chat(&*self.api, chat_id).await
    }

    /// Reload the chat list.
    ///
    /// # Errors
    ///
    /// [`ApiError`] if the fetch fails; the cached list is kept.
    pub async fn refresh_chats(&self) -> Result<usize, ApiError> {
        self.directory.refresh(&*self.api).await
    }

    /// Record a local keystroke in `chat_id`.
    pub fn user_typing(&self, chat_id: &ChatId) {
        self.typing.handle_local_user_typing(chat_id);
    }

    #[must_use]
    pub const fn user_id(&self) -> &UserId {
        &self.user_id
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    #[must_use]
    pub const fn connection(&self) -> &ConnectionManager<T> {
        &self.connection
    }

    #[must_use]
    pub const fn cache(&self) -> &Arc<MessageCache> {
        &self.cache
    }

    #[must_use]
    pub const fn directory(&self) -> &Arc<ChatDirectory> {
        &self.directory
    }

    #[must_use]
    pub const fn delivery(&self) -> &Arc<DeliveryManager<A, ConnectionManager<T>>> {
        &self.delivery
    }

    #[must_use]
    pub const fn presence(&self) -> &Arc<PresenceTracker<ConnectionManager<T>>> {
        &self.presence
    }

    #[must_use]
    pub const fn typing(&self) -> &TypingTracker<ConnectionManager<T>> {
        &self.typing
    }
}

impl<T: Transport, A: ChatApi> Drop for ChatClient<T, A> {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.dispatch.abort();
            session.recovery.abort();
        }
    }
}
