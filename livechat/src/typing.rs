//! Typing indicators.
//!
//! Two independent concerns live here:
//!
//! - **Remote**: the active set of `(user, chat)` pairs. A `typing` event
//!   adds the pair and (re)starts its expiry timer; `stopTyping` or the
//!   timer removes it.
//! - **Local**: keystrokes from the local user. A [`RateLimiter`] decides
//!   when a `typing` event is worth emitting, and a separate idle timer
//!   emits `stopTyping` after a quiet period.
//!
//! Timers are [`JoinHandle`]s and are aborted, not merely left to fire, on
//! explicit stop, chat switch, and shutdown.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use livechat_proto::events::{ClientEvent, ServerEvent};
use livechat_proto::message::{ChatId, UserId};
use livechat_proto::typing::TypingUser;

use crate::connection::EventSink;

/// Timing for both sides of the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingConfig {
    /// Minimum spacing between local `typing` emissions.
    pub emit_interval: Duration,
    /// How long a remote pair stays active without a fresh signal.
    pub expiry: Duration,
    /// Local quiet period after which `stopTyping` is emitted.
    pub idle_timeout: Duration,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            emit_interval: Duration::from_secs(2),
            expiry: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(3),
        }
    }
}

/// Last-emitted timestamp plus minimum interval.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    min_interval: Duration,
    last: Option<Instant>,
}

impl RateLimiter {
    /// A limiter whose first acquisition always succeeds.
    #[must_use]
    pub const fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    /// Returns `true` and records `now` if more than the minimum interval
    /// has passed since the last acquisition.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) <= self.min_interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    /// Forget the last acquisition.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[derive(Debug)]
struct LocalSession {
    chat_id: ChatId,
    idle_timer: JoinHandle<()>,
    timer_id: u64,
}

struct Inner<S> {
    sink: Arc<S>,
    config: TypingConfig,
    user_id: UserId,
    active: watch::Sender<BTreeSet<TypingUser>>,
    timers: Mutex<HashMap<TypingUser, (u64, JoinHandle<()>)>>,
    limiter: Mutex<RateLimiter>,
    local: Mutex<Option<LocalSession>>,
    seq: AtomicU64,
}

/// Remote typing set plus local typing emission.
pub struct TypingTracker<S: EventSink> {
    inner: Arc<Inner<S>>,
}

impl<S: EventSink> Clone for TypingTracker<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: EventSink> std::fmt::Debug for TypingTracker<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypingTracker")
            .field("user_id", &self.inner.user_id)
            .field("active", &*self.inner.active.borrow())
            .finish_non_exhaustive()
    }
}

impl<S: EventSink> TypingTracker<S> {
    /// Create a tracker for the local user `user_id`.
    pub fn new(sink: Arc<S>, user_id: UserId, config: TypingConfig) -> Self {
        let (active, _) = watch::channel(BTreeSet::new());
        Self {
            inner: Arc::new(Inner {
                sink,
                config,
                user_id,
                active,
                timers: Mutex::new(HashMap::new()),
                limiter: Mutex::new(RateLimiter::new(config.emit_interval)),
                local: Mutex::new(None),
                seq: AtomicU64::new(0),
            }),
        }
    }

    /// Observe the active set.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<BTreeSet<TypingUser>> {
        self.inner.active.subscribe()
    }

    /// All active pairs.
    #[must_use]
    pub fn active(&self) -> Vec<TypingUser> {
        self.inner.active.borrow().iter().cloned().collect()
    }

    /// Users typing in `chat_id`.
    #[must_use]
    pub fn typing_in(&self, chat_id: &ChatId) -> Vec<UserId> {
        self.inner
            .active
            .borrow()
            .iter()
            .filter(|t| &t.chat_id == chat_id)
            .map(|t| t.user_id.clone())
            .collect()
    }

    /// Whether this user is currently shown typing in this chat.
    #[must_use]
    pub fn is_typing(&self, pair: &TypingUser) -> bool {
        self.inner.active.borrow().contains(pair)
    }

    /// Apply a `typing` / `stopTyping` event. Returns `false` for others.
    pub fn apply(&self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::Typing(pair) => {
                self.handle_remote_typing(pair.clone());
                true
            }
            ServerEvent::StopTyping(pair) => {
                self.handle_remote_stop(pair);
                true
            }
            _ => false,
        }
    }

    /// Add `pair` to the active set and (re)start its expiry timer.
    pub fn handle_remote_typing(&self, pair: TypingUser) {
        if pair.user_id == self.inner.user_id {
            return;
        }
        let timer_id = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        {
            let mut timers = self.inner.timers.lock();
            let inner = Arc::clone(&self.inner);
            let key = pair.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(inner.config.expiry).await;
                inner.expire(&key, timer_id);
            });
            if let Some((_, old)) = timers.insert(pair.clone(), (timer_id, handle)) {
                old.abort();
            }
        }
        self.inner.active.send_if_modified(|set| set.insert(pair));
    }

    /// Remove `pair` immediately and cancel its timer.
    pub fn handle_remote_stop(&self, pair: &TypingUser) {
        if let Some((_, timer)) = self.inner.timers.lock().remove(pair) {
            timer.abort();
        }
        self.inner.active.send_if_modified(|set| set.remove(pair));
    }

    /// Record a local keystroke in `chat_id`.
    ///
    /// Emits `typing` at most once per emit interval and restarts the idle
    /// timer. Typing in a different chat first ends the previous session.
    pub fn handle_local_user_typing(&self, chat_id: &ChatId) {
        let switched = self
            .inner
            .local
            .lock()
            .as_ref()
            .is_some_and(|s| &s.chat_id != chat_id);
        if switched {
            self.stop_local_typing();
        }

        if self.inner.limiter.lock().try_acquire(Instant::now()) {
            let event = ClientEvent::Typing(TypingUser::new(self.inner.user_id.clone(), chat_id.clone()));
            if let Err(e) = self.inner.sink.emit(event) {
                tracing::debug!(chat_id = %chat_id, error = %e, "typing signal not sent");
                self.inner.limiter.lock().reset();
            }
        }

        let timer_id = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let idle_timer = tokio::spawn(async move {
            tokio::time::sleep(inner.config.idle_timeout).await;
            inner.local_idle(timer_id);
        });
        let previous = self.inner.local.lock().replace(LocalSession {
            chat_id: chat_id.clone(),
            idle_timer,
            timer_id,
        });
        if let Some(previous) = previous {
            previous.idle_timer.abort();
        }
    }

    /// End the local typing session, emitting a final `stopTyping` if one
    /// was active. Call on chat switch and unmount.
    pub fn stop_local_typing(&self) {
        let session = self.inner.local.lock().take();
        if let Some(session) = session {
            session.idle_timer.abort();
            self.inner.finish_local(&session.chat_id);
        }
    }

    /// Whether the local user has an active typing session.
    #[must_use]
    pub fn is_locally_typing(&self) -> bool {
        self.inner.local.lock().is_some()
    }

    /// Stop local typing and cancel every remote timer.
    pub fn shutdown(&self) {
        self.stop_local_typing();
        let timers: Vec<_> = self.inner.timers.lock().drain().collect();
        for (_, (_, timer)) in timers {
            timer.abort();
        }
        self.inner.active.send_if_modified(|set| {
            let changed = !set.is_empty();
            set.clear();
            changed
        });
    }
}

impl<S: EventSink> Inner<S> {
    fn expire(&self, pair: &TypingUser, timer_id: u64) {
        {
            let mut timers = self.timers.lock();
            match timers.get(pair) {
                Some((id, _)) if *id == timer_id => {
                    timers.remove(pair);
                }
                _ => return,
            }
        }
        tracing::trace!(user_id = %pair.user_id, chat_id = %pair.chat_id, "typing expired");
        self.active.send_if_modified(|set| set.remove(pair));
    }

    fn local_idle(&self, timer_id: u64) {
        let session = {
            let mut local = self.local.lock();
            if local.as_ref().map(|s| s.timer_id) != Some(timer_id) {
                return;
            }
            local.take()
        };
        if let Some(session) = session {
            self.finish_local(&session.chat_id);
        }
    }

    fn finish_local(&self, chat_id: &ChatId) {
        self.limiter.lock().reset();
        let event = ClientEvent::StopTyping(TypingUser::new(self.user_id.clone(), chat_id.clone()));
        if let Err(e) = self.sink.emit(event) {
            tracing::debug!(chat_id = %chat_id, error = %e, "stop-typing signal not sent");
        }
    }
}
