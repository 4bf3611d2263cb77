//! Presence tracking.
//!
//! [`PresenceTracker`] keeps the set of online user ids in a `watch`
//! channel so observers see every change. Three inbound events mutate it:
//! a full snapshot (`onlineUserIdsList`), a single join (`userIsOnline`),
//! and a single leave (`userIsOffline`). Joins and leaves are idempotent;
//! a call that changes nothing does not notify.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::watch;

use livechat_proto::events::{ClientEvent, ServerEvent};
use livechat_proto::message::{Timestamp, UserId};

use crate::connection::{EmitError, EventSink};

/// Snapshot of who is online.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OnlineStatusState {
    /// Online users.
    pub online_user_ids: BTreeSet<UserId>,
    /// Time of the last mutation; `None` until the first one.
    pub last_updated: Option<Timestamp>,
}

/// Online roster fed by channel events.
#[derive(Debug)]
pub struct PresenceTracker<S: EventSink> {
    state: watch::Sender<OnlineStatusState>,
    sink: Arc<S>,
}

impl<S: EventSink> PresenceTracker<S> {
    /// Create an empty roster emitting local signals through `sink`.
    pub fn new(sink: Arc<S>) -> Self {
        let (state, _) = watch::channel(OnlineStatusState::default());
        Self { state, sink }
    }

    /// Observe roster changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<OnlineStatusState> {
        self.state.subscribe()
    }

    /// Current roster.
    #[must_use]
    pub fn snapshot(&self) -> OnlineStatusState {
        self.state.borrow().clone()
    }

    /// Replace the roster wholesale. Always counts as a mutation.
    pub fn set_online_user_ids(&self, ids: impl IntoIterator<Item = UserId>) {
        let ids: BTreeSet<UserId> = ids.into_iter().collect();
        tracing::debug!(count = ids.len(), "online roster replaced");
        self.state.send_modify(|s| {
            s.online_user_ids = ids;
            touch(s);
        });
    }

    /// Mark a user online. Returns whether the roster changed.
    pub fn add_online_user(&self, id: UserId) -> bool {
        self.state.send_if_modified(|s| {
            if s.online_user_ids.insert(id) {
                touch(s);
                true
            } else {
                false
            }
        })
    }

    /// Mark a user offline. Returns whether the roster changed.
    pub fn remove_online_user(&self, id: &UserId) -> bool {
        self.state.send_if_modified(|s| {
            if s.online_user_ids.remove(id) {
                touch(s);
                true
            } else {
                false
            }
        })
    }

    /// Apply a presence event. Returns `false` for other events.
    pub fn apply(&self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::OnlineUserIdsList(ids) => {
                self.set_online_user_ids(ids.iter().cloned());
                true
            }
            ServerEvent::UserIsOnline(id) => self.add_online_user(id.clone()),
            ServerEvent::UserIsOffline(id) => self.remove_online_user(id),
            _ => false,
        }
    }

    /// Whether the user is in the current online set.
    #[must_use]
    pub fn is_user_online(&self, id: &UserId) -> bool {
        self.state.borrow().online_user_ids.contains(id)
    }

    /// Number of users currently online.
    #[must_use]
    pub fn online_count(&self) -> usize {
        self.state.borrow().online_user_ids.len()
    }

    /// The subset of `ids` that is online, in input order.
    #[must_use]
    pub fn filter_online(&self, ids: &[UserId]) -> Vec<UserId> {
        let state = self.state.borrow();
        ids.iter()
            .filter(|id| state.online_user_ids.contains(*id))
            .cloned()
            .collect()
    }

    /// When the online set last changed, or `None` before any update.
    #[must_use]
    pub fn last_updated(&self) -> Option<Timestamp> {
        self.state.borrow().last_updated
    }

    /// Tell the backend the local user is online.
    ///
    /// # Errors
    ///
    /// [`EmitError`] if the channel is down.
    pub fn announce_online(&self) -> Result<(), EmitError> {
        self.sink.emit(ClientEvent::UserOnline)
    }

    /// Tell the backend the local user is going offline.
    ///
    /// # Errors
    ///
    /// [`EmitError`] if the channel is down.
    pub fn announce_offline(&self) -> Result<(), EmitError> {
        self.sink.emit(ClientEvent::UserOffline)
    }
}

/// Advances `last_updated`, strictly increasing even within one millisecond.
fn touch(state: &mut OnlineStatusState) {
    let now = Timestamp::now();
    state.last_updated = Some(match state.last_updated {
        Some(prev) if prev >= now => prev.next(),
        _ => now,
    });
}
