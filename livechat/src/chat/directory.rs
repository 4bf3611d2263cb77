//! Cached chat list.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use livechat_proto::chat::{Chat, MessageRef};
use livechat_proto::events::ServerEvent;
use livechat_proto::message::{ChatId, MessageId};

use super::MessageCache;
use crate::api::{ApiError, ChatApi};

/// A change to the chat list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryEvent {
    /// A chat was added or changed.
    Upserted(ChatId),
    /// A chat left the list (deleted, or we were removed).
    Removed(ChatId),
    /// The whole list was replaced from the data service.
    Refreshed {
        /// Chats now listed.
        count: usize,
    },
}

/// The session user's chats, most recently updated first.
#[derive(Debug)]
pub struct ChatDirectory {
    chats: Mutex<Vec<Chat>>,
    cache: Arc<MessageCache>,
    events: broadcast::Sender<DirectoryEvent>,
}

impl ChatDirectory {
    /// Create an empty directory. Removing a chat also drops its messages
    /// from `cache`.
    #[must_use]
    pub fn new(cache: Arc<MessageCache>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            chats: Mutex::new(Vec::new()),
            cache,
            events,
        }
    }

    /// Observe list changes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DirectoryEvent> {
        self.events.subscribe()
    }

    /// All chats, most recently updated first.
    #[must_use]
    pub fn chats(&self) -> Vec<Chat> {
        self.chats.lock().clone()
    }

    /// One chat by id.
    #[must_use]
    pub fn get(&self, chat_id: &ChatId) -> Option<Chat> {
        self.chats.lock().iter().find(|c| &c.id == chat_id).cloned()
    }

    /// Apply a chat-list event. Returns whether it was one this directory
    /// handles and it changed something.
    pub fn apply(&self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::NewChat(chat) | ServerEvent::ChatUpdated(chat) => {
                self.upsert(chat.clone());
                true
            }
            ServerEvent::ChatDeleted(chat) | ServerEvent::RemovedFromChat(chat) => {
                self.remove(&chat.id)
            }
            ServerEvent::MessagePinned(target) => self.edit(target, Chat::pin),
            ServerEvent::MessageUnpinned(target) => self.edit(target, Chat::unpin),
            _ => false,
        }
    }

    /// Replace the list with the data service's copy.
    ///
    /// # Errors
    ///
    /// Propagates the fetch error; the cached list is kept.
    pub async fn refresh<A: ChatApi>(&self, api: &A) -> Result<usize, ApiError> {
        let mut fresh = api.fetch_chats().await?;
        fresh.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        let count = fresh.len();
        *self.chats.lock() = fresh;
        tracing::debug!(count, "chat list refreshed");
        let _ = self.events.send(DirectoryEvent::Refreshed { count });
        Ok(count)
    }

    fn upsert(&self, chat: Chat) {
        let id = chat.id.clone();
        {
            let mut chats = self.chats.lock();
            chats.retain(|c| c.id != chat.id);
            let at = chats
                .iter()
                .position(|c| c.updated_at <= chat.updated_at)
                .unwrap_or(chats.len());
            chats.insert(at, chat);
        }
        let _ = self.events.send(DirectoryEvent::Upserted(id));
    }

    fn remove(&self, chat_id: &ChatId) -> bool {
        let removed = {
            let mut chats = self.chats.lock();
            let before = chats.len();
            chats.retain(|c| &c.id != chat_id);
            chats.len() != before
        };
        self.cache.clear_chat(chat_id);
        if removed {
            tracing::info!(chat_id = %chat_id, "chat removed");
            let _ = self.events.send(DirectoryEvent::Removed(chat_id.clone()));
        }
        removed
    }

    fn edit(
        &self,
        target: &MessageRef,
        f: impl FnOnce(&mut Chat, &MessageId) -> bool,
    ) -> bool {
        let changed = {
            let mut chats = self.chats.lock();
            chats
                .iter_mut()
                .find(|c| c.id == target.chat_id)
                .is_some_and(|chat| f(chat, &target.message_id))
        };
        if changed {
            let _ = self
                .events
                .send(DirectoryEvent::Upserted(target.chat_id.clone()));
        }
        changed
    }
}
