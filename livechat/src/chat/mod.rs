//! Chat application layer.
//!
//! [`MessageCache`] holds every chat's message list (newest first) and
//! publishes a [`CacheEvent`] for each mutation so a UI can re-render
//! without polling. The other pieces build on it:
//! - [`delivery::DeliveryManager`]: optimistic send, retry, delete, and
//!   inbound reconciliation
//! - [`queue::PendingQueue`]: bounded retry buffer for unconfirmed sends
//! - [`directory::ChatDirectory`]: the cached chat list

pub mod delivery;
pub mod directory;
pub mod queue;

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use livechat_proto::message::{ChatId, Message, MessageId};

use crate::api::{ApiError, ChatApi};

/// Default capacity of the cache event broadcast.
pub const DEFAULT_CACHE_EVENT_CAPACITY: usize = 256;

/// A change to the message cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// A message was added at the head of a chat.
    Inserted {
        /// Owning chat.
        chat_id: ChatId,
        /// The new entry.
        message_id: MessageId,
    },
    /// An entry changed in place (status, content, reactions).
    Updated {
        /// Owning chat.
        chat_id: ChatId,
        /// The changed entry.
        message_id: MessageId,
    },
    /// A temporary entry was replaced by the server's copy in the same slot.
    Reconciled {
        /// Owning chat.
        chat_id: ChatId,
        /// The temporary id that was replaced.
        temp_id: MessageId,
        /// The server-assigned id now in that slot.
        message_id: MessageId,
    },
    /// An entry was removed.
    Removed {
        /// Owning chat.
        chat_id: ChatId,
        /// The removed entry.
        message_id: MessageId,
    },
    /// A chat's list was replaced by a fetch.
    Loaded {
        /// The reloaded chat.
        chat_id: ChatId,
        /// Number of messages now held.
        count: usize,
    },
    /// A chat's list was dropped.
    Cleared {
        /// The cleared chat.
        chat_id: ChatId,
    },
}

#[derive(Debug, Default)]
struct ChatMessages {
    /// Newest first.
    messages: Vec<Message>,
    /// Bumped by every mutation; a fetch started under an older value is stale.
    generation: u64,
}

impl ChatMessages {
    fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| &m.id == id)
    }
}

/// Per-chat message lists with change notification.
#[derive(Debug)]
pub struct MessageCache {
    chats: Mutex<HashMap<ChatId, ChatMessages>>,
    events: broadcast::Sender<CacheEvent>,
}

impl Default for MessageCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_EVENT_CAPACITY)
    }
}

impl MessageCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            chats: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Observe cache mutations.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: CacheEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// A chat's messages, newest first.
    #[must_use]
    pub fn messages(&self, chat_id: &ChatId) -> Vec<Message> {
        self.chats
            .lock()
            .get(chat_id)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    /// Look up one message.
    #[must_use]
    pub fn get(&self, chat_id: &ChatId, message_id: &MessageId) -> Option<Message> {
        let chats = self.chats.lock();
        let chat = chats.get(chat_id)?;
        chat.position(message_id).map(|i| chat.messages[i].clone())
    }

    /// Index of a message in its chat's list (0 is newest).
    #[must_use]
    pub fn position(&self, chat_id: &ChatId, message_id: &MessageId) -> Option<usize> {
        self.chats.lock().get(chat_id)?.position(message_id)
    }

    /// Current mutation generation of a chat.
    #[must_use]
    pub fn generation(&self, chat_id: &ChatId) -> u64 {
        self.chats.lock().get(chat_id).map_or(0, |c| c.generation)
    }

    /// Insert a message at the head of its chat.
    pub fn insert_front(&self, message: Message) {
        let chat_id = message.chat_id.clone();
        let message_id = message.id.clone();
        {
            let mut chats = self.chats.lock();
            let chat = chats.entry(chat_id.clone()).or_default();
            chat.generation += 1;
            chat.messages.insert(0, message);
        }
        self.publish(CacheEvent::Inserted {
            chat_id,
            message_id,
        });
    }

    /// Apply `f` to a message in place. Returns `None` if it is not cached.
    pub fn update<R>(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
        f: impl FnOnce(&mut Message) -> R,
    ) -> Option<R> {
        let result = {
            let mut chats = self.chats.lock();
            let chat = chats.get_mut(chat_id)?;
            let index = chat.position(message_id)?;
            chat.generation += 1;
            f(&mut chat.messages[index])
        };
        self.publish(CacheEvent::Updated {
            chat_id: chat_id.clone(),
            message_id: message_id.clone(),
        });
        Some(result)
    }

    /// Replace the entry keyed by `temp_id` with `confirmed`, keeping its slot.
    ///
    /// If the server copy already arrived through the channel it is dropped
    /// from its own slot first, so the message exists exactly once. Returns
    /// `false` if `temp_id` is not cached.
    pub fn reconcile(&self, temp_id: &MessageId, confirmed: Message) -> bool {
        let chat_id = confirmed.chat_id.clone();
        let message_id = confirmed.id.clone();
        {
            let mut chats = self.chats.lock();
            let Some(chat) = chats.get_mut(&chat_id) else {
                return false;
            };
            if chat.position(temp_id).is_none() {
                return false;
            }
            if let Some(echo) = chat.position(&message_id) {
                tracing::debug!(chat_id = %chat_id, message_id = %message_id, "collapsing early echo");
                let echo = chat.messages.remove(echo);
                let merged = echo.status.merged_with(confirmed.status);
                let Some(index) = chat.position(temp_id) else {
                    return false;
                };
                chat.messages[index] = Message {
                    status: merged,
                    ..confirmed
                };
            } else if let Some(index) = chat.position(temp_id) {
                chat.messages[index] = confirmed;
            }
            chat.generation += 1;
        }
        self.publish(CacheEvent::Reconciled {
            chat_id,
            temp_id: temp_id.clone(),
            message_id,
        });
        true
    }

    /// Remove a message. Returns the removed entry.
    pub fn remove(&self, chat_id: &ChatId, message_id: &MessageId) -> Option<Message> {
        let removed = {
            let mut chats = self.chats.lock();
            let chat = chats.get_mut(chat_id)?;
            let index = chat.position(message_id)?;
            chat.generation += 1;
            chat.messages.remove(index)
        };
        self.publish(CacheEvent::Removed {
            chat_id: chat_id.clone(),
            message_id: message_id.clone(),
        });
        Some(removed)
    }

    /// Drop a chat's list entirely.
    pub fn clear_chat(&self, chat_id: &ChatId) {
        if self.chats.lock().remove(chat_id).is_some() {
            self.publish(CacheEvent::Cleared {
                chat_id: chat_id.clone(),
            });
        }
    }

    /// Install a fetched list if no mutation happened since `generation`.
    ///
    /// Local entries the server does not know yet (temporary ids) stay at
    /// the head; statuses of shared entries never regress. Returns whether
    /// the fetch was applied.
    pub fn store_fetched(&self, chat_id: &ChatId, generation: u64, fetched: Vec<Message>) -> bool {
        let count = {
            let mut chats = self.chats.lock();
            let chat = chats.entry(chat_id.clone()).or_default();
            if chat.generation != generation {
                tracing::debug!(
                    chat_id = %chat_id,
                    fetched_at = generation,
                    current = chat.generation,
                    "discarding stale fetch"
                );
                return false;
            }
            let mut merged: Vec<Message> = chat
                .messages
                .iter()
                .filter(|m| m.id.is_temporary())
                .cloned()
                .collect();
            for mut message in fetched {
                if let Some(local) = chat.messages.iter().find(|m| m.id == message.id) {
                    message.status = local.status.merged_with(message.status);
                }
                merged.push(message);
            }
            chat.messages = merged;
            chat.generation += 1;
            chat.messages.len()
        };
        self.publish(CacheEvent::Loaded {
            chat_id: chat_id.clone(),
            count,
        });
        true
    }

    /// Fetch a chat's messages and install them unless a local mutation
    /// raced the fetch. Returns whether the result was applied.
    ///
    /// # Errors
    ///
    /// Propagates the [`ApiError`] of the fetch; the cache is untouched.
    pub async fn load_chat<A: ChatApi>(&self, api: &A, chat_id: &ChatId) -> Result<bool, ApiError> {
        let generation = self.generation(chat_id);
        let fetched = api.fetch_messages(chat_id).await?;
        Ok(self.store_fetched(chat_id, generation, fetched))
    }
}
