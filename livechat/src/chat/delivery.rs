//! Message delivery state machine.
//!
//! Sends are a two-phase commit over the [`MessageCache`]:
//!
//! 1. [`DeliveryManager::begin_send`] synchronously inserts an optimistic
//!    entry (temporary id, `Sending`) at the head of the chat.
//! 2. [`DeliveryManager::complete_send`] issues the network send and either
//!    swaps in the server copy in the same slot or marks the entry `Failed`
//!    and queues it for retry.
//!
//! Failures never surface as errors from the send path; they become the
//! message's status. Inbound edits, reactions, and deletions are applied by
//! id and ignored when the target is not cached.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use livechat_proto::chat::MessageRef;
use livechat_proto::message::{
    ChatId, Message, MessageId, MessageStatus, UserId, ValidationError, validate_content,
};

use super::MessageCache;
use super::queue::{PendingMessage, PendingQueue};
use crate::api::{ApiError, ChatApi, SendMessageRequest};
use crate::connection::EventSink;

/// Errors from user-initiated delivery operations.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// The content failed validation.
    #[error("invalid message: {0}")]
    Validation(#[from] ValidationError),

    /// The target message is not cached.
    #[error("message {message_id} not found in chat {chat_id}")]
    NotFound {
        /// Chat searched.
        chat_id: ChatId,
        /// Missing message.
        message_id: MessageId,
    },

    /// The message's current status does not allow the operation.
    #[error("cannot move message from {from} to {to}")]
    InvalidTransition {
        /// Current status.
        from: MessageStatus,
        /// Requested status.
        to: MessageStatus,
    },

    /// There is no connected channel.
    #[error("not connected")]
    NotConnected,

    /// The data service call failed.
    #[error("service error: {0}")]
    Api(#[from] ApiError),
}

/// Drives messages from creation to a terminal state.
pub struct DeliveryManager<A: ChatApi, S: EventSink> {
    api: Arc<A>,
    sink: Arc<S>,
    cache: Arc<MessageCache>,
    queue: Arc<PendingQueue>,
    user_id: UserId,
    /// Status to restore for each entry shown as `Deleting`, raised by any
    /// inbound update that lands while the delete is in flight.
    rollback: Mutex<HashMap<MessageId, MessageStatus>>,
}

impl<A: ChatApi, S: EventSink> std::fmt::Debug for DeliveryManager<A, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryManager")
            .field("user_id", &self.user_id)
            .field("pending", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl<A: ChatApi, S: EventSink> DeliveryManager<A, S> {
    /// Create a manager sending as `user_id`.
    pub fn new(
        api: Arc<A>,
        sink: Arc<S>,
        cache: Arc<MessageCache>,
        queue: Arc<PendingQueue>,
        user_id: UserId,
    ) -> Self {
        Self {
            api,
            sink,
            cache,
            queue,
            user_id,
            rollback: Mutex::new(HashMap::new()),
        }
    }

    /// The shared message cache.
    #[must_use]
    pub const fn cache(&self) -> &Arc<MessageCache> {
        &self.cache
    }

    /// The shared pending queue.
    #[must_use]
    pub const fn queue(&self) -> &Arc<PendingQueue> {
        &self.queue
    }

    /// Phase 1: validate and insert the optimistic entry.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] for blank or oversized content; nothing
    /// is inserted in that case.
    pub fn begin_send(
        &self,
        chat_id: ChatId,
        content: String,
        reply_to_id: Option<MessageId>,
    ) -> Result<Message, ValidationError> {
        validate_content(&content)?;
        let message = Message::optimistic(chat_id, self.user_id.clone(), content, reply_to_id);
        tracing::debug!(chat_id = %message.chat_id, temp_id = %message.id, "optimistic insert");
        self.cache.insert_front(message.clone());
        Ok(message)
    }

    /// Phase 2: send the optimistic entry and reconcile. Returns the entry
    /// as it now stands: the server copy (`Sent` or better) or the
    /// optimistic entry marked `Failed`.
    pub async fn complete_send(&self, optimistic: &Message) -> Message {
        if !self.sink.is_connected() {
            tracing::info!(temp_id = %optimistic.id, "offline, queuing message");
            return self.fail(optimistic);
        }
        let request = SendMessageRequest {
            chat_id: optimistic.chat_id.clone(),
            content: optimistic.content.clone(),
            reply_to_id: optimistic.reply_to_id.clone(),
        };
        match self.api.send_message(&request).await {
            Ok(confirmed) => self.confirm(&optimistic.id, confirmed),
            Err(e) => {
                tracing::warn!(temp_id = %optimistic.id, error = %e, "send failed");
                self.fail(optimistic)
            }
        }
    }

    /// Both phases. Returns the entry as it stands after phase 2.
    ///
    /// # Errors
    ///
    /// Only validation errors; delivery failures are reflected in the
    /// returned message's status.
    pub async fn send(
        &self,
        chat_id: ChatId,
        content: String,
        reply_to_id: Option<MessageId>,
    ) -> Result<Message, ValidationError> {
        let optimistic = self.begin_send(chat_id, content, reply_to_id)?;
        Ok(self.complete_send(&optimistic).await)
    }

    /// User-initiated retry of a `Failed` message, reusing its slot.
    ///
    /// The entry leaves the pending queue while its request runs, so a
    /// concurrent queue pass cannot send it a second time. A failed retry
    /// queues it again.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::NotFound`] or [`DeliveryError::InvalidTransition`]
    /// if the message is not a cached `Failed` entry.
    pub async fn retry(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
    ) -> Result<MessageStatus, DeliveryError> {
        let message = self.mark_sending(chat_id, message_id)?;
        self.queue.remove_message(message_id);
        Ok(self.complete_send(&message).await.status)
    }

    /// Queue-driven resend of a pending entry.
    ///
    /// Succeeds without sending if the cached entry is already confirmed,
    /// or is `Sending` because another request owns it.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::NotConnected`] or [`DeliveryError::Api`] when the
    /// send fails; the entry is left `Failed`.
    pub async fn redeliver(&self, pending: &PendingMessage) -> Result<(), DeliveryError> {
        if let Some(cached) = self.cache.get(&pending.chat_id, &pending.id) {
            if cached.status.is_confirmed() {
                return Ok(());
            }
            if cached.status == MessageStatus::Sending {
                tracing::debug!(temp_id = %pending.id, "send already in flight, skipping");
                return Ok(());
            }
            if cached.status == MessageStatus::Failed {
                self.set_status(&pending.chat_id, &pending.id, MessageStatus::Sending);
            }
        }
        if !self.sink.is_connected() {
            self.set_status(&pending.chat_id, &pending.id, MessageStatus::Failed);
            return Err(DeliveryError::NotConnected);
        }
        let request = SendMessageRequest {
            chat_id: pending.chat_id.clone(),
            content: pending.content.clone(),
            reply_to_id: pending.reply_to_id.clone(),
        };
        match self.api.send_message(&request).await {
            Ok(confirmed) => {
                tracing::info!(temp_id = %pending.id, message_id = %confirmed.id, "pending message delivered");
                self.confirm(&pending.id, confirmed);
                Ok(())
            }
            Err(e) => {
                self.set_status(&pending.chat_id, &pending.id, MessageStatus::Failed);
                Err(e.into())
            }
        }
    }

    /// Optimistically delete a confirmed message.
    ///
    /// The entry shows `Deleting` while the request is in flight; on success
    /// it is removed. On failure it returns to its previous status, raised
    /// by any inbound update that arrived in the meantime.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::NotFound`], [`DeliveryError::InvalidTransition`] for
    /// unconfirmed messages, or [`DeliveryError::Api`] after rollback.
    pub async fn delete(&self, chat_id: &ChatId, message_id: &MessageId) -> Result<(), DeliveryError> {
        let previous = self
            .cache
            .get(chat_id, message_id)
            .ok_or_else(|| not_found(chat_id, message_id))?
            .status;
        if !previous.can_transition_to(MessageStatus::Deleting) {
            return Err(DeliveryError::InvalidTransition {
                from: previous,
                to: MessageStatus::Deleting,
            });
        }
        self.rollback.lock().insert(message_id.clone(), previous);
        self.set_status(chat_id, message_id, MessageStatus::Deleting);

        let result = self.api.delete_message(chat_id, message_id).await;
        let restore = self.rollback.lock().remove(message_id).unwrap_or(previous);
        match result {
            Ok(()) => {
                self.cache.remove(chat_id, message_id);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(chat_id = %chat_id, message_id = %message_id, to = %restore, error = %e, "delete failed, rolling back");
                self.set_status(chat_id, message_id, restore);
                Err(e.into())
            }
        }
    }

    /// Apply a `messageReceived` event. Returns whether the cache changed.
    pub fn apply_received(&self, message: Message) -> bool {
        if self.cache.get(&message.chat_id, &message.id).is_some() {
            return self.apply_update(message);
        }
        tracing::debug!(chat_id = %message.chat_id, message_id = %message.id, "message received");
        self.cache.insert_front(message);
        true
    }

    /// Apply a `messageEdited` event; ignored if the message is not cached.
    pub fn apply_edited(&self, message: Message) -> bool {
        self.apply_update(message)
    }

    /// Apply a `messageReaction` event; ignored if the message is not cached.
    pub fn apply_reaction(&self, message: Message) -> bool {
        self.apply_update(message)
    }

    /// Apply a `messageDeleted` event.
    pub fn apply_deleted(&self, target: &MessageRef) -> bool {
        self.queue.remove_message(&target.message_id);
        self.cache
            .remove(&target.chat_id, &target.message_id)
            .is_some()
    }

    /// Replaces a cached entry with an inbound copy without regressing its status.
    fn apply_update(&self, incoming: Message) -> bool {
        let chat_id = incoming.chat_id.clone();
        let message_id = incoming.id.clone();
        let applied = self
            .cache
            .update(&chat_id, &message_id, |local| {
                if local.status == MessageStatus::Deleting
                    && let Some(restore) = self.rollback.lock().get_mut(&message_id)
                {
                    *restore = restore.merged_with(incoming.status);
                }
                let status = local.status.merged_with(incoming.status);
                *local = Message {
                    status,
                    ..incoming
                };
            })
            .is_some();
        if !applied {
            tracing::debug!(chat_id = %chat_id, message_id = %message_id, "update for unknown message ignored");
        }
        applied
    }

    fn confirm(&self, temp_id: &MessageId, confirmed: Message) -> Message {
        tracing::debug!(temp_id = %temp_id, message_id = %confirmed.id, "send confirmed");
        self.queue.remove_message(temp_id);
        let (chat_id, message_id) = (confirmed.chat_id.clone(), confirmed.id.clone());
        if !self.cache.reconcile(temp_id, confirmed.clone()) {
            // The optimistic entry is gone (chat cleared or reloaded).
            self.apply_received(confirmed.clone());
        }
        self.cache.get(&chat_id, &message_id).unwrap_or(confirmed)
    }

    fn fail(&self, message: &Message) -> Message {
        self.set_status(&message.chat_id, &message.id, MessageStatus::Failed);
        self.queue.add_message(message);
        Message {
            status: MessageStatus::Failed,
            ..message.clone()
        }
    }

    fn mark_sending(&self, chat_id: &ChatId, message_id: &MessageId) -> Result<Message, DeliveryError> {
        let current = self
            .cache
            .get(chat_id, message_id)
            .ok_or_else(|| not_found(chat_id, message_id))?;
        if !current.status.can_transition_to(MessageStatus::Sending) {
            return Err(DeliveryError::InvalidTransition {
                from: current.status,
                to: MessageStatus::Sending,
            });
        }
        self.set_status(chat_id, message_id, MessageStatus::Sending);
        Ok(Message {
            status: MessageStatus::Sending,
            ..current
        })
    }

    /// Moves a cached entry to `next` if the transition is legal.
    fn set_status(&self, chat_id: &ChatId, message_id: &MessageId, next: MessageStatus) {
        self.cache.update(chat_id, message_id, |m| {
            if m.status == next {
                return;
            }
            // Rollback from Deleting restores whatever the entry had before.
            if m.status.can_transition_to(next) || m.status == MessageStatus::Deleting {
                m.status = next;
            } else {
                tracing::debug!(message_id = %m.id, from = %m.status, to = %next, "ignoring illegal transition");
            }
        });
    }
}

fn not_found(chat_id: &ChatId, message_id: &MessageId) -> DeliveryError {
    DeliveryError::NotFound {
        chat_id: chat_id.clone(),
        message_id: message_id.clone(),
    }
}
