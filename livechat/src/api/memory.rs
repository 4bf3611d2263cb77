//! In-process implementation of [`ChatApi`].
//!
//! Stores chats and messages in memory and assigns server ids
//! (`srv-1`, `srv-2`, ...). It can be switched into a failing mode and
//! given artificial latency, which is enough to exercise the delivery and
//! recovery paths without a backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;

use livechat_proto::chat::Chat;
use livechat_proto::message::{
    ChatId, EditInfo, Message, MessageId, MessageStatus, UserId, UserRef,
};

use super::{ApiError, ChatApi, SendMessageRequest};

/// In-memory chat backend.
#[derive(Debug)]
pub struct InMemoryChatApi {
    user_id: UserId,
    chats: Mutex<Vec<Chat>>,
    messages: Mutex<HashMap<ChatId, Vec<Message>>>,
    sent: Mutex<Vec<SendMessageRequest>>,
    next_id: AtomicU64,
    failing: AtomicBool,
    latency: Mutex<Duration>,
}

impl InMemoryChatApi {
    /// Create an empty backend whose sends are authored by `user_id`.
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            chats: Mutex::new(Vec::new()),
            messages: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            failing: AtomicBool::new(false),
            latency: Mutex::new(Duration::ZERO),
        }
    }

    /// Make every call fail with [`ApiError::Unavailable`] (or stop doing so).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Add or replace a chat.
    pub fn upsert_chat(&self, chat: Chat) {
        let mut chats = self.chats.lock();
        chats.retain(|c| c.id != chat.id);
        chats.push(chat);
    }

    /// Seed a stored message (inserted newest-first).
    pub fn insert_message(&self, message: Message) {
        self.messages
            .lock()
            .entry(message.chat_id.clone())
            .or_default()
            .insert(0, message);
    }

    /// Every send request accepted so far, oldest first.
    #[must_use]
    pub fn sent_requests(&self) -> Vec<SendMessageRequest> {
        self.sent.lock().clone()
    }

    async fn simulate(&self) -> Result<(), ApiError> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(ApiError::Unavailable);
        }
        Ok(())
    }
}

impl ChatApi for InMemoryChatApi {
    async fn send_message(&self, request: &SendMessageRequest) -> Result<Message, ApiError> {
        self.simulate().await?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        let message = Message {
            id: MessageId::new(format!("srv-{id}")),
            chat_id: request.chat_id.clone(),
            sender: UserRef::id_only(self.user_id.clone()),
            content: request.content.clone(),
            status: MessageStatus::Sent,
            reactions: Vec::new(),
            edited: EditInfo::default(),
            read_by: Vec::new(),
            deleted_for: Vec::new(),
            reply_to_id: request.reply_to_id.clone(),
            created_at: now,
            updated_at: now,
        };
        self.sent.lock().push(request.clone());
        self.insert_message(message.clone());
        Ok(message)
    }

    async fn delete_message(&self, chat_id: &ChatId, message_id: &MessageId) -> Result<(), ApiError> {
        self.simulate().await?;
        let mut messages = self.messages.lock();
        let list = messages
            .get_mut(chat_id)
            .ok_or_else(|| ApiError::NotFound(chat_id.to_string()))?;
        let before = list.len();
        list.retain(|m| &m.id != message_id);
        if list.len() == before {
            return Err(ApiError::NotFound(message_id.to_string()));
        }
        Ok(())
    }

    async fn fetch_chats(&self) -> Result<Vec<Chat>, ApiError> {
        self.simulate().await?;
        let mut chats = self.chats.lock().clone();
        chats.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(chats)
    }

    async fn fetch_messages(&self, chat_id: &ChatId) -> Result<Vec<Message>, ApiError> {
        self.simulate().await?;
        Ok(self
            .messages
            .lock()
            .get(chat_id)
            .cloned()
            .unwrap_or_default())
    }
}
