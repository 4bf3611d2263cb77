//! Chat records as delivered by the backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::{ChatId, MessageId, UserId};

/// A direct conversation or group chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    /// Server id.
    #[serde(alias = "_id")]
    pub id: ChatId,
    /// Group name; direct chats usually have none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Whether this is a group chat.
    #[serde(default)]
    pub is_group_chat: bool,
    /// Member accounts.
    #[serde(default)]
    pub participants: Vec<UserId>,
    /// Pinned messages, most recently pinned last.
    #[serde(default)]
    pub pinned_messages: Vec<MessageId>,
    /// Most recent message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_message: Option<MessageId>,
    /// Last modification time, used to order the chat list.
    pub updated_at: DateTime<Utc>,
}

impl Chat {
    /// Pins a message; pinning twice is a no-op. Returns whether the chat changed.
    pub fn pin(&mut self, message_id: &MessageId) -> bool {
        if self.pinned_messages.contains(message_id) {
            return false;
        }
        self.pinned_messages.push(message_id.clone());
        true
    }

    /// Unpins a message. Returns whether the chat changed.
    pub fn unpin(&mut self, message_id: &MessageId) -> bool {
        let before = self.pinned_messages.len();
        self.pinned_messages.retain(|id| id != message_id);
        self.pinned_messages.len() != before
    }
}

/// Identifies one message within one chat (`messageDeleted`, `messagePinned`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    /// Owning chat.
    pub chat_id: ChatId,
    /// Target message.
    pub message_id: MessageId,
}
