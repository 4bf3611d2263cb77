//! Typing indicator payloads.

use serde::{Deserialize, Serialize};

use crate::message::{ChatId, UserId};

/// Payload of `typing` / `stopTyping`, in both directions.
///
/// Also serves as the key of the active typing set: a user typing in two
/// chats is two distinct entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingUser {
    /// The user who is typing.
    pub user_id: UserId,
    /// The chat being typed in.
    pub chat_id: ChatId,
}

impl TypingUser {
    /// Creates a typing pair.
    pub fn new(user_id: impl Into<UserId>, chat_id: impl Into<ChatId>) -> Self {
        Self {
            user_id: user_id.into(),
            chat_id: chat_id.into(),
        }
    }
}
