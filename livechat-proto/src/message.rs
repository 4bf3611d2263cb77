//! Message types exchanged with the chat backend.
//!
//! A [`Message`] is owned by its chat. Before the server confirms it, a
//! message carries a temporary id (see [`MessageId::temporary`]) which is
//! swapped for the server-assigned id once the send succeeds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum allowed message content size in bytes (64 KB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Prefix marking a client-generated message id.
const TEMP_ID_PREFIX: &str = "temp-";

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps an identifier issued by the backend.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

string_id!(
    /// Identifies a user account.
    UserId
);

string_id!(
    /// Identifies a chat (direct conversation or group).
    ChatId
);

string_id!(
    /// Identifies a message, either server-assigned or temporary.
    MessageId
);

impl MessageId {
    /// Generates a fresh client-side id (`temp-<uuid v7>`).
    ///
    /// Temporary ids never collide with server ids and are replaced in place
    /// when the server confirms the message.
    #[must_use]
    pub fn temporary() -> Self {
        Self(format!("{TEMP_ID_PREFIX}{}", Uuid::now_v7()))
    }

    /// Returns `true` if this id was generated locally.
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }
}

/// Millisecond-precision UTC timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// The smallest timestamp strictly after this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Delivery lifecycle of a message.
///
/// The success path is `Sending -> Sent -> Delivered -> Read`. `Failed` is
/// only reachable from `Sending`, and only `Failed` may go back to
/// `Sending` (a retry). A confirmed message may enter `Deleting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Optimistically shown, not yet confirmed by the server.
    Sending,
    /// Accepted by the server.
    #[default]
    Sent,
    /// Delivered to at least one recipient device.
    Delivered,
    /// Read by at least one recipient.
    Read,
    /// The send failed; waiting for a retry.
    Failed,
    /// A delete request is in flight.
    Deleting,
}

impl MessageStatus {
    /// Position on the success path, `None` for `Failed` and `Deleting`.
    #[must_use]
    pub const fn rank(self) -> Option<u8> {
        match self {
            Self::Sending => Some(0),
            Self::Sent => Some(1),
            Self::Delivered => Some(2),
            Self::Read => Some(3),
            Self::Failed | Self::Deleting => None,
        }
    }

    /// Whether the server has accepted the message.
    #[must_use]
    pub const fn is_confirmed(self) -> bool {
        matches!(self, Self::Sent | Self::Delivered | Self::Read)
    }

    /// Whether a direct transition from `self` to `next` is legal.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Sending, Self::Sent | Self::Delivered | Self::Read | Self::Failed)
                | (Self::Sent, Self::Delivered | Self::Read | Self::Deleting)
                | (Self::Delivered, Self::Read | Self::Deleting)
                | (Self::Read, Self::Deleting)
                | (Self::Failed, Self::Sending)
        )
    }

    /// Combines a locally held status with one reported by the server,
    /// never moving backwards along the success path.
    #[must_use]
    pub fn merged_with(self, incoming: Self) -> Self {
        match (self.rank(), incoming.rank()) {
            (Some(local), Some(remote)) if remote > local => incoming,
            (Some(_), Some(_)) => self,
            _ if self == Self::Deleting => self,
            _ if incoming.is_confirmed() => incoming,
            _ => self,
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
            Self::Deleting => "deleting",
        };
        f.write_str(label)
    }
}

/// The author of a message as embedded in message payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    /// Account id.
    #[serde(alias = "_id")]
    pub id: UserId,
    /// Display name, when the backend populates it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl UserRef {
    /// A reference carrying only the id.
    #[must_use]
    pub const fn id_only(id: UserId) -> Self {
        Self { id, username: None }
    }
}

/// An emoji reaction left by a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    /// Who reacted.
    pub user_id: UserId,
    /// The reaction itself.
    pub emoji: String,
}

/// Edit bookkeeping for a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditInfo {
    /// Whether the content was changed after sending.
    #[serde(default)]
    pub is_edited: bool,
    /// When the last edit happened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
}

/// A chat message as stored in a chat's message list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Server id, or a temporary id while the send is unconfirmed.
    #[serde(alias = "_id")]
    pub id: MessageId,
    /// Owning chat.
    pub chat_id: ChatId,
    /// Author.
    pub sender: UserRef,
    /// Text content.
    pub content: String,
    /// Delivery status. Server payloads that omit it are treated as `sent`.
    #[serde(default)]
    pub status: MessageStatus,
    /// Reactions in arrival order.
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    /// Edit bookkeeping.
    #[serde(default)]
    pub edited: EditInfo,
    /// Users who have read the message.
    #[serde(default)]
    pub read_by: Vec<UserId>,
    /// Users who deleted the message for themselves.
    #[serde(default)]
    pub deleted_for: Vec<UserId>,
    /// Message this one replies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// Builds the provisional entry shown while a send is in flight.
    #[must_use]
    pub fn optimistic(
        chat_id: ChatId,
        sender: UserId,
        content: String,
        reply_to_id: Option<MessageId>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: MessageId::temporary(),
            chat_id,
            sender: UserRef::id_only(sender),
            content,
            status: MessageStatus::Sending,
            reactions: Vec::new(),
            edited: EditInfo::default(),
            read_by: Vec::new(),
            deleted_for: Vec::new(),
            reply_to_id,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Error returned when message content fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Message content is empty (or only whitespace).
    #[error("message content is empty")]
    Empty,
    /// Message content exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the content in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

/// Validates outbound message content.
///
/// # Errors
///
/// Returns [`ValidationError::Empty`] for blank content, or
/// [`ValidationError::TooLarge`] if it exceeds [`MAX_MESSAGE_SIZE`].
pub fn validate_content(content: &str) -> Result<(), ValidationError> {
    if content.trim().is_empty() {
        return Err(ValidationError::Empty);
    }
    let size = content.len();
    if size > MAX_MESSAGE_SIZE {
        return Err(ValidationError::TooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(())
}
