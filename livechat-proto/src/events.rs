//! Named events carried over the realtime channel.
//!
//! Every frame is `{"event": <name>, "data": <payload>}`; unit events omit
//! `data`. Event names are camelCase and must match the backend exactly.

use serde::{Deserialize, Serialize};

use crate::chat::{Chat, MessageRef};
use crate::message::{Message, UserId};
use crate::typing::TypingUser;

/// Events pushed by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Handshake accepted; the channel is live.
    Connect,
    /// The server is closing the channel.
    Disconnect,
    /// A new message in one of our chats.
    MessageReceived(Message),
    /// A message's content changed.
    MessageEdited(Message),
    /// A message's reactions changed.
    MessageReaction(Message),
    /// A message was deleted.
    MessageDeleted(MessageRef),
    /// A message was pinned in its chat.
    MessagePinned(MessageRef),
    /// A message was unpinned.
    MessageUnpinned(MessageRef),
    /// We were added to a chat.
    NewChat(Chat),
    /// Chat metadata changed.
    ChatUpdated(Chat),
    /// A chat was deleted.
    ChatDeleted(Chat),
    /// We were removed from a chat.
    RemovedFromChat(Chat),
    /// A peer started (or is still) typing.
    Typing(TypingUser),
    /// A peer stopped typing.
    StopTyping(TypingUser),
    /// A single user came online.
    UserIsOnline(UserId),
    /// A single user went offline.
    UserIsOffline(UserId),
    /// Full snapshot of online users.
    OnlineUserIdsList(Vec<UserId>),
    /// The server reported an error on this channel.
    SocketError(ErrorDescriptor),
    /// Reply to a [`ClientEvent::Ping`].
    Pong(Probe),
}

impl ServerEvent {
    /// The wire name of this event, for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::MessageReceived(_) => "messageReceived",
            Self::MessageEdited(_) => "messageEdited",
            Self::MessageReaction(_) => "messageReaction",
            Self::MessageDeleted(_) => "messageDeleted",
            Self::MessagePinned(_) => "messagePinned",
            Self::MessageUnpinned(_) => "messageUnpinned",
            Self::NewChat(_) => "newChat",
            Self::ChatUpdated(_) => "chatUpdated",
            Self::ChatDeleted(_) => "chatDeleted",
            Self::RemovedFromChat(_) => "removedFromChat",
            Self::Typing(_) => "typing",
            Self::StopTyping(_) => "stopTyping",
            Self::UserIsOnline(_) => "userIsOnline",
            Self::UserIsOffline(_) => "userIsOffline",
            Self::OnlineUserIdsList(_) => "onlineUserIdsList",
            Self::SocketError(_) => "socketError",
            Self::Pong(_) => "pong",
        }
    }
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    /// First frame on a new channel, carrying the bearer token.
    Auth(AuthPayload),
    /// The local user is typing.
    Typing(TypingUser),
    /// The local user stopped typing.
    StopTyping(TypingUser),
    /// The local user is online (identity implied by the auth token).
    UserOnline,
    /// The local user is going offline.
    UserOffline,
    /// Health probe; answered with [`ServerEvent::Pong`].
    Ping(Probe),
}

impl ClientEvent {
    /// The wire name of this event, for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::Typing(_) => "typing",
            Self::StopTyping(_) => "stopTyping",
            Self::UserOnline => "userOnline",
            Self::UserOffline => "userOffline",
            Self::Ping(_) => "ping",
        }
    }
}

/// Channel authentication payload.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPayload {
    /// Bearer token issued by the auth service.
    pub token: String,
}

impl std::fmt::Debug for AuthPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthPayload")
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Correlates a ping with its pong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Probe {
    /// Client-chosen correlation value.
    pub nonce: u64,
}

/// Error reported by the server through `socketError`.
///
/// The backend sends either a bare string or `{"message", "code"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ErrorRepr")]
pub struct ErrorDescriptor {
    /// Human-readable description.
    pub message: String,
    /// Machine-readable code, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorDescriptor {
    /// Creates a descriptor without a code.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Whether the server rejected our credentials.
    #[must_use]
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self.code.as_deref(),
            Some("unauthorized" | "auth_failed" | "invalid_token")
        )
    }
}

impl std::fmt::Display for ErrorDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({code})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorRepr {
    Text(String),
    Full {
        message: String,
        #[serde(default)]
        code: Option<String>,
    },
}

impl From<ErrorRepr> for ErrorDescriptor {
    fn from(repr: ErrorRepr) -> Self {
        match repr {
            ErrorRepr::Text(message) => Self {
                message,
                code: None,
            },
            ErrorRepr::Full { message, code } => Self { message, code },
        }
    }
}
