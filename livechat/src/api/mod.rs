//! Remote data service consumed by the client core.
//!
//! The backend's REST surface is out of scope; the core only needs the
//! request and response shapes, expressed by the [`ChatApi`] trait.
//! Adapters:
//! - [`http::HttpChatApi`]: JSON over HTTP with a bearer token
//! - [`memory::InMemoryChatApi`]: in-process backend for tests and demos

pub mod http;
pub mod memory;

use serde::{Deserialize, Serialize};

use livechat_proto::chat::Chat;
use livechat_proto::message::{ChatId, Message, MessageId};

/// Errors returned by a [`ChatApi`] call.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request never produced a response.
    #[error("network error: {0}")]
    Network(String),

    /// The service answered with a non-success status.
    #[error("service returned status {status}")]
    Status {
        /// HTTP status code.
        status: u16,
    },

    /// The response body could not be decoded.
    #[error("malformed response: {0}")]
    Decode(String),

    /// The target record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The service is unavailable (used by the in-memory backend).
    #[error("service unavailable")]
    Unavailable,
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            Self::Status {
                status: status.as_u16(),
            }
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// Body of a send-message request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    /// Target chat.
    pub chat_id: ChatId,
    /// Text content, already validated.
    pub content: String,
    /// Message being replied to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
}

/// Request/response interface of the backend's data service.
pub trait ChatApi: Send + Sync + 'static {
    /// Persist a new message; returns the stored copy with its server id.
    fn send_message(
        &self,
        request: &SendMessageRequest,
    ) -> impl std::future::Future<Output = Result<Message, ApiError>> + Send;

    /// Delete a message.
    fn delete_message(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
    ) -> impl std::future::Future<Output = Result<(), ApiError>> + Send;

    /// List the chats the session user belongs to.
    fn fetch_chats(&self) -> impl std::future::Future<Output = Result<Vec<Chat>, ApiError>> + Send;

    /// List a chat's messages, newest first.
    fn fetch_messages(
        &self,
        chat_id: &ChatId,
    ) -> impl std::future::Future<Output = Result<Vec<Message>, ApiError>> + Send;
}
