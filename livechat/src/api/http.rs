//! HTTP adapter for the chat data service.
//!
//! Routes (relative to the configured base URL):
//!
//! | Operation | Route |
//! |---|---|
//! | send | `POST /api/messages` |
//! | delete | `DELETE /api/messages/{chatId}/{messageId}` |
//! | chats | `GET /api/chats` |
//! | messages | `GET /api/messages/{chatId}` |

use std::time::Duration;

use reqwest::{Client, StatusCode};

use livechat_proto::chat::Chat;
use livechat_proto::message::{ChatId, Message, MessageId};

use super::{ApiError, ChatApi, SendMessageRequest};
use crate::transport::AuthToken;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// [`ChatApi`] over HTTP with bearer authentication.
#[derive(Debug, Clone)]
pub struct HttpChatApi {
    http: Client,
    base_url: String,
    token: AuthToken,
}

impl HttpChatApi {
    /// Create a client for `base_url` (no trailing slash needed).
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Network`] if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, token: AuthToken) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Ok(Self::with_client(http, base_url, token))
    }

    /// Create an adapter around an existing `reqwest` client.
    pub fn with_client(http: Client, base_url: impl Into<String>, token: AuthToken) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http,
            base_url,
            token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Maps 404 to [`ApiError::NotFound`] and other failures to statuses.
    fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response, ApiError> {
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound(what.to_string()));
        }
        Ok(response.error_for_status()?)
    }
}

impl ChatApi for HttpChatApi {
    async fn send_message(&self, request: &SendMessageRequest) -> Result<Message, ApiError> {
        let response = self
            .http
            .post(self.url("/api/messages"))
            .bearer_auth(self.token.expose())
            .json(request)
            .send()
            .await?;
        let message: Message = Self::check(response, request.chat_id.as_str())?
            .json()
            .await?;
        tracing::debug!(chat_id = %request.chat_id, message_id = %message.id, "message stored");
        Ok(message)
    }

    async fn delete_message(&self, chat_id: &ChatId, message_id: &MessageId) -> Result<(), ApiError> {
        let response = self
            .http
            .delete(self.url(&format!("/api/messages/{chat_id}/{message_id}")))
            .bearer_auth(self.token.expose())
            .send()
            .await?;
        Self::check(response, message_id.as_str())?;
        Ok(())
    }

    async fn fetch_chats(&self) -> Result<Vec<Chat>, ApiError> {
        let response = self
            .http
            .get(self.url("/api/chats"))
            .bearer_auth(self.token.expose())
            .send()
            .await?;
        Ok(Self::check(response, "chats")?.json().await?)
    }

    async fn fetch_messages(&self, chat_id: &ChatId) -> Result<Vec<Message>, ApiError> {
        let response = self
            .http
            .get(self.url(&format!("/api/messages/{chat_id}")))
            .bearer_auth(self.token.expose())
            .send()
            .await?;
        Ok(Self::check(response, chat_id.as_str())?.json().await?)
    }
}
