//! Integration tests for the HTTP data-service adapter against a mock
//! server.

use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use livechat::api::http::HttpChatApi;
use livechat::api::{ApiError, ChatApi, SendMessageRequest};
use livechat::transport::AuthToken;
use livechat_proto::message::{ChatId, MessageId, MessageStatus, UserId};

const TOKEN: &str = "secret";

fn stored_message(id: &str, chat: &str, content: &str) -> serde_json::Value {
    // Backend shape: `_id` keys, no explicit status.
    json!({
        "_id": id,
        "chatId": chat,
        "sender": { "_id": "alice", "username": "Alice" },
        "content": content,
        "createdAt": "2024-05-01T12:00:00Z",
        "updatedAt": "2024-05-01T12:00:00Z"
    })
}

async fn api() -> (MockServer, HttpChatApi) {
    let server = MockServer::start().await;
    let api = HttpChatApi::new(server.uri(), AuthToken::new(TOKEN)).unwrap();
    (server, api)
}

#[tokio::test]
async fn send_posts_body_with_bearer_token() {
    let (server, api) = api().await;
    let request = SendMessageRequest {
        chat_id: ChatId::new("c1"),
        content: "hello".into(),
        reply_to_id: Some(MessageId::new("m-0")),
    };

    Mock::given(method("POST"))
        .and(path("/api/messages"))
        .and(header("authorization", "Bearer secret"))
        .and(body_json(json!({
            "chatId": "c1",
            "content": "hello",
            "replyToId": "m-0"
        })))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(stored_message("m-1", "c1", "hello")),
        )
        .expect(1)
        .mount(&server)
        .await;

    let stored = api.send_message(&request).await.unwrap();
    assert_eq!(stored.id, MessageId::new("m-1"));
    assert_eq!(stored.sender.id, UserId::new("alice"));
    assert_eq!(stored.status, MessageStatus::Sent);
}

#[tokio::test]
async fn server_error_maps_to_status() {
    let (server, api) = api().await;
    Mock::given(method("POST"))
        .and(path("/api/messages"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let request = SendMessageRequest {
        chat_id: ChatId::new("c1"),
        content: "hello".into(),
        reply_to_id: None,
    };
    let err = api.send_message(&request).await.unwrap_err();
    assert!(matches!(err, ApiError::Status { status: 500 }), "{err:?}");
}

#[tokio::test]
async fn delete_of_missing_message_is_not_found() {
    let (server, api) = api().await;
    Mock::given(method("DELETE"))
        .and(path("/api/messages/c1/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api/messages/c1/m-1"))
        .and(header("authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let err = api
        .delete_message(&ChatId::new("c1"), &MessageId::new("gone"))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::NotFound(_)), "{err:?}");

    api.delete_message(&ChatId::new("c1"), &MessageId::new("m-1"))
        .await
        .unwrap();
}

#[tokio::test]
async fn fetches_chats_and_messages() {
    let (server, api) = api().await;
    Mock::given(method("GET"))
        .and(path("/api/chats"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {
                "_id": "c1",
                "name": "general",
                "isGroupChat": true,
                "participants": ["alice", "bob"],
                "updatedAt": "2024-05-01T12:00:00Z"
            },
            { "_id": "c2", "updatedAt": "2024-05-01T11:00:00Z" }
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/messages/c1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            stored_message("m-2", "c1", "second"),
            stored_message("m-1", "c1", "first"),
        ])))
        .mount(&server)
        .await;

    let chats = api.fetch_chats().await.unwrap();
    assert_eq!(chats.len(), 2);
    assert_eq!(chats[0].name.as_deref(), Some("general"));
    assert!(chats[1].participants.is_empty());

    let messages = api.fetch_messages(&ChatId::new("c1")).await.unwrap();
    let ids: Vec<_> = messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m-2", "m-1"]);
}

#[tokio::test]
async fn malformed_body_is_decode_error() {
    let (server, api) = api().await;
    Mock::given(method("GET"))
        .and(path("/api/chats"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let err = api.fetch_chats().await.unwrap_err();
    assert!(matches!(err, ApiError::Decode(_)), "{err:?}");
}
