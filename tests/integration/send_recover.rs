//! Integration tests for sending through connection loss and recovery.
//!
//! Runs a full [`ChatClient`] over the loopback transport and the
//! in-memory data service, on paused time.
//!
//! Verifies:
//! 1. An offline send is visible immediately, fails without a round-trip,
//!    and is delivered in place after reconnection.
//! 2. A zombie connection is detected by the periodic probe and replaced
//!    by exactly one reconnect.
//! 3. Reconnect and message retry ceilings end in terminal failed states.
//! 4. Auth rejection is terminal and never retried.

use std::sync::Arc;
use std::time::Duration;

use livechat::api::memory::InMemoryChatApi;
use livechat::client::{ChatClient, ClientSettings};
use livechat::connection::ConnectionState;
use livechat::transport::AuthToken;
use livechat::transport::loopback::{LoopbackServer, LoopbackTransport};
use livechat_proto::message::{ChatId, MessageId, MessageStatus, UserId};

type Client = ChatClient<LoopbackTransport, InMemoryChatApi>;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn create_client() -> (Client, LoopbackServer, Arc<InMemoryChatApi>) {
    let (transport, server) = LoopbackTransport::create_pair(64);
    let api = Arc::new(InMemoryChatApi::new("alice"));
    let client = ChatClient::new(
        transport,
        Arc::clone(&api),
        UserId::new("alice"),
        ClientSettings::default(),
    );
    (client, server, api)
}

async fn wait_for_state(client: &Client, target: ConnectionState) {
    let mut rx = client.connection().watch_state();
    tokio::time::timeout(Duration::from_secs(120), rx.wait_for(|s| *s == target))
        .await
        .unwrap_or_else(|_| panic!("never reached {target}, stuck at {}", client.state()))
        .unwrap();
}

/// Polls `check` on virtual time until it holds.
async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

// ---------------------------------------------------------------------------
// Offline send → reconnect → replay
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn offline_send_is_delivered_in_place_after_reconnect() {
    let (client, server, api) = create_client();
    let c1 = ChatId::new("c1");

    server.set_accepting(false);
    assert_eq!(
        client.start(AuthToken::new("token")).await,
        ConnectionState::Reconnecting
    );

    // Phase 1 is synchronous: the entry is visible before any network work.
    let optimistic = client
        .delivery()
        .begin_send(c1.clone(), "hello".into(), None)
        .unwrap();
    assert_eq!(optimistic.status, MessageStatus::Sending);
    assert_eq!(client.cache().position(&c1, &optimistic.id), Some(0));

    let after = client.delivery().complete_send(&optimistic).await;
    assert_eq!(after.status, MessageStatus::Failed);
    assert!(client.delivery().queue().contains(&optimistic.id));
    assert!(api.sent_requests().is_empty(), "no round-trip while offline");

    server.set_accepting(true);
    wait_for_state(&client, ConnectionState::Connected).await;
    eventually("queue replay", || client.delivery().queue().is_empty()).await;

    let messages = client.cache().messages(&c1);
    assert_eq!(messages.len(), 1, "replay must not append a duplicate");
    assert_eq!(messages[0].id, MessageId::new("srv-1"));
    assert_eq!(messages[0].status, MessageStatus::Sent);
    assert_eq!(messages[0].content, "hello");
    assert!(client.cache().get(&c1, &optimistic.id).is_none());
    assert_eq!(api.sent_requests().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn sends_keep_fifo_order_within_a_chat() {
    let (client, _server, _api) = create_client();
    client.start(AuthToken::new("token")).await;
    let c1 = ChatId::new("c1");

    for text in ["one", "two", "three"] {
        client.send_message(c1.clone(), text, None).await.unwrap();
    }
    let contents: Vec<_> = client
        .cache()
        .messages(&c1)
        .into_iter()
        .rev()
        .map(|m| m.content)
        .collect();
    assert_eq!(contents, vec!["one", "two", "three"]);
}

// ---------------------------------------------------------------------------
// Zombie detection
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn zombie_connection_triggers_single_reconnect() {
    let (client, server, _api) = create_client();
    client.start(AuthToken::new("token")).await;
    assert_eq!(server.connection_count(), 1);

    // The channel stays open but pongs stop.
    server.set_responsive(false);
    wait_for_state(&client, ConnectionState::Reconnecting).await;

    // Repeated triggers while reconnecting do not stack up.
    assert!(!client.connection().force_reconnect());

    server.set_responsive(true);
    wait_for_state(&client, ConnectionState::Connected).await;
    assert_eq!(server.connection_count(), 2);
}

// ---------------------------------------------------------------------------
// Retry ceilings
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn reconnect_gives_up_after_ceiling() {
    let (client, server, _api) = create_client();
    server.set_accepting(false);
    client.start(AuthToken::new("token")).await;

    wait_for_state(&client, ConnectionState::Failed).await;
    // One initial attempt plus five reconnects.
    assert_eq!(server.open_attempts(), 6);

    // No further automatic attempts.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(server.open_attempts(), 6);

    // An explicit connect starts over.
    server.set_accepting(true);
    assert_eq!(
        client.start(AuthToken::new("token")).await,
        ConnectionState::Connected
    );
}

#[tokio::test(start_paused = true)]
async fn message_is_dropped_from_queue_after_max_retries() {
    let (client, _server, api) = create_client();
    client.start(AuthToken::new("token")).await;
    // Let the post-connect resync finish before the service goes down.
    tokio::time::sleep(Duration::from_secs(5)).await;
    api.set_failing(true);

    let failed = client
        .send_message(ChatId::new("c1"), "doomed", None)
        .await
        .unwrap();
    assert_eq!(failed.status, MessageStatus::Failed);
    let queue = client.delivery().queue();

    for _ in 0..3 {
        queue
            .retry_failed_messages(|p| {
                let delivery = Arc::clone(client.delivery());
                async move { delivery.redeliver(&p).await }
            })
            .await;
    }
    assert!(queue.is_empty());
    let cached = client.cache().get(&failed.chat_id, &failed.id).unwrap();
    assert_eq!(cached.status, MessageStatus::Failed, "left for the user to retry");

    // A user retry still works once the service recovers.
    api.set_failing(false);
    assert_eq!(
        client.retry_message(&failed.chat_id, &failed.id).await.unwrap(),
        MessageStatus::Sent
    );
}

#[tokio::test(start_paused = true)]
async fn auth_rejection_is_terminal() {
    let (client, server, _api) = create_client();
    server.require_token(Some("good"));

    assert_eq!(
        client.start(AuthToken::new("bad")).await,
        ConnectionState::Failed
    );
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(server.open_attempts(), 1);
    assert_eq!(client.state(), ConnectionState::Failed);
}

#[tokio::test(start_paused = true)]
async fn server_drop_recovers_and_resyncs() {
    let (client, server, api) = create_client();
    client.start(AuthToken::new("token")).await;

    server.set_accepting(false);
    server.drop_connection();
    wait_for_state(&client, ConnectionState::Reconnecting).await;

    let queued = client
        .send_message(ChatId::new("c2"), "while down", None)
        .await
        .unwrap();
    assert_eq!(queued.status, MessageStatus::Failed);

    server.set_accepting(true);
    wait_for_state(&client, ConnectionState::Connected).await;
    eventually("replay after drop", || client.delivery().queue().is_empty()).await;
    assert_eq!(api.sent_requests().len(), 1);
    assert_eq!(
        client.cache().messages(&ChatId::new("c2"))[0].status,
        MessageStatus::Sent
    );
}
