//! Integration tests for presence and typing indicators.
//!
//! Events are pushed from the loopback server side and observed through
//! the client's trackers; local signals are observed on the server side.

use std::sync::Arc;
use std::time::Duration;

use livechat::api::memory::InMemoryChatApi;
use livechat::client::{ChatClient, ClientSettings};
use livechat::connection::ConnectionState;
use livechat::transport::AuthToken;
use livechat::transport::loopback::{LoopbackServer, LoopbackTransport};
use livechat_proto::events::{ClientEvent, ServerEvent};
use livechat_proto::message::{ChatId, UserId};
use livechat_proto::typing::TypingUser;

type Client = ChatClient<LoopbackTransport, InMemoryChatApi>;

async fn connected_client() -> (Client, LoopbackServer) {
    let (transport, server) = LoopbackTransport::create_pair(64);
    let api = Arc::new(InMemoryChatApi::new("alice"));
    let client = ChatClient::new(transport, api, UserId::new("alice"), ClientSettings::default());
    assert_eq!(
        client.start(AuthToken::new("token")).await,
        ConnectionState::Connected
    );
    (client, server)
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Wait for the next client event matching `wanted`, skipping pings and
/// anything else the client emits along the way.
async fn expect_client_event(server: &LoopbackServer, wanted: &ClientEvent) {
    let found = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = server.next_client_event().await {
            if &event == wanted {
                return true;
            }
        }
        false
    })
    .await;
    assert_eq!(found, Ok(true), "client never emitted {wanted:?}");
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn roster_snapshot_then_incremental_updates() {
    let (client, server) = connected_client().await;
    let presence = client.presence();

    assert!(server.push(ServerEvent::OnlineUserIdsList(vec![
        UserId::new("u1"),
        UserId::new("u2"),
    ])));
    eventually("roster snapshot", || presence.online_count() == 2).await;
    let first = presence.last_updated().unwrap();

    assert!(server.push(ServerEvent::UserIsOffline(UserId::new("u1"))));
    eventually("u1 offline", || !presence.is_user_online(&UserId::new("u1"))).await;
    assert!(presence.is_user_online(&UserId::new("u2")));
    assert!(presence.last_updated().unwrap() > first);

    assert!(server.push(ServerEvent::UserIsOnline(UserId::new("u3"))));
    eventually("u3 online", || presence.is_user_online(&UserId::new("u3"))).await;
    assert_eq!(
        presence.filter_online(&[UserId::new("u1"), UserId::new("u3")]),
        vec![UserId::new("u3")]
    );
}

#[tokio::test(start_paused = true)]
async fn reconnect_announces_online_again() {
    let (client, server) = connected_client().await;
    expect_client_event(&server, &ClientEvent::UserOnline).await;

    server.drop_connection();
    let mut state = client.connection().watch_state();
    tokio::time::timeout(
        Duration::from_secs(30),
        state.wait_for(|s| *s == ConnectionState::Reconnecting),
    )
    .await
    .unwrap()
    .unwrap();

    expect_client_event(&server, &ClientEvent::UserOnline).await;
    assert_eq!(server.connection_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn shutdown_announces_offline() {
    let (client, server) = connected_client().await;
    expect_client_event(&server, &ClientEvent::UserOnline).await;

    client.shutdown().await;
    expect_client_event(&server, &ClientEvent::UserOffline).await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

// ---------------------------------------------------------------------------
// Remote typing
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn repeated_typing_signal_resets_expiry() {
    let (client, server) = connected_client().await;
    let typing = client.typing();
    let bob = TypingUser::new("bob", "c1");

    assert!(server.push(ServerEvent::Typing(bob.clone())));
    eventually("bob typing", || typing.is_typing(&bob)).await;

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(server.push(ServerEvent::Typing(bob.clone())));

    // 3.5s after the first signal, 2.5s after the second.
    tokio::time::sleep(Duration::from_millis(2_400)).await;
    assert_eq!(typing.active(), vec![bob.clone()]);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(typing.active().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stop_typing_clears_only_that_pair() {
    let (client, server) = connected_client().await;
    let typing = client.typing();
    let bob_c1 = TypingUser::new("bob", "c1");
    let bob_c2 = TypingUser::new("bob", "c2");

    server.push(ServerEvent::Typing(bob_c1.clone()));
    server.push(ServerEvent::Typing(bob_c2.clone()));
    eventually("both pairs", || typing.active().len() == 2).await;

    server.push(ServerEvent::StopTyping(bob_c1.clone()));
    eventually("c1 cleared", || !typing.is_typing(&bob_c1)).await;
    assert_eq!(typing.typing_in(&ChatId::new("c2")), vec![UserId::new("bob")]);
}

#[tokio::test(start_paused = true)]
async fn own_typing_echo_is_ignored() {
    let (client, server) = connected_client().await;
    let typing = client.typing();

    server.push(ServerEvent::Typing(TypingUser::new("alice", "c1")));
    server.push(ServerEvent::Typing(TypingUser::new("bob", "c1")));
    eventually("bob typing", || typing.active().len() == 1).await;
    assert_eq!(typing.typing_in(&ChatId::new("c1")), vec![UserId::new("bob")]);
}

// ---------------------------------------------------------------------------
// Local typing
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn local_typing_emits_then_stops_when_idle() {
    let (client, server) = connected_client().await;
    let c1 = ChatId::new("c1");
    let me = TypingUser::new("alice", "c1");

    client.user_typing(&c1);
    expect_client_event(&server, &ClientEvent::Typing(me.clone())).await;
    assert!(client.typing().is_locally_typing());

    expect_client_event(&server, &ClientEvent::StopTyping(me)).await;
    assert!(!client.typing().is_locally_typing());
}

#[tokio::test(start_paused = true)]
async fn sending_ends_local_typing() {
    let (client, server) = connected_client().await;
    let c1 = ChatId::new("c1");

    client.user_typing(&c1);
    client.send_message(c1, "done typing", None).await.unwrap();
    assert!(!client.typing().is_locally_typing());
    expect_client_event(&server, &ClientEvent::StopTyping(TypingUser::new("alice", "c1"))).await;
}
