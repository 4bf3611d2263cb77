//! Integration tests for the connection manager over a real WebSocket.
//!
//! A small in-process backend speaks the JSON event protocol: it checks
//! the `auth` frame, answers pings, and can push events or close the
//! socket on command.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use livechat::connection::{ConnectionManager, ConnectionState, ReconnectConfig};
use livechat::transport::AuthToken;
use livechat::transport::websocket::WebSocketTransport;
use livechat_proto::codec;
use livechat_proto::events::{ClientEvent, ErrorDescriptor, ServerEvent};
use livechat_proto::message::UserId;

const GOOD_TOKEN: &str = "good-token";
/// Answered with a non-auth socket error, as an overloaded backend would.
const BUSY_TOKEN: &str = "busy-token";
const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
enum Command {
    Push(ServerEvent),
    Close,
}

/// Handle to the in-process backend.
struct MockBackend {
    url: String,
    commands: broadcast::Sender<Command>,
    seen: mpsc::UnboundedReceiver<ClientEvent>,
    accepted: Arc<AtomicU32>,
}

impl MockBackend {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/socket", listener.local_addr().unwrap());
        let (commands, _) = broadcast::channel(16);
        let (seen_tx, seen) = mpsc::unbounded_channel();
        let accepted = Arc::new(AtomicU32::new(0));

        let cmd_tx = commands.clone();
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, cmd_tx.subscribe(), seen_tx.clone()));
            }
        });

        Self {
            url,
            commands,
            seen,
            accepted,
        }
    }

    fn push(&self, event: ServerEvent) {
        self.commands.send(Command::Push(event)).unwrap();
    }

    fn close_all(&self) {
        self.commands.send(Command::Close).unwrap();
    }

    fn accepted(&self) -> u32 {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Next client event that is not a ping.
    async fn next_event(&mut self) -> ClientEvent {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.seen.recv().await {
                    Some(ClientEvent::Ping(_)) => {}
                    Some(event) => return event,
                    None => panic!("backend stopped"),
                }
            }
        })
        .await
        .expect("no client event")
    }
}

async fn serve(
    stream: TcpStream,
    mut commands: broadcast::Receiver<Command>,
    seen: mpsc::UnboundedSender<ClientEvent>,
) {
    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let token = match ws.next().await {
        Some(Ok(WsMessage::Text(text))) => match codec::decode::<ClientEvent>(text.as_str()) {
            Ok(ClientEvent::Auth(auth)) => auth.token,
            _ => return,
        },
        _ => return,
    };
    if token != GOOD_TOKEN {
        let reject = ServerEvent::SocketError(if token == BUSY_TOKEN {
            ErrorDescriptor {
                message: "busy".into(),
                code: Some("overloaded".into()),
            }
        } else {
            ErrorDescriptor {
                message: "invalid token".into(),
                code: Some("unauthorized".into()),
            }
        });
        let _ = ws.send(text_frame(&reject)).await;
        let _ = ws.close(None).await;
        return;
    }
    if ws.send(text_frame(&ServerEvent::Connect)).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            frame = ws.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    let Ok(event) = codec::decode::<ClientEvent>(text.as_str()) else {
                        continue;
                    };
                    if let ClientEvent::Ping(probe) = &event {
                        let _ = ws.send(text_frame(&ServerEvent::Pong(*probe))).await;
                    }
                    let _ = seen.send(event);
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => return,
            },
            command = commands.recv() => match command {
                Ok(Command::Push(event)) => {
                    let _ = ws.send(text_frame(&event)).await;
                }
                Ok(Command::Close) | Err(_) => {
                    let _ = ws.close(None).await;
                    return;
                }
            },
        }
    }
}

fn text_frame(event: &ServerEvent) -> WsMessage {
    WsMessage::Text(codec::encode(event).unwrap().into())
}

fn manager(url: &str) -> ConnectionManager<WebSocketTransport> {
    let config = ReconnectConfig {
        initial_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(200),
        max_attempts: 5,
    };
    ConnectionManager::new(WebSocketTransport::new(url), config)
}

async fn wait_for_state(mgr: &ConnectionManager<WebSocketTransport>, target: ConnectionState) {
    let mut rx = mgr.watch_state();
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == target))
        .await
        .unwrap_or_else(|_| panic!("never reached {target}"))
        .unwrap();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pushed_events_reach_subscribers() {
    let backend = MockBackend::start().await;
    let mgr = manager(&backend.url);
    let mut events = mgr.subscribe();

    assert_eq!(
        mgr.connect(AuthToken::new(GOOD_TOKEN)).await,
        ConnectionState::Connected
    );
    backend.push(ServerEvent::UserIsOnline(UserId::new("u1")));

    let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!(event, ServerEvent::UserIsOnline(UserId::new("u1")));
}

#[tokio::test]
async fn emitted_events_reach_backend() {
    let mut backend = MockBackend::start().await;
    let mgr = manager(&backend.url);
    mgr.connect(AuthToken::new(GOOD_TOKEN)).await;

    mgr.emit(ClientEvent::UserOnline).unwrap();
    assert_eq!(backend.next_event().await, ClientEvent::UserOnline);
}

#[tokio::test]
async fn probe_round_trips_over_socket() {
    let backend = MockBackend::start().await;
    let mgr = manager(&backend.url);
    mgr.connect(AuthToken::new(GOOD_TOKEN)).await;

    assert!(mgr.probe(WAIT).await);
    assert!(mgr.probe(WAIT).await);
}

#[tokio::test]
async fn server_close_triggers_reconnect() {
    let backend = MockBackend::start().await;
    let mgr = manager(&backend.url);
    mgr.connect(AuthToken::new(GOOD_TOKEN)).await;
    let mut states = mgr.watch_state();

    backend.close_all();
    tokio::time::timeout(
        WAIT,
        states.wait_for(|s| *s == ConnectionState::Reconnecting),
    )
    .await
    .unwrap()
    .unwrap();

    wait_for_state(&mgr, ConnectionState::Connected).await;
    assert_eq!(backend.accepted(), 2);
    assert!(mgr.probe(WAIT).await);
}

#[tokio::test]
async fn rejected_token_is_not_retried() {
    let backend = MockBackend::start().await;
    let mgr = manager(&backend.url);

    assert_eq!(
        mgr.connect(AuthToken::new("stale-token")).await,
        ConnectionState::Failed
    );
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(backend.accepted(), 1);
    assert_eq!(mgr.state(), ConnectionState::Failed);
}

#[tokio::test]
async fn non_auth_handshake_error_is_retried() {
    let backend = MockBackend::start().await;
    let mgr = manager(&backend.url);

    assert_eq!(
        mgr.connect(AuthToken::new(BUSY_TOKEN)).await,
        ConnectionState::Reconnecting
    );
    tokio::time::timeout(WAIT, async {
        while backend.accepted() < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("no reconnect attempt");
    assert_ne!(mgr.state(), ConnectionState::Failed);
    mgr.disconnect();
}

#[tokio::test]
async fn unreachable_server_gives_up_after_ceiling() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/socket", listener.local_addr().unwrap());
    drop(listener);

    let mgr = manager(&url);
    assert_eq!(
        mgr.connect(AuthToken::new(GOOD_TOKEN)).await,
        ConnectionState::Reconnecting
    );
    wait_for_state(&mgr, ConnectionState::Failed).await;
}
