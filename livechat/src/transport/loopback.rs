//! Loopback transport for testing.
//!
//! Uses in-process [`tokio::sync::mpsc`] channels in place of a network
//! connection. Created via [`LoopbackTransport::create_pair`], which returns
//! the client-side transport and a [`LoopbackServer`] handle that plays the
//! backend: it can refuse connections, reject tokens, stop answering pings
//! (a zombie connection), push events, and drop the live channel.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use livechat_proto::events::{ClientEvent, ServerEvent};

use super::{AuthToken, Channel, ChannelEvent, ChannelTasks, Transport, TransportError, TransportType};

/// Backend behaviour shared between the transport and its server handle.
#[derive(Debug)]
struct ServerState {
    accepting: bool,
    valid_token: Option<String>,
    responsive: bool,
    open_attempts: u32,
    connections: u32,
    current: Option<mpsc::Sender<ChannelEvent>>,
}

/// In-process transport backed by `tokio::sync::mpsc` channels.
#[derive(Debug)]
pub struct LoopbackTransport {
    state: Arc<Mutex<ServerState>>,
    log_tx: mpsc::UnboundedSender<ClientEvent>,
    buffer: usize,
}

/// Test-side handle acting as the chat backend.
#[derive(Debug)]
pub struct LoopbackServer {
    state: Arc<Mutex<ServerState>>,
    log_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ClientEvent>>,
}

impl LoopbackTransport {
    /// Create a connected transport/server pair.
    ///
    /// The server starts out accepting any token and answering pings. The
    /// `buffer` parameter controls the channel capacity in each direction.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use livechat::transport::loopback::LoopbackTransport;
    /// use livechat::transport::{AuthToken, Transport};
    ///
    /// # async fn example() {
    /// let (transport, server) = LoopbackTransport::create_pair(32);
    /// let channel = transport.open(&AuthToken::new("token")).await.unwrap();
    /// assert_eq!(server.connection_count(), 1);
    /// # drop(channel);
    /// # }
    /// ```
    #[must_use]
    pub fn create_pair(buffer: usize) -> (Self, LoopbackServer) {
        let state = Arc::new(Mutex::new(ServerState {
            accepting: true,
            valid_token: None,
            responsive: true,
            open_attempts: 0,
            connections: 0,
            current: None,
        }));
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        let transport = Self {
            state: Arc::clone(&state),
            log_tx,
            buffer,
        };
        let server = LoopbackServer {
            state,
            log_rx: tokio::sync::Mutex::new(log_rx),
        };
        (transport, server)
    }
}

impl Transport for LoopbackTransport {
    async fn open(&self, token: &AuthToken) -> Result<Channel, TransportError> {
        let (inbound_tx, inbound_rx) = mpsc::channel(self.buffer);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ClientEvent>(self.buffer);

        {
            let mut state = self.state.lock();
            state.open_attempts += 1;
            if !state.accepting {
                return Err(TransportError::Unreachable("loopback".into()));
            }
            if let Some(valid) = &state.valid_token
                && valid != token.expose()
            {
                return Err(TransportError::AuthRejected("invalid token".into()));
            }
            state.connections += 1;
            state.current = Some(inbound_tx.clone());
        }

        let state = Arc::clone(&self.state);
        let log_tx = self.log_tx.clone();
        let server_task = tokio::spawn(async move {
            while let Some(event) = outbound_rx.recv().await {
                if let ClientEvent::Ping(probe) = &event {
                    let responsive = state.lock().responsive;
                    if responsive {
                        let _ = inbound_tx
                            .send(ChannelEvent::Event(ServerEvent::Pong(*probe)))
                            .await;
                    }
                }
                let _ = log_tx.send(event);
            }
        });

        Ok(Channel::new(
            outbound_tx,
            inbound_rx,
            ChannelTasks::new(vec![server_task]),
        ))
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Loopback
    }
}

impl LoopbackServer {
    /// Accept or refuse new connections (refused opens fail as unreachable).
    pub fn set_accepting(&self, accepting: bool) {
        self.state.lock().accepting = accepting;
    }

    /// Only accept this token from now on; `None` accepts any token.
    pub fn require_token(&self, token: Option<&str>) {
        self.state.lock().valid_token = token.map(str::to_string);
    }

    /// Answer pings or ignore them. An unresponsive server with an open
    /// channel is a zombie connection.
    pub fn set_responsive(&self, responsive: bool) {
        self.state.lock().responsive = responsive;
    }

    /// Number of `open` calls seen, successful or not.
    #[must_use]
    pub fn open_attempts(&self) -> u32 {
        self.state.lock().open_attempts
    }

    /// Number of channels successfully opened.
    #[must_use]
    pub fn connection_count(&self) -> u32 {
        self.state.lock().connections
    }

    /// Push an event to the most recently opened channel.
    ///
    /// Returns `false` if there is no live channel to deliver to.
    pub fn push(&self, event: ServerEvent) -> bool {
        let sender = self.state.lock().current.clone();
        sender.is_some_and(|tx| tx.try_send(ChannelEvent::Event(event)).is_ok())
    }

    /// Close the live channel from the server side.
    pub fn drop_connection(&self) {
        let sender = self.state.lock().current.take();
        if let Some(tx) = sender {
            let _ = tx.try_send(ChannelEvent::Closed {
                reason: "server dropped connection".into(),
            });
        }
    }

    /// Wait for the next event emitted by the client (pings included).
    pub async fn next_client_event(&self) -> Option<ClientEvent> {
        self.log_rx.lock().await.recv().await
    }

    /// Take every client event received so far without waiting.
    pub async fn drain_client_events(&self) -> Vec<ClientEvent> {
        let mut rx = self.log_rx.lock().await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }
}
