//! WebSocket transport for the chat backend.
//!
//! Implements the [`Transport`] trait over a WebSocket connection carrying
//! JSON text frames (see [`livechat_proto::codec`]). Each [`Transport::open`]
//! dials the server, performs the `auth` / `connect` handshake, and spawns a
//! reader and a writer task that bridge the socket to the returned
//! [`Channel`].

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use livechat_proto::codec;
use livechat_proto::events::{AuthPayload, ClientEvent, ServerEvent};

use super::{AuthToken, Channel, ChannelEvent, ChannelTasks, Transport, TransportError, TransportType};

/// Type alias for the write half of a WebSocket connection.
type WsSender =
    futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>, WsMessage>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Default timeout for establishing the WebSocket connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for the server's answer to the `auth` frame.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default capacity of the inbound and outbound channel buffers.
pub const DEFAULT_BUFFER: usize = 256;

/// WebSocket transport implementing the [`Transport`] trait.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
    connect_timeout: Duration,
    handshake_timeout: Duration,
    buffer: usize,
}

impl WebSocketTransport {
    /// Create a transport for the given `ws://` or `wss://` URL with default
    /// timeouts.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            buffer: DEFAULT_BUFFER,
        }
    }

    /// Override the connect and handshake timeouts.
    #[must_use]
    pub const fn with_timeouts(mut self, connect: Duration, handshake: Duration) -> Self {
        self.connect_timeout = connect;
        self.handshake_timeout = handshake;
        self
    }

    /// Override the channel buffer capacity.
    #[must_use]
    pub const fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer;
        self
    }

    /// The server URL this transport dials.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Sends the `auth` frame and waits for the server's verdict.
    async fn handshake(
        &self,
        ws_sender: &mut WsSender,
        ws_reader: &mut WsReader,
        token: &AuthToken,
    ) -> Result<(), TransportError> {
        let auth = ClientEvent::Auth(AuthPayload {
            token: token.expose().to_string(),
        });
        let frame = codec::encode(&auth).map_err(|e| TransportError::Protocol(e.to_string()))?;
        ws_sender
            .send(WsMessage::Text(frame.into()))
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "failed to send auth frame");
                TransportError::ConnectionClosed
            })?;

        let verdict = tokio::time::timeout(self.handshake_timeout, async {
            loop {
                match ws_reader.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        return codec::decode::<ServerEvent>(text.as_str())
                            .map_err(|e| TransportError::Protocol(e.to_string()));
                    }
                    Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {}
                    Some(Ok(WsMessage::Close(_))) | None => {
                        return Err(TransportError::ConnectionClosed);
                    }
                    Some(Ok(_)) => {
                        return Err(TransportError::Protocol(
                            "unexpected non-text frame during handshake".into(),
                        ));
                    }
                    Some(Err(e)) => {
                        return Err(TransportError::Io(std::io::Error::other(e.to_string())));
                    }
                }
            }
        })
        .await
        .map_err(|_| {
            tracing::warn!(url = %self.url, "handshake timed out");
            TransportError::Timeout
        })??;

        match verdict {
            ServerEvent::Connect => Ok(()),
            ServerEvent::SocketError(err) if err.is_auth_failure() => {
                tracing::warn!(error = %err, "server rejected auth token");
                Err(TransportError::AuthRejected(err.to_string()))
            }
            ServerEvent::SocketError(err) => {
                tracing::warn!(error = %err, "server error during handshake");
                Err(TransportError::Protocol(format!(
                    "server error during handshake: {err}"
                )))
            }
            other => Err(TransportError::Protocol(format!(
                "expected connect, got {}",
                other.name()
            ))),
        }
    }
}

impl Transport for WebSocketTransport {
    /// Dial the server and authenticate.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Timeout`] if connecting or the handshake times out.
    /// - [`TransportError::Unreachable`] if the server refuses the connection.
    /// - [`TransportError::AuthRejected`] if the server answers `socketError`.
    /// - [`TransportError::Protocol`] for any other unexpected answer.
    async fn open(&self, token: &AuthToken) -> Result<Channel, TransportError> {
        let (ws_stream, _response) =
            tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()))
                .await
                .map_err(|_| {
                    tracing::warn!(url = %self.url, "WebSocket connect timed out");
                    TransportError::Timeout
                })?
                .map_err(|e| {
                    tracing::warn!(url = %self.url, error = %e, "WebSocket connect failed");
                    map_ws_connect_error(&self.url, e)
                })?;

        let (mut ws_sender, mut ws_reader) = ws_stream.split();
        self.handshake(&mut ws_sender, &mut ws_reader, token).await?;
        tracing::info!(url = %self.url, "channel authenticated");

        let (inbound_tx, inbound_rx) = mpsc::channel(self.buffer);
        let (outbound_tx, outbound_rx) = mpsc::channel(self.buffer);
        let reader = tokio::spawn(reader_loop(ws_reader, inbound_tx));
        let writer = tokio::spawn(writer_loop(outbound_rx, ws_sender));

        Ok(Channel::new(
            outbound_tx,
            inbound_rx,
            ChannelTasks::new(vec![reader, writer]),
        ))
    }

    fn transport_type(&self) -> TransportType {
        TransportType::WebSocket
    }
}

/// Reads frames from the socket and forwards decoded events.
///
/// Malformed frames are logged and skipped; the channel stays up. A final
/// [`ChannelEvent::Closed`] is sent when the socket ends.
async fn reader_loop(mut ws_reader: WsReader, tx: mpsc::Sender<ChannelEvent>) {
    let reason = loop {
        match ws_reader.next().await {
            Some(Ok(WsMessage::Text(text))) => match codec::decode::<ServerEvent>(text.as_str()) {
                Ok(event) => {
                    tracing::trace!(event = event.name(), "inbound event");
                    if tx.send(ChannelEvent::Event(event)).await.is_err() {
                        // Channel dropped by its owner.
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "malformed frame, skipping");
                }
            },
            Some(Ok(WsMessage::Close(_))) => break "closed by server".to_string(),
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::warn!(error = %e, "WebSocket read error");
                break e.to_string();
            }
            None => break "stream ended".to_string(),
        }
    };
    tracing::info!(%reason, "reader task exiting");
    let _ = tx.send(ChannelEvent::Closed { reason }).await;
}

/// Encodes outbound events onto the socket until the sender side is dropped.
async fn writer_loop(mut rx: mpsc::Receiver<ClientEvent>, mut ws_sender: WsSender) {
    while let Some(event) = rx.recv().await {
        let frame = match codec::encode(&event) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(event = event.name(), error = %e, "failed to encode event");
                continue;
            }
        };
        if let Err(e) = ws_sender.send(WsMessage::Text(frame.into())).await {
            tracing::warn!(error = %e, "WebSocket write failed");
            return;
        }
    }
    let _ = ws_sender.send(WsMessage::Close(None)).await;
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(url: &str, err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if matches!(
                io_err.kind(),
                std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::AddrNotAvailable
            ) {
                TransportError::Unreachable(url.to_string())
            } else {
                TransportError::Io(io_err)
            }
        }
        WsError::Http(response) => {
            TransportError::Protocol(format!("HTTP error: status {}", response.status()))
        }
        other => TransportError::Io(std::io::Error::other(other.to_string())),
    }
}
