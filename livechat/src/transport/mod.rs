//! Transport layer abstraction for `LiveChat`.
//!
//! Defines the [`Transport`] trait that opens one authenticated event
//! [`Channel`] to the backend. Concrete implementations:
//! - [`websocket::WebSocketTransport`]: JSON text frames over WebSocket
//! - [`loopback::LoopbackTransport`]: in-process channel pair for testing

pub mod loopback;
pub mod websocket;

use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use livechat_proto::events::{ClientEvent, ServerEvent};

/// Bearer token used to authenticate the channel.
///
/// Reconnects reuse the same token. `Debug` output never shows the value.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    /// Wraps a token issued by the auth service.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the raw token for the handshake frame.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(<redacted>)")
    }
}

/// Describes which kind of transport is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// WebSocket connection to the chat backend.
    WebSocket,
    /// In-process loopback for testing.
    Loopback,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WebSocket => write!(f, "WebSocket"),
            Self::Loopback => write!(f, "Loopback"),
        }
    }
}

/// Errors that can occur while opening or using a channel.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The backend could not be reached.
    #[error("server {0} is unreachable")]
    Unreachable(String),

    /// The backend rejected the auth token.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// The backend answered with something other than the expected frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Something that happened on an open channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A decoded server event.
    Event(ServerEvent),
    /// The channel is gone; no further events follow.
    Closed {
        /// Why the channel closed, for logging.
        reason: String,
    },
}

/// Background tasks backing a channel, aborted when dropped.
#[derive(Debug, Default)]
pub struct ChannelTasks(Vec<JoinHandle<()>>);

impl ChannelTasks {
    /// Takes ownership of the given task handles.
    #[must_use]
    pub const fn new(handles: Vec<JoinHandle<()>>) -> Self {
        Self(handles)
    }

    /// Waits up to `grace` for the tasks to end on their own, then aborts
    /// whatever is still running.
    pub async fn finish(mut self, grace: Duration) {
        let mut handles = std::mem::take(&mut self.0);
        let joined = futures_util::future::join_all(handles.iter_mut());
        let timed_out = tokio::time::timeout(grace, joined).await.is_err();
        if timed_out {
            for handle in &handles {
                handle.abort();
            }
        }
    }
}

impl Drop for ChannelTasks {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

/// One live, authenticated event channel.
///
/// Outbound events are queued on a bounded sender so emitting never blocks;
/// inbound events arrive in order on the receiver. Dropping the channel
/// tears down its background tasks.
#[derive(Debug)]
pub struct Channel {
    outbound: mpsc::Sender<ClientEvent>,
    inbound: mpsc::Receiver<ChannelEvent>,
    tasks: ChannelTasks,
}

impl Channel {
    /// Assembles a channel from its parts.
    #[must_use]
    pub const fn new(
        outbound: mpsc::Sender<ClientEvent>,
        inbound: mpsc::Receiver<ChannelEvent>,
        tasks: ChannelTasks,
    ) -> Self {
        Self {
            outbound,
            inbound,
            tasks,
        }
    }

    /// Splits the channel into its outbound sender, inbound receiver, and
    /// task guard.
    #[must_use]
    pub fn into_parts(
        self,
    ) -> (
        mpsc::Sender<ClientEvent>,
        mpsc::Receiver<ChannelEvent>,
        ChannelTasks,
    ) {
        (self.outbound, self.inbound, self.tasks)
    }
}

/// Opens authenticated channels to the chat backend.
///
/// `open` performs the full handshake: it returns only once the server has
/// accepted the token (answered `connect`), so a returned [`Channel`] is
/// ready for use.
pub trait Transport: Send + Sync + 'static {
    /// Open a new channel authenticated with `token`.
    fn open(
        &self,
        token: &AuthToken,
    ) -> impl std::future::Future<Output = Result<Channel, TransportError>> + Send;

    /// Return the type of this transport.
    fn transport_type(&self) -> TransportType;
}
