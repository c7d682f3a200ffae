//! Transport boundary: the socket and listener capabilities the engine
//! consumes.
//!
//! The engine never touches frames or handshakes directly. It talks to a
//! [`Transport`] that yields [`AcceptedSocket`]s, and to each [`Socket`]
//! through a handful of non-blocking operations plus an ordered stream of
//! [`SocketEvent`]s.
//!
//! | Implementation | Purpose |
//! |----------------|---------|
//! | [`websocket::TungsteniteTransport`] | TCP listener speaking RFC 6455 via `tokio-tungstenite` |
//! | [`memory::MemoryTransport`] | In-process transport driven directly by the caller |

pub mod memory;
pub mod websocket;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use wshub_core::error::{ErrorKind, HubError};

pub use self::memory::MemoryTransport;
pub use self::websocket::TungsteniteTransport;

/// Normal closure.
pub const NORMAL_CLOSURE: u16 = 1000;
/// The endpoint is going away (server shutdown).
pub const GOING_AWAY: u16 = 1001;
/// A close frame arrived without a status code.
pub const NO_STATUS: u16 = 1005;
/// The connection dropped without a close handshake.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Subprotocol selection hook.
///
/// Receives the client-offered protocol names in order and returns the one
/// to accept, or `None` to decline all of them.
pub type ProtocolHandler = Arc<dyn Fn(&[String]) -> Option<String> + Send + Sync>;

/// A handshake in progress. Resolves once the upgrade completes.
pub type PendingSocket = BoxFuture<'static, Result<AcceptedSocket, TransportError>>;

/// Errors reported by a transport or one of its sockets.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(String),
    /// Malformed frame or protocol violation.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The upgrade handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// The socket is not in the `Open` state.
    #[error("socket is not open")]
    NotOpen,
    /// The transport stopped accepting connections.
    #[error("transport closed")]
    Closed,
    /// Application-raised error.
    #[error("{0}")]
    Custom(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<TransportError> for HubError {
    fn from(err: TransportError) -> Self {
        HubError::with_source(ErrorKind::Transport, err.to_string(), err)
    }
}

/// A message body, delivered verbatim in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Bytes),
}

impl Payload {
    /// Returns the text body, if this is a text payload.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text.as_str()),
            Self::Binary(_) => None,
        }
    }

    /// Returns the raw bytes of the payload.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes.as_ref(),
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Self::Binary(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(bytes))
    }
}

/// Socket readiness, mirroring the WebSocket `readyState` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ReadyState {
    /// Handshake not complete.
    Connecting = 0,
    /// Frames may be sent.
    Open = 1,
    /// A close frame was sent or received.
    Closing = 2,
    /// The connection is gone.
    Closed = 3,
}

impl ReadyState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Atomic cell holding a [`ReadyState`], shared between a socket handle and
/// its I/O driver.
#[derive(Debug)]
pub struct SocketState(AtomicU8);

impl SocketState {
    /// Create a cell in the given state.
    pub fn new(state: ReadyState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    /// Current state.
    pub fn get(&self) -> ReadyState {
        ReadyState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Overwrite the state, returning the previous one.
    pub fn replace(&self, state: ReadyState) -> ReadyState {
        ReadyState::from_u8(self.0.swap(state as u8, Ordering::SeqCst))
    }

    /// Move from `from` to `to`; returns `false` if the state was not `from`.
    pub fn transition(&self, from: ReadyState, to: ReadyState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Events emitted by a socket, in wire order.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// A data frame arrived.
    Message(Payload),
    /// The transport reported a failure on this socket.
    Error(TransportError),
    /// The connection closed. Always the last event.
    Close {
        /// Close status code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// A pong frame arrived.
    Pong,
}

/// Handle to one accepted connection.
///
/// Every operation is non-blocking: frames are queued on the transport's
/// writer and failures that happen later surface as
/// [`SocketEvent::Error`].
pub trait Socket: Send + Sync + fmt::Debug {
    /// Queue a data frame. Fails if the socket is not open.
    fn send(&self, payload: Payload) -> Result<(), TransportError>;

    /// Queue a ping frame. Fails if the socket is not open.
    fn ping(&self) -> Result<(), TransportError>;

    /// Start a graceful close handshake. No-op unless open.
    fn close(&self, code: u16, reason: &str);

    /// Drop the connection immediately, without a close handshake.
    ///
    /// The socket reports `Close { code: ABNORMAL_CLOSURE, .. }`.
    fn terminate(&self);

    /// Current readiness.
    fn ready_state(&self) -> ReadyState;

    /// Shorthand for `ready_state() == ReadyState::Open`.
    fn is_open(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }
}

/// Request details captured once, when the handshake completes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HandshakeMetadata {
    /// Peer address, when the transport has one.
    pub remote_addr: Option<SocketAddr>,
    /// Request path, including any query string.
    pub path: String,
    /// Negotiated subprotocol.
    pub protocol: Option<String>,
    /// Request headers in arrival order.
    pub headers: Vec<(String, String)>,
}

impl HandshakeMetadata {
    /// Case-insensitive lookup of the first header named `name`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// A socket whose handshake has completed.
#[derive(Debug)]
pub struct AcceptedSocket {
    /// Socket handle.
    pub socket: Arc<dyn Socket>,
    /// Handshake metadata.
    pub metadata: HandshakeMetadata,
    /// Event stream. Buffers from the moment the socket is accepted.
    pub events: mpsc::UnboundedReceiver<SocketEvent>,
}

/// A source of incoming connections.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Wait for the next connection attempt.
    ///
    /// Returns the pending handshake so the caller can drive it off the
    /// accept path. `protocols` is consulted during the handshake.
    /// [`TransportError::Closed`] means no further connections will arrive.
    async fn accept(
        &self,
        protocols: Option<ProtocolHandler>,
    ) -> Result<PendingSocket, TransportError>;
}

/// Split a `Sec-WebSocket-Protocol` header value into protocol names.
pub fn parse_protocol_offer(header: &str) -> Vec<String> {
    header
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Pick the subprotocol for a handshake.
///
/// Without a hook the first offer wins; with no offer there is nothing to
/// select and the hook is not called.
pub fn negotiate_protocol(offered: &[String], handler: Option<&ProtocolHandler>) -> Option<String> {
    if offered.is_empty() {
        return None;
    }
    match handler {
        Some(select) => select(offered),
        None => offered.first().cloned(),
    }
}
