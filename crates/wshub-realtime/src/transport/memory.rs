//! In-process transport for single-node embedding and tests.
//!
//! [`MemoryTransport::connect`] plays the client role: it hands back a
//! [`MemoryClient`] once the server side has accepted the connection. The
//! client observes every frame the server sends and injects messages,
//! pongs, errors and closes into the server's event stream.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{
    ABNORMAL_CLOSURE, AcceptedSocket, HandshakeMetadata, Payload, PendingSocket, ProtocolHandler,
    ReadyState, Socket, SocketEvent, SocketState, Transport, TransportError, negotiate_protocol,
};

/// A frame as seen by the client end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// Data frame.
    Message(Payload),
    /// Ping frame.
    Ping,
    /// Close frame.
    Close {
        /// Close status code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// Connection request made by an in-process client.
#[derive(Debug, Clone, Default)]
pub struct ClientRequest {
    /// Request path.
    pub path: String,
    /// Offered subprotocols, in preference order.
    pub protocols: Vec<String>,
    /// Request headers.
    pub headers: Vec<(String, String)>,
    /// Simulated peer address.
    pub remote_addr: Option<SocketAddr>,
}

impl ClientRequest {
    /// Request for `/` offering the given protocols.
    pub fn with_protocols(protocols: &[&str]) -> Self {
        Self {
            path: "/".to_string(),
            protocols: protocols.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        }
    }
}

#[derive(Debug)]
struct Dial {
    request: ClientRequest,
    reply: oneshot::Sender<MemoryClient>,
}

/// In-memory transport.
#[derive(Debug)]
pub struct MemoryTransport {
    dial_tx: mpsc::UnboundedSender<Dial>,
    dial_rx: Mutex<mpsc::UnboundedReceiver<Dial>>,
    closed: CancellationToken,
}

impl MemoryTransport {
    /// Create a transport with no pending connections.
    pub fn new() -> Self {
        let (dial_tx, dial_rx) = mpsc::unbounded_channel();
        Self {
            dial_tx,
            dial_rx: Mutex::new(dial_rx),
            closed: CancellationToken::new(),
        }
    }

    /// Connect to `/` without offering any subprotocol.
    pub async fn connect(&self) -> Result<MemoryClient, TransportError> {
        self.connect_with(ClientRequest {
            path: "/".to_string(),
            ..Default::default()
        })
        .await
    }

    /// Connect with an explicit request.
    ///
    /// The dial stays queued until some server accepts it, so with no server
    /// accepting this waits until [`close`](Self::close) is called and then
    /// fails with [`TransportError::Closed`].
    pub async fn connect_with(&self, request: ClientRequest) -> Result<MemoryClient, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let (reply, accepted) = oneshot::channel();
        self.dial_tx
            .send(Dial { request, reply })
            .map_err(|_| TransportError::Closed)?;
        tokio::select! {
            result = accepted => {
                result.map_err(|_| TransportError::Handshake("connection refused".to_string()))
            }
            () = self.closed.cancelled() => Err(TransportError::Closed),
        }
    }

    /// Stop accepting. Pending and future `accept` calls fail with
    /// [`TransportError::Closed`].
    pub fn close(&self) {
        self.closed.cancel();
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn accept(
        &self,
        protocols: Option<ProtocolHandler>,
    ) -> Result<PendingSocket, TransportError> {
        let mut dials = self.dial_rx.lock().await;
        let dial = tokio::select! {
            () = self.closed.cancelled() => return Err(TransportError::Closed),
            dial = dials.recv() => dial.ok_or(TransportError::Closed)?,
        };
        Ok(Box::pin(async move {
            complete_handshake(dial, protocols.as_ref())
        }))
    }
}

fn complete_handshake(
    dial: Dial,
    protocols: Option<&ProtocolHandler>,
) -> Result<AcceptedSocket, TransportError> {
    let Dial { request, reply } = dial;
    let protocol = negotiate_protocol(&request.protocols, protocols);

    let state = Arc::new(SocketState::new(ReadyState::Open));
    let auto_pong = Arc::new(AtomicBool::new(true));
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();

    let socket = MemorySocket {
        state: state.clone(),
        frames: frames_tx,
        events: events_tx.clone(),
        auto_pong: auto_pong.clone(),
    };
    let client = MemoryClient {
        state,
        frames: frames_rx,
        events: events_tx,
        auto_pong,
        protocol: protocol.clone(),
    };
    let metadata = HandshakeMetadata {
        remote_addr: request.remote_addr,
        path: request.path,
        protocol,
        headers: request.headers,
    };

    reply
        .send(client)
        .map_err(|_| TransportError::Handshake("client went away".to_string()))?;

    Ok(AcceptedSocket {
        socket: Arc::new(socket),
        metadata,
        events: events_rx,
    })
}

/// Server end of an in-memory connection.
#[derive(Debug)]
pub struct MemorySocket {
    state: Arc<SocketState>,
    frames: mpsc::UnboundedSender<ClientFrame>,
    events: mpsc::UnboundedSender<SocketEvent>,
    auto_pong: Arc<AtomicBool>,
}

impl Socket for MemorySocket {
    fn send(&self, payload: Payload) -> Result<(), TransportError> {
        if self.state.get() != ReadyState::Open {
            return Err(TransportError::NotOpen);
        }
        self.frames
            .send(ClientFrame::Message(payload))
            .map_err(|_| TransportError::NotOpen)
    }

    fn ping(&self) -> Result<(), TransportError> {
        if self.state.get() != ReadyState::Open {
            return Err(TransportError::NotOpen);
        }
        self.frames
            .send(ClientFrame::Ping)
            .map_err(|_| TransportError::NotOpen)?;
        if self.auto_pong.load(Ordering::SeqCst) {
            let _ = self.events.send(SocketEvent::Pong);
        }
        Ok(())
    }

    fn close(&self, code: u16, reason: &str) {
        if !self.state.transition(ReadyState::Open, ReadyState::Closing) {
            return;
        }
        let _ = self.frames.send(ClientFrame::Close {
            code,
            reason: reason.to_string(),
        });
        // The in-process peer acknowledges immediately with the same frame.
        if self.state.transition(ReadyState::Closing, ReadyState::Closed) {
            let _ = self.events.send(SocketEvent::Close {
                code,
                reason: reason.to_string(),
            });
        }
    }

    fn terminate(&self) {
        if self.state.replace(ReadyState::Closed) != ReadyState::Closed {
            let _ = self.events.send(SocketEvent::Close {
                code: ABNORMAL_CLOSURE,
                reason: String::new(),
            });
        }
    }

    fn ready_state(&self) -> ReadyState {
        self.state.get()
    }
}

/// Client end of an in-memory connection.
///
/// Dropping the client drops the connection without a close handshake.
#[derive(Debug)]
pub struct MemoryClient {
    state: Arc<SocketState>,
    frames: mpsc::UnboundedReceiver<ClientFrame>,
    events: mpsc::UnboundedSender<SocketEvent>,
    auto_pong: Arc<AtomicBool>,
    protocol: Option<String>,
}

impl MemoryClient {
    /// Subprotocol negotiated during the handshake.
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Connection readiness, shared with the server end.
    pub fn ready_state(&self) -> ReadyState {
        self.state.get()
    }

    /// Send a data frame to the server.
    pub fn send(&self, payload: impl Into<Payload>) -> Result<(), TransportError> {
        if self.state.get() != ReadyState::Open {
            return Err(TransportError::NotOpen);
        }
        self.events
            .send(SocketEvent::Message(payload.into()))
            .map_err(|_| TransportError::NotOpen)
    }

    /// Send an unsolicited pong.
    pub fn pong(&self) {
        if self.state.get() != ReadyState::Closed {
            let _ = self.events.send(SocketEvent::Pong);
        }
    }

    /// Whether server pings are answered automatically (the default).
    pub fn set_auto_pong(&self, enabled: bool) {
        self.auto_pong.store(enabled, Ordering::SeqCst);
    }

    /// Make the server end report a transport error.
    pub fn raise_error(&self, error: TransportError) {
        if self.state.get() != ReadyState::Closed {
            let _ = self.events.send(SocketEvent::Error(error));
        }
    }

    /// Close gracefully from the client side.
    pub fn close(&self, code: u16, reason: &str) {
        if self.state.replace(ReadyState::Closed) != ReadyState::Closed {
            let _ = self.events.send(SocketEvent::Close {
                code,
                reason: reason.to_string(),
            });
        }
    }

    /// Drop the connection without a close handshake.
    pub fn disconnect(&self) {
        if self.state.replace(ReadyState::Closed) != ReadyState::Closed {
            let _ = self.events.send(SocketEvent::Close {
                code: ABNORMAL_CLOSURE,
                reason: String::new(),
            });
        }
    }

    /// Next frame from the server, or `None` once the server end is gone.
    pub async fn recv(&mut self) -> Option<ClientFrame> {
        self.frames.recv().await
    }

    /// Next frame if one is already queued.
    pub fn try_recv(&mut self) -> Option<ClientFrame> {
        self.frames.try_recv().ok()
    }

    /// Next data frame, skipping pings. `None` on close.
    pub async fn recv_message(&mut self) -> Option<Payload> {
        loop {
            match self.frames.recv().await? {
                ClientFrame::Message(payload) => return Some(payload),
                ClientFrame::Ping => continue,
                ClientFrame::Close { .. } => return None,
            }
        }
    }
}

impl Drop for MemoryClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}
