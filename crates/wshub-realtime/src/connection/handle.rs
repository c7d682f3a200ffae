//! Individual WebSocket connection handle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::transport::{HandshakeMetadata, Payload, ReadyState, Socket, TransportError};

/// Unique connection identifier
pub type ConnectionId = Uuid;

/// Heartbeat state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatState {
    /// No ping outstanding.
    Idle,
    /// A ping was sent and no pong has arrived since.
    AwaitingPong,
}

/// One accepted client session.
///
/// The same `Arc<Connection>` is handed to every callback for the lifetime
/// of the session, so callers may correlate events with [`Arc::ptr_eq`].
#[derive(Debug)]
pub struct Connection {
    /// Unique connection ID
    pub id: ConnectionId,
    /// Transport socket
    socket: Arc<dyn Socket>,
    /// Request details captured at accept time
    metadata: HandshakeMetadata,
    /// Set when a ping is outstanding
    ping_pending: AtomicBool,
    /// When the connection was established
    pub connected_at: DateTime<Utc>,
    /// Send failures, drained by the connection's dispatch task
    failures: mpsc::UnboundedSender<TransportError>,
}

impl Connection {
    /// Create a new connection handle
    pub(crate) fn new(
        socket: Arc<dyn Socket>,
        metadata: HandshakeMetadata,
        failures: mpsc::UnboundedSender<TransportError>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            socket,
            metadata,
            ping_pending: AtomicBool::new(false),
            connected_at: Utc::now(),
            failures,
        }
    }

    /// Underlying transport socket.
    pub fn socket(&self) -> &Arc<dyn Socket> {
        &self.socket
    }

    /// Handshake metadata.
    pub fn metadata(&self) -> &HandshakeMetadata {
        &self.metadata
    }

    /// Peer address, if known.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.metadata.remote_addr
    }

    /// Negotiated subprotocol.
    pub fn protocol(&self) -> Option<&str> {
        self.metadata.protocol.as_deref()
    }

    /// Socket readiness.
    pub fn ready_state(&self) -> ReadyState {
        self.socket.ready_state()
    }

    /// Check if the socket accepts frames
    pub fn is_open(&self) -> bool {
        self.socket.is_open()
    }

    /// Send a payload to this connection.
    ///
    /// A refused frame is reported to the connection's error handler rather
    /// than to the caller. Returns whether the frame was queued.
    pub fn send(&self, payload: impl Into<Payload>) -> bool {
        match self.socket.send(payload.into()) {
            Ok(()) => true,
            Err(e) => {
                warn!(conn_id = %self.id, error = %e, "Failed to send to connection");
                self.report(e);
                false
            }
        }
    }

    /// Start a graceful close.
    pub fn close(&self, code: u16, reason: &str) {
        self.socket.close(code, reason);
    }

    /// Drop the connection without a close handshake.
    pub fn terminate(&self) {
        self.socket.terminate();
    }

    /// Current heartbeat state
    pub fn heartbeat_state(&self) -> HeartbeatState {
        if self.ping_pending.load(Ordering::SeqCst) {
            HeartbeatState::AwaitingPong
        } else {
            HeartbeatState::Idle
        }
    }

    /// Record a pong response. Always returns the connection to `Idle`.
    pub fn record_pong(&self) {
        self.ping_pending.store(false, Ordering::SeqCst);
    }

    /// Mark a ping as outstanding, returning the previous state.
    pub(crate) fn begin_ping(&self) -> HeartbeatState {
        if self.ping_pending.swap(true, Ordering::SeqCst) {
            HeartbeatState::AwaitingPong
        } else {
            HeartbeatState::Idle
        }
    }

    /// Queue a failure for the error handler.
    pub(crate) fn report(&self, error: TransportError) {
        let _ = self.failures.send(error);
    }

    /// Get a snapshot of connection info
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            remote_addr: self.metadata.remote_addr,
            path: self.metadata.path.clone(),
            protocol: self.metadata.protocol.clone(),
            connected_at: self.connected_at,
            ready_state: self.ready_state(),
            heartbeat: self.heartbeat_state(),
        }
    }
}

/// Snapshot of connection info (serializable)
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    /// Connection ID
    pub id: ConnectionId,
    /// Peer address
    pub remote_addr: Option<SocketAddr>,
    /// Request path
    pub path: String,
    /// Negotiated subprotocol
    pub protocol: Option<String>,
    /// Connected at
    pub connected_at: DateTime<Utc>,
    /// Socket readiness
    pub ready_state: ReadyState,
    /// Heartbeat state
    pub heartbeat: HeartbeatState,
}
