//! # wshub-realtime
//!
//! WebSocket server core for wshub. Provides:
//!
//! - A transport abstraction with a tungstenite-backed TCP implementation
//!   and an in-process implementation for embedding and tests
//! - Connection lifecycle dispatch to application callbacks
//! - Ping/pong heartbeat that evicts unresponsive peers
//! - Fan-out broadcast with optional sender exclusion
//! - Per-server metrics and graceful shutdown

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod metrics;
pub mod server;
pub mod transport;

pub use broadcast::Broadcaster;
pub use config::ServerConfig;
pub use connection::{
    Connection, ConnectionId, ConnectionInfo, ConnectionRegistry, HeartbeatState,
};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use server::WsServer;
pub use transport::{
    MemoryTransport, Payload, ReadyState, Socket, Transport, TransportError, TungsteniteTransport,
};
