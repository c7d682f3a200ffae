//! WebSocket connection management: handles, registry, heartbeat and dispatch.

pub mod dispatcher;
pub mod handle;
pub mod heartbeat;
pub mod registry;

pub use dispatcher::Dispatcher;
pub use handle::{Connection, ConnectionId, ConnectionInfo, HeartbeatState};
pub use registry::ConnectionRegistry;
