//! Server configuration: heartbeat interval and application callbacks.
//!
//! Every field is optional. A missing callback means the event is ignored;
//! a missing timeout disables the heartbeat.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::connection::Connection;
use crate::transport::{Payload, ProtocolHandler, TransportError};

/// Invoked once per accepted connection.
pub type ConnectionHandler = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
/// Invoked per inbound message.
pub type MessageHandler = Arc<dyn Fn(Payload, &Arc<Connection>) + Send + Sync>;
/// Invoked per transport-reported error.
pub type ErrorHandler = Arc<dyn Fn(TransportError, &Arc<Connection>) + Send + Sync>;
/// Invoked once when a connection closes, gracefully or not.
pub type CloseHandler = Arc<dyn Fn(u16, String, &Arc<Connection>) + Send + Sync>;

/// Immutable server configuration.
#[derive(Clone, Default)]
pub struct ServerConfig {
    /// Heartbeat interval. `None` or zero disables liveness checking.
    pub timeout: Option<Duration>,
    /// Subprotocol selection hook.
    pub protocol_handler: Option<ProtocolHandler>,
    /// New-connection callback.
    pub connection_handler: Option<ConnectionHandler>,
    /// Inbound message callback.
    pub message_handler: Option<MessageHandler>,
    /// Error callback.
    pub error_handler: Option<ErrorHandler>,
    /// Close callback.
    pub close_handler: Option<CloseHandler>,
}

impl ServerConfig {
    /// Configuration with no heartbeat and no callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the heartbeat interval.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the subprotocol selection hook.
    pub fn on_protocols<F>(mut self, handler: F) -> Self
    where
        F: Fn(&[String]) -> Option<String> + Send + Sync + 'static,
    {
        self.protocol_handler = Some(Arc::new(handler));
        self
    }

    /// Set the connection callback.
    pub fn on_connection<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.connection_handler = Some(Arc::new(handler));
        self
    }

    /// Set the message callback.
    pub fn on_message<F>(mut self, handler: F) -> Self
    where
        F: Fn(Payload, &Arc<Connection>) + Send + Sync + 'static,
    {
        self.message_handler = Some(Arc::new(handler));
        self
    }

    /// Set the error callback.
    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(TransportError, &Arc<Connection>) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Set the close callback.
    pub fn on_close<F>(mut self, handler: F) -> Self
    where
        F: Fn(u16, String, &Arc<Connection>) + Send + Sync + 'static,
    {
        self.close_handler = Some(Arc::new(handler));
        self
    }

    /// Heartbeat period, if enabled. A zero timeout disables it.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.timeout.filter(|timeout| !timeout.is_zero())
    }

    /// Whether the heartbeat is enabled.
    pub fn heartbeat_enabled(&self) -> bool {
        self.heartbeat_interval().is_some()
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("timeout", &self.timeout)
            .field("protocol_handler", &self.protocol_handler.is_some())
            .field("connection_handler", &self.connection_handler.is_some())
            .field("message_handler", &self.message_handler.is_some())
            .field("error_handler", &self.error_handler.is_some())
            .field("close_handler", &self.close_handler.is_some())
            .finish()
    }
}
