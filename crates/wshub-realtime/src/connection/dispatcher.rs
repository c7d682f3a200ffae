//! Handler dispatcher: turns accepted sockets into connections and routes
//! their events to the configured callbacks.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::metrics::EngineMetrics;
use crate::transport::{ABNORMAL_CLOSURE, AcceptedSocket, SocketEvent, TransportError};

use super::handle::Connection;
use super::registry::ConnectionRegistry;

/// Routes socket events to the application callbacks of one server.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    config: Arc<ServerConfig>,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<EngineMetrics>,
}

impl Dispatcher {
    /// Creates a dispatcher over the given registry.
    pub fn new(
        config: Arc<ServerConfig>,
        registry: Arc<ConnectionRegistry>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            config,
            registry,
            metrics,
        }
    }

    /// Registers an accepted socket and starts dispatching its events.
    ///
    /// The connection handler runs before the dispatch task starts. Events
    /// the socket raises in the meantime stay queued and are delivered
    /// afterwards, in order.
    pub fn attach(&self, accepted: AcceptedSocket) -> Arc<Connection> {
        let AcceptedSocket {
            socket,
            metadata,
            events,
        } = accepted;
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Connection::new(socket, metadata, failures_tx));

        self.registry.add(connection.clone());
        self.metrics.record_connect();

        info!(
            conn_id = %connection.id,
            remote_addr = ?connection.remote_addr(),
            path = %connection.metadata().path,
            protocol = ?connection.protocol(),
            "WebSocket connection registered"
        );

        if let Some(handler) = &self.config.connection_handler {
            handler(&connection);
        }

        tokio::spawn(self.clone().run(connection.clone(), events, failures_rx));

        connection
    }

    async fn run(
        self,
        connection: Arc<Connection>,
        mut events: mpsc::UnboundedReceiver<SocketEvent>,
        mut failures: mpsc::UnboundedReceiver<TransportError>,
    ) {
        loop {
            let event = tokio::select! {
                biased;
                Some(error) = failures.recv() => SocketEvent::Error(error),
                event = events.recv() => event.unwrap_or(SocketEvent::Close {
                    code: ABNORMAL_CLOSURE,
                    reason: String::new(),
                }),
            };

            if self.dispatch(&connection, event) {
                break;
            }
        }
    }

    /// Delivers one event. Returns `true` once the connection is closed.
    fn dispatch(&self, connection: &Arc<Connection>, event: SocketEvent) -> bool {
        match event {
            SocketEvent::Message(payload) => {
                self.metrics.message_received();
                if let Some(handler) = &self.config.message_handler {
                    handler(payload, connection);
                }
                false
            }
            SocketEvent::Error(error) => {
                debug!(conn_id = %connection.id, error = %error, "WebSocket connection error");
                if let Some(handler) = &self.config.error_handler {
                    handler(error, connection);
                }
                false
            }
            SocketEvent::Pong => {
                if self.config.heartbeat_enabled() {
                    connection.record_pong();
                }
                false
            }
            SocketEvent::Close { code, reason } => {
                if self.registry.remove(&connection.id).is_some() {
                    self.metrics.record_disconnect();
                }
                info!(
                    conn_id = %connection.id,
                    code,
                    reason = %reason,
                    "WebSocket connection closed"
                );
                if let Some(handler) = &self.config.close_handler {
                    handler(code, reason, connection);
                }
                true
            }
        }
    }
}
