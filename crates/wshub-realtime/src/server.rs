//! Top-level WebSocket server that ties the transport, dispatcher,
//! heartbeat and broadcaster together.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wshub_core::HubResult;

use crate::broadcast::Broadcaster;
use crate::config::ServerConfig;
use crate::connection::heartbeat::run_heartbeat;
use crate::connection::{Connection, ConnectionId, ConnectionRegistry, Dispatcher};
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::transport::{
    GOING_AWAY, Payload, PendingSocket, ProtocolHandler, Transport, TransportError,
};

/// Close reason sent to every connection still open at shutdown.
pub const SHUTDOWN_REASON: &str = "server shutting down";

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// How long shutdown waits for closing handshakes before terminating.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long shutdown waits for terminated sockets to report their close.
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(1);

/// A running WebSocket server.
///
/// Cloning is cheap and every clone refers to the same server. Each call to
/// [`WsServer::create`] produces an independent server with its own registry,
/// metrics and shutdown token.
#[derive(Clone)]
pub struct WsServer {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<EngineMetrics>,
    broadcaster: Broadcaster,
    shutdown: CancellationToken,
    /// Held for reading while a finished handshake is registered, and for
    /// writing once by shutdown, so no socket is registered after the drain.
    gate: Arc<RwLock<()>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    heartbeat: Option<Duration>,
}

impl fmt::Debug for WsServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsServer")
            .field("connections", &self.inner.registry.len())
            .field("heartbeat", &self.inner.heartbeat)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl WsServer {
    /// Start serving connections accepted by `transport`.
    ///
    /// Spawns the accept loop and, when configured, the heartbeat monitor.
    /// Must be called from within a Tokio runtime.
    pub fn create(transport: Arc<dyn Transport>, config: ServerConfig) -> Self {
        let heartbeat = config.heartbeat_interval();
        let protocols = config.protocol_handler.clone();
        let config = Arc::new(config);

        let registry = Arc::new(ConnectionRegistry::new());
        let metrics = Arc::new(EngineMetrics::new());
        let shutdown = CancellationToken::new();
        let gate = Arc::new(RwLock::new(()));

        let dispatcher = Dispatcher::new(config, registry.clone(), metrics.clone());
        let mut tasks = vec![tokio::spawn(accept_loop(
            transport,
            dispatcher,
            protocols,
            shutdown.clone(),
            gate.clone(),
        ))];

        if let Some(interval) = heartbeat {
            tasks.push(tokio::spawn(run_heartbeat(
                registry.clone(),
                metrics.clone(),
                interval,
                shutdown.clone(),
            )));
        }

        info!(
            heartbeat_ms = heartbeat.map(|interval| interval.as_millis() as u64),
            "WebSocket server started"
        );

        Self {
            inner: Arc::new(Inner {
                broadcaster: Broadcaster::new(registry.clone(), metrics.clone()),
                registry,
                metrics,
                shutdown,
                gate,
                tasks: Mutex::new(tasks),
                heartbeat,
            }),
        }
    }

    /// Send `payload` to every open connection except `exclude`.
    /// Returns the number of recipients.
    pub fn broadcast(
        &self,
        payload: impl Into<Payload>,
        exclude: Option<&Arc<Connection>>,
    ) -> usize {
        self.inner.broadcaster.broadcast(payload, exclude)
    }

    /// JSON-encode `value` and broadcast it.
    pub fn broadcast_json<T: Serialize + ?Sized>(
        &self,
        value: &T,
        exclude: Option<&Arc<Connection>>,
    ) -> HubResult<usize> {
        self.inner.broadcaster.broadcast_json(value, exclude)
    }

    /// Send `payload` to one connection.
    pub fn send(&self, connection: &Connection, payload: impl Into<Payload>) {
        self.inner.broadcaster.send(connection, payload);
    }

    /// JSON-encode `value` and send it to one connection.
    pub fn send_json<T: Serialize + ?Sized>(
        &self,
        connection: &Connection,
        value: &T,
    ) -> HubResult<()> {
        self.inner.broadcaster.send_json(connection, value)
    }

    /// Every registered connection.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner.registry.snapshot()
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Look up a connection by ID.
    pub fn get(&self, conn_id: &ConnectionId) -> Option<Arc<Connection>> {
        self.inner.registry.get(conn_id)
    }

    /// Snapshot of this server's counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stop accepting, stop the heartbeat, then close every remaining
    /// connection with 1001.
    ///
    /// Returns once the registry is empty. Connections that do not finish
    /// their closing handshake in time are terminated. Safe to call more
    /// than once.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let tasks = std::mem::take(&mut *self.inner.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Server task ended abnormally");
            }
        }

        // Waits out any registration in progress; later ones see the token.
        drop(self.inner.gate.write().await);

        let registry = &self.inner.registry;
        let remaining = registry.snapshot();
        if !remaining.is_empty() {
            info!(count = remaining.len(), "Closing remaining connections");
        }
        for connection in &remaining {
            connection.close(GOING_AWAY, SHUTDOWN_REASON);
        }

        if time::timeout(DRAIN_TIMEOUT, registry.drained()).await.is_err() {
            warn!(
                remaining = registry.len(),
                "Connections did not finish closing, terminating"
            );
            for connection in registry.snapshot() {
                connection.terminate();
            }
            let _ = time::timeout(TERMINATE_TIMEOUT, registry.drained()).await;
        }

        info!("WebSocket server shut down");
    }
}

async fn accept_loop(
    transport: Arc<dyn Transport>,
    dispatcher: Dispatcher,
    protocols: Option<ProtocolHandler>,
    shutdown: CancellationToken,
    gate: Arc<RwLock<()>>,
) {
    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = transport.accept(protocols.clone()) => accepted,
        };

        match accepted {
            Ok(pending) => {
                tokio::spawn(complete_handshake(
                    pending,
                    dispatcher.clone(),
                    shutdown.clone(),
                    gate.clone(),
                ));
            }
            Err(TransportError::Closed) => {
                info!("Transport closed, no longer accepting connections");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Failed to accept connection");
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
        }
    }

    debug!("Accept loop ended");
}

async fn complete_handshake(
    pending: PendingSocket,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
    gate: Arc<RwLock<()>>,
) {
    let accepted = match pending.await {
        Ok(accepted) => accepted,
        Err(e) => {
            warn!(error = %e, "WebSocket handshake failed");
            return;
        }
    };

    let _registering = gate.read().await;
    if shutdown.is_cancelled() {
        debug!(
            remote_addr = ?accepted.metadata.remote_addr,
            "Handshake finished after shutdown, closing"
        );
        accepted.socket.close(GOING_AWAY, SHUTDOWN_REASON);
        return;
    }

    dispatcher.attach(accepted);
}
