//! Fan-out and single-target sends over the connection registry.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use wshub_core::HubResult;

use crate::connection::{Connection, ConnectionRegistry};
use crate::metrics::EngineMetrics;
use crate::transport::Payload;

/// Sends payloads to registered connections.
///
/// Per-recipient failures go to that connection's error handler and never
/// abort a fan-out.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<EngineMetrics>,
}

impl Broadcaster {
    /// Creates a broadcaster over the given registry.
    pub fn new(registry: Arc<ConnectionRegistry>, metrics: Arc<EngineMetrics>) -> Self {
        Self { registry, metrics }
    }

    /// Send `payload` to every open connection except `exclude`.
    ///
    /// Returns the number of recipients a send was attempted on.
    pub fn broadcast(
        &self,
        payload: impl Into<Payload>,
        exclude: Option<&Arc<Connection>>,
    ) -> usize {
        let payload = payload.into();
        let mut attempted = 0;
        let mut delivered = 0u64;

        for connection in self.registry.snapshot() {
            if exclude.is_some_and(|excluded| Arc::ptr_eq(excluded, &connection)) {
                continue;
            }
            if !connection.is_open() {
                continue;
            }
            attempted += 1;
            if connection.send(payload.clone()) {
                delivered += 1;
            }
        }

        self.metrics.broadcast();
        self.metrics.message_sent_count(delivered);
        debug!(
            recipients = attempted,
            delivered,
            bytes = payload.len(),
            "Broadcast sent"
        );
        attempted
    }

    /// Serialize `value` as JSON and broadcast it.
    pub fn broadcast_json<T: Serialize + ?Sized>(
        &self,
        value: &T,
        exclude: Option<&Arc<Connection>>,
    ) -> HubResult<usize> {
        let text = serde_json::to_string(value)?;
        Ok(self.broadcast(text, exclude))
    }

    /// Send `payload` to one connection.
    pub fn send(&self, connection: &Connection, payload: impl Into<Payload>) {
        if connection.send(payload) {
            self.metrics.message_sent_count(1);
        }
    }

    /// Serialize `value` as JSON and send it to one connection.
    pub fn send_json<T: Serialize + ?Sized>(
        &self,
        connection: &Connection,
        value: &T,
    ) -> HubResult<()> {
        let text = serde_json::to_string(value)?;
        self.send(connection, text);
        Ok(())
    }
}
