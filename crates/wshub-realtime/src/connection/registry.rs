//! Connection registry: the live set of accepted connections.
//!
//! Entries are inserted when a socket is accepted and removed when its close
//! event is dispatched. Everything else only reads.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Notify;

use super::handle::{Connection, ConnectionId};

/// Thread-safe registry of all live connections of one server.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    /// Connection ID → connection handle.
    by_id: DashMap<ConnectionId, Arc<Connection>>,
    /// Woken on every removal.
    removed: Notify,
}

impl ConnectionRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self {
            by_id: DashMap::new(),
            removed: Notify::new(),
        }
    }

    /// Adds a connection.
    pub(crate) fn add(&self, connection: Arc<Connection>) {
        self.by_id.insert(connection.id, connection);
    }

    /// Removes a connection, returning it if it was present.
    pub(crate) fn remove(&self, conn_id: &ConnectionId) -> Option<Arc<Connection>> {
        let removed = self.by_id.remove(conn_id).map(|(_, connection)| connection);
        if removed.is_some() {
            self.removed.notify_waiters();
        }
        removed
    }

    /// Gets a specific connection by ID.
    pub fn get(&self, conn_id: &ConnectionId) -> Option<Arc<Connection>> {
        self.by_id.get(conn_id).map(|entry| entry.value().clone())
    }

    /// Returns a point-in-time copy of every connection.
    ///
    /// No shard lock is held once this returns, so callers may send, ping
    /// or terminate while iterating.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.by_id
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Returns the number of live connections.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Resolves once the registry is empty.
    pub async fn drained(&self) {
        loop {
            let removed = self.removed.notified();
            if self.is_empty() {
                return;
            }
            removed.await;
        }
    }
}
