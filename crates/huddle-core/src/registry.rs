//! Connection registry.
//!
//! Maps connection ids to live connections; the lookup used to route by
//! address and to resolve index entries during fan-out.

use crate::connection::{Connection, ConnectionId};
use std::collections::HashMap;
use tracing::debug;

/// Connection id to connection.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Connection>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection.
    ///
    /// Returns `false` and leaves the registry untouched if the id is taken.
    pub fn insert(&mut self, connection: Connection) -> bool {
        if self.connections.contains_key(&connection.id) {
            return false;
        }
        debug!(connection = %connection.id, identity = %connection.identity, "Registered connection");
        self.connections.insert(connection.id.clone(), connection);
        true
    }

    /// Remove a connection, returning it.
    pub fn remove(&mut self, connection_id: &str) -> Option<Connection> {
        self.connections.remove(connection_id)
    }

    /// Look up a connection.
    #[must_use]
    pub fn get(&self, connection_id: &str) -> Option<&Connection> {
        self.connections.get(connection_id)
    }

    /// Look up a connection mutably.
    pub fn get_mut(&mut self, connection_id: &str) -> Option<&mut Connection> {
        self.connections.get_mut(connection_id)
    }

    /// Check if a connection is registered.
    #[must_use]
    pub fn contains(&self, connection_id: &str) -> bool {
        self.connections.contains_key(connection_id)
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Iterate over all connections.
    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    /// Drop every connection, closing their outboxes.
    pub fn clear(&mut self) {
        self.connections.clear();
    }
}
