use std::collections::HashMap;

use log::info;
use parking_lot::RwLock;

use crate::{BrokerError, SharedConnection};

/// Name → current connection. The single source of truth for which instance
/// serves a connection name; entries are replaced, never mutated in place.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, SharedConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest instance registered under `name`. Callers should fetch again
    /// after any await point rather than holding on to the handle.
    pub fn get(&self, name: &str) -> Result<SharedConnection, BrokerError> {
        self.connections
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::NotConfigured(name.to_string()))
    }

    /// Install `connection` under `name`, returning whatever it replaced.
    pub fn put(&self, name: impl Into<String>, connection: SharedConnection) -> Option<SharedConnection> {
        self.connections.write().insert(name.into(), connection)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.connections.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connections.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn snapshot(&self) -> Vec<SharedConnection> {
        self.connections.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Stop and forget every connection. Returns how many were stopped.
    pub async fn remove_all(&self) -> usize {
        let drained: Vec<(String, SharedConnection)> = self.connections.write().drain().collect();
        let count = drained.len();
        for (name, connection) in drained {
            connection.stop().await;
            info!("Closed broker connection '{}'", name);
        }
        count
    }
}
