// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Device Registry
//!
//! Maps device MAC addresses to their live connections. At most one
//! connection per MAC: admitting a new one evicts and closes the previous
//! holder under the same write lock, so concurrent CONNECT storms for one
//! MAC always leave exactly one registered connection.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::connection::Connection;

pub struct DeviceRegistry {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        DeviceRegistry {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a connection under its MAC, returning the evicted previous
    /// holder (already asked to close) if there was one.
    pub fn insert(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let evicted = {
            let mut connections = self.connections.write().unwrap();
            connections.insert(conn.mac().to_string(), conn)
        };
        if let Some(ref old) = evicted {
            old.begin_close();
        }
        evicted
    }

    /// Removes a connection, but only if it is still the registered holder
    /// of its MAC. A stale remove from an evicted connection is a no-op.
    pub fn remove(&self, conn: &Arc<Connection>) {
        let mut connections = self.connections.write().unwrap();
        if let Some(current) = connections.get(conn.mac()) {
            if Arc::ptr_eq(current, conn) {
                connections.remove(conn.mac());
            }
        }
    }

    pub fn get(&self, mac: &str) -> Option<Arc<Connection>> {
        let connections = self.connections.read().unwrap();
        connections.get(mac).cloned()
    }

    /// Point-in-time snapshot of all registered connections, for the
    /// sweeper and admin queries.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        let connections = self.connections.read().unwrap();
        connections.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let connections = self.connections.read().unwrap();
        connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
