// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gaiandb.org

//! Logical peer connections.
//!
//! The seeker negotiates connections but never opens one itself: it asks a
//! [`PeerConnections`] implementation, which owns the authoritative list of
//! live discovered connections. Inside a full node this is the embedded query
//! engine; the standalone binary and the tests use [`ConnectionTable`].

use crate::codec::NodeId;
use crate::config::DEFAULT_NODE_PORT;
use crate::policy::port_of;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Identifier of a logical connection, assigned by the establisher.
pub type ConnectionId = String;

/// Database name prefix of every GaianDB node.
pub const GAIANDB_NAME: &str = "gaiandb";

/// Connection establisher and registry of live discovered connections.
pub trait PeerConnections: Send + Sync {
    /// Open a logical connection to `node` at `ip`.
    ///
    /// Returns `None` when the connection could not be created, including
    /// when one to the same node already exists.
    fn add_peer_connection(
        &self,
        node: &str,
        ssl_mode: Option<&str>,
        ip: IpAddr,
        user: &str,
        scrambled_password: &str,
    ) -> Option<ConnectionId>;

    /// Tear a connection down. Returns `false` if it was already gone.
    fn remove_peer_connection(&self, id: &str) -> bool;

    /// Ids of every live discovered connection.
    fn discovered_connections(&self) -> Vec<ConnectionId>;

    /// Node at the other end of a connection.
    fn node_id(&self, id: &str) -> Option<NodeId>;

    /// Connection to `node`, if one exists.
    fn connection_for(&self, node: &str) -> Option<ConnectionId> {
        self.discovered_connections()
            .into_iter()
            .find(|id| self.node_id(id).as_deref() == Some(node))
    }

    /// Nodes at the other end of every live connection.
    fn connected_nodes(&self) -> Vec<NodeId> {
        self.discovered_connections()
            .iter()
            .filter_map(|id| self.node_id(id))
            .collect()
    }
}

/// Derby network URL for a discovered node.
///
/// A node id without a port suffix listens on the default port and serves the
/// plain `gaiandb` database; otherwise the port is appended to both.
pub fn connection_url(node: &str, ip: IpAddr, ssl_mode: Option<&str>) -> String {
    let (port, db) = match port_of(node) {
        Some(port) => (port.to_string(), format!("{}{}", GAIANDB_NAME, port)),
        None => (DEFAULT_NODE_PORT.to_string(), GAIANDB_NAME.to_string()),
    };
    let ssl = ssl_mode.map(|m| format!(";ssl={}", m)).unwrap_or_default();
    format!("jdbc:derby://{}:{}/{}{};create=true", ip, port, db, ssl)
}

/// A connection recorded in a [`ConnectionTable`].
#[derive(Debug, Clone)]
pub struct PeerLink {
    pub node: NodeId,
    pub url: String,
    pub user: String,
    pub established_at: Instant,
}

/// In-memory [`PeerConnections`].
#[derive(Debug, Default)]
pub struct ConnectionTable {
    links: Mutex<BTreeMap<ConnectionId, PeerLink>>,
    next_id: AtomicU64,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.links.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.lock().is_empty()
    }

    pub fn link(&self, id: &str) -> Option<PeerLink> {
        self.links.lock().get(id).cloned()
    }
}

impl PeerConnections for ConnectionTable {
    fn add_peer_connection(
        &self,
        node: &str,
        ssl_mode: Option<&str>,
        ip: IpAddr,
        user: &str,
        _scrambled_password: &str,
    ) -> Option<ConnectionId> {
        let mut links = self.links.lock();
        if links.values().any(|l| l.node == node) {
            return None;
        }

        let id = format!("C{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        links.insert(
            id.clone(),
            PeerLink {
                node: node.to_string(),
                url: connection_url(node, ip, ssl_mode),
                user: user.to_string(),
                established_at: Instant::now(),
            },
        );
        Some(id)
    }

    fn remove_peer_connection(&self, id: &str) -> bool {
        self.links.lock().remove(id).is_some()
    }

    fn discovered_connections(&self) -> Vec<ConnectionId> {
        self.links.lock().keys().cloned().collect()
    }

    fn node_id(&self, id: &str) -> Option<NodeId> {
        self.links.lock().get(id).map(|l| l.node.clone())
    }
}
