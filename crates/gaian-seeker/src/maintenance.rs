// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gaiandb.org

//! Connection maintenance.
//!
//! Runs on the heartbeat cadence, independently of discovery polling:
//! 1. cluster membership change: revoke every granted ACK; if memberships were
//!    removed (or set for the first time) drop every discovered connection and
//!    mark its peer as policy-dropped
//! 2. drop connections whose host is now denied or no longer permitted
//! 3. evict ACKs older than the heartbeat

use crate::codec::NodeId;
use crate::config::{ConfigProvider, SeekerConfig};
use crate::connections::{ConnectionId, PeerConnections};
use crate::registry::{PeerRegistry, SharedRegistry};
use crate::CONNECTION_LOG_TARGET;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// One-line view of the discovered connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub maintained: Vec<NodeId>,
    pub seeking: usize,
    pub accepted: Vec<NodeId>,
}

impl ConnectionSummary {
    pub fn capture(
        registry: &PeerRegistry,
        connections: &dyn PeerConnections,
        config: &SeekerConfig,
    ) -> Self {
        let maintained: Vec<NodeId> = registry.outbound().map(str::to_string).collect();
        let mut accepted: Vec<NodeId> = connections
            .connected_nodes()
            .into_iter()
            .filter(|node| !registry.is_outbound(node))
            .collect();
        accepted.sort();

        Self {
            seeking: config.required_outbound().saturating_sub(maintained.len()),
            maintained,
            accepted,
        }
    }
}

impl fmt::Display for ConnectionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Maintained to [{}] (seeking {}), Accepted from [{}]",
            self.maintained.join(", "),
            self.seeking,
            self.accepted.join(", ")
        )
    }
}

/// Remove connections with the registry lock already held.
///
/// Returns how many were actually removed.
pub fn drop_connections_locked(
    registry: &mut PeerRegistry,
    connections: &dyn PeerConnections,
    ids: &[ConnectionId],
) -> usize {
    let mut removed = 0;
    for id in ids {
        let node = connections.node_id(id).unwrap_or_default();
        if connections.remove_peer_connection(id) {
            removed += 1;
            registry.remove_outbound(&node);
            info!(target: CONNECTION_LOG_TARGET, "REMOVED connection {} to {}", id, node);
        } else {
            info!(
                target: CONNECTION_LOG_TARGET,
                "FAILED TO REMOVE connection {} to {} (already removed)",
                id,
                node
            );
        }
    }
    removed
}

/// What a maintenance pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub acks_revoked: usize,
    pub connections_dropped: usize,
    pub acks_expired: Vec<NodeId>,
}

/// Enforces access policy changes and ACK expiry on existing state.
pub struct MaintenanceScheduler {
    config: Arc<dyn ConfigProvider>,
    registry: SharedRegistry,
    connections: Arc<dyn PeerConnections>,
}

impl MaintenanceScheduler {
    pub fn new(
        config: Arc<dyn ConfigProvider>,
        registry: SharedRegistry,
        connections: Arc<dyn PeerConnections>,
    ) -> Self {
        Self {
            config,
            registry,
            connections,
        }
    }

    /// Run one maintenance pass.
    pub fn run_pass(&self) -> MaintenanceReport {
        let config = self.config.current();
        let policy = config.access_policy();
        let mut registry = self.registry.lock();
        let mut report = MaintenanceReport::default();

        let transition = registry.cluster_transition(policy.clusters());
        if transition.changed {
            info!(
                "Detected update of ACCESS_CLUSTERS (now {} IDs), revoking granted ACKs",
                policy.clusters().len()
            );
            report.acks_revoked = registry.revoke_all_acks();
        }

        let mut unwanted = Vec::new();
        if transition.drop_connections || policy.has_host_restrictions() {
            for id in self.connections.discovered_connections() {
                let Some(node) = self.connections.node_id(&id) else {
                    continue;
                };
                if transition.drop_connections {
                    registry.mark_dropped(&node);
                    unwanted.push(id);
                } else if !policy.permits_host(&node) {
                    unwanted.push(id);
                }
            }
        }

        if !unwanted.is_empty() {
            info!("Removing connections: {:?}", unwanted);
            report.connections_dropped =
                drop_connections_locked(&mut registry, self.connections.as_ref(), &unwanted);
            if report.connections_dropped > 0 {
                info!(
                    "{}",
                    ConnectionSummary::capture(&registry, self.connections.as_ref(), &config)
                );
            }
        }

        report.acks_expired = registry.remove_expired_acks(config.heartbeat());
        if !report.acks_expired.is_empty() {
            debug!("Expired ACKs: {:?}", report.acks_expired);
        }

        report
    }

    /// Drop one discovered connection. Returns `false` if it was already gone.
    pub fn drop_connection(&self, id: &str) -> bool {
        let config = self.config.current();
        let mut registry = self.registry.lock();
        let removed =
            drop_connections_locked(&mut registry, self.connections.as_ref(), &[id.to_string()]);
        if removed > 0 {
            info!(
                "{}",
                ConnectionSummary::capture(&registry, self.connections.as_ref(), &config)
            );
        }
        removed > 0
    }

    /// Drop every discovered connection.
    pub fn drop_all_connections(&self) -> usize {
        let mut registry = self.registry.lock();
        let ids = self.connections.discovered_connections();
        drop_connections_locked(&mut registry, self.connections.as_ref(), &ids)
    }

    /// The connection is now maintained by the peer: stop treating it as outbound.
    pub fn reverse_maintenance_direction(&self, id: &str) -> bool {
        let Some(node) = self.connections.node_id(id) else {
            return false;
        };
        let reversed = self.registry.lock().remove_outbound(&node);
        if reversed {
            debug!("Connection {} to {} is now maintained by the peer", id, node);
        }
        reversed
    }

    /// Current connection summary.
    pub fn summary(&self) -> ConnectionSummary {
        let config = self.config.current();
        let registry = self.registry.lock();
        ConnectionSummary::capture(&registry, self.connections.as_ref(), &config)
    }

    /// Run a pass every heartbeat until `shutdown` is notified or `running` clears.
    pub fn spawn(
        self: Arc<Self>,
        running: Arc<AtomicBool>,
        shutdown: Arc<Notify>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                let heartbeat = self.config.current().heartbeat();
                tokio::select! {
                    _ = tokio::time::sleep(heartbeat) => {
                        self.run_pass();
                    }
                    _ = shutdown.notified() => {
                        debug!("Maintenance scheduler shutting down");
                        break;
                    }
                }
            }
        })
    }
}
