// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gaiandb.org

//! Peer registry: what this node knows about its discovery negotiations.
//!
//! The registry is shared between the discovery loop and the maintenance
//! scheduler behind a single mutex. Compound updates (the ACK tie-break,
//! establishing a connection, dropping policy violators) take the lock once
//! and finish before releasing it.

use crate::codec::NodeId;
use crate::policy::ClusterSet;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Registry handle shared across tasks.
pub type SharedRegistry = Arc<Mutex<PeerRegistry>>;

/// Proof that we granted a handshake to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckRecord {
    pub granted_at: Instant,
    pub sender_ip: IpAddr,
}

impl AckRecord {
    /// Check if the grant is older than the heartbeat.
    pub fn is_expired(&self, heartbeat: Duration) -> bool {
        self.granted_at.elapsed() > heartbeat
    }
}

/// Result of comparing a new cluster set with the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClusterTransition {
    /// Any change revokes every granted ACK.
    pub changed: bool,
    /// Memberships were removed, or we went from none to some. Every
    /// discovered connection must go as well.
    pub drop_connections: bool,
}

/// Discovery negotiation state.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    /// Peers for which we maintain the two-way connection.
    outbound: BTreeSet<NodeId>,

    /// ACKs granted and not yet expired.
    acknowledgments: HashMap<NodeId, AckRecord>,

    /// Peers dropped after a cluster membership change.
    dropped: HashSet<NodeId>,

    /// Senders of gateway REQs, to forward later gateway REQs to.
    unicast_discovered: BTreeSet<IpAddr>,

    /// Cluster set seen by the last maintenance pass.
    previous_clusters: ClusterSet,
}

impl PeerRegistry {
    /// Create an empty registry starting from the given cluster membership.
    pub fn new(initial_clusters: ClusterSet) -> Self {
        Self {
            previous_clusters: initial_clusters,
            ..Default::default()
        }
    }

    pub fn shared(initial_clusters: ClusterSet) -> SharedRegistry {
        Arc::new(Mutex::new(Self::new(initial_clusters)))
    }

    // ---- outbound ----

    pub fn is_outbound(&self, node: &str) -> bool {
        self.outbound.contains(node)
    }

    pub fn add_outbound(&mut self, node: &str) {
        self.outbound.insert(node.to_string());
    }

    pub fn remove_outbound(&mut self, node: &str) -> bool {
        self.outbound.remove(node)
    }

    pub fn outbound_count(&self) -> usize {
        self.outbound.len()
    }

    pub fn outbound(&self) -> impl Iterator<Item = &str> {
        self.outbound.iter().map(String::as_str)
    }

    // ---- acknowledgments ----

    /// Record (or refresh) an ACK granted to `node` now.
    pub fn grant_ack(&mut self, node: &str, sender_ip: IpAddr) {
        self.grant_ack_at(node, sender_ip, Instant::now());
    }

    pub fn grant_ack_at(&mut self, node: &str, sender_ip: IpAddr, granted_at: Instant) {
        self.acknowledgments.insert(
            node.to_string(),
            AckRecord {
                granted_at,
                sender_ip,
            },
        );
    }

    pub fn acknowledgment(&self, node: &str) -> Option<&AckRecord> {
        self.acknowledgments.get(node)
    }

    pub fn revoke_ack(&mut self, node: &str) -> bool {
        self.acknowledgments.remove(node).is_some()
    }

    /// Revoke every granted ACK. Returns how many were revoked.
    pub fn revoke_all_acks(&mut self) -> usize {
        let count = self.acknowledgments.len();
        self.acknowledgments.clear();
        count
    }

    /// Remove ACKs older than `heartbeat`, returning the affected nodes.
    pub fn remove_expired_acks(&mut self, heartbeat: Duration) -> Vec<NodeId> {
        let expired: Vec<NodeId> = self
            .acknowledgments
            .iter()
            .filter(|(_, record)| record.is_expired(heartbeat))
            .map(|(node, _)| node.clone())
            .collect();

        for node in &expired {
            self.acknowledgments.remove(node);
        }
        expired
    }

    pub fn ack_count(&self) -> usize {
        self.acknowledgments.len()
    }

    pub fn acknowledged_nodes(&self) -> impl Iterator<Item = &str> {
        self.acknowledgments.keys().map(String::as_str)
    }

    // ---- policy-dropped ----

    pub fn mark_dropped(&mut self, node: &str) {
        self.dropped.insert(node.to_string());
    }

    pub fn clear_dropped(&mut self, node: &str) -> bool {
        self.dropped.remove(node)
    }

    pub fn is_dropped(&self, node: &str) -> bool {
        self.dropped.contains(node)
    }

    // ---- gateway relay ----

    /// Remember a node that reached us via a gateway REQ. Returns `true` if new.
    pub fn note_unicast_discovery(&mut self, ip: IpAddr) -> bool {
        self.unicast_discovered.insert(ip)
    }

    pub fn unicast_discovered(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.unicast_discovered.iter().copied()
    }

    // ---- clusters ----

    /// Record the current cluster membership and report how it changed.
    pub fn cluster_transition(&mut self, current: &ClusterSet) -> ClusterTransition {
        if &self.previous_clusters == current {
            return ClusterTransition::default();
        }

        let gained_first = self.previous_clusters.is_empty() && !current.is_empty();
        let lost_some = self.previous_clusters.difference(current).next().is_some();
        self.previous_clusters = current.clone();

        ClusterTransition {
            changed: true,
            drop_connections: gained_first || lost_some,
        }
    }

    /// Forget in-flight negotiations before sockets are reopened.
    ///
    /// Policy-dropped peers and the last seen cluster set outlive a restart:
    /// a dropped peer is only readmitted by a REQ sharing a cluster.
    pub fn reset_negotiations(&mut self) {
        self.outbound.clear();
        self.acknowledgments.clear();
        self.unicast_discovered.clear();
    }
}
