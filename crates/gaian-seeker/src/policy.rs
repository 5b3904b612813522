// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gaiandb.org

//! Access control: permitted/denied hosts and cluster membership.

use crate::codec::split_commas;
use std::collections::{BTreeSet, HashSet};

/// Host part of a node id: everything before the last `:`.
pub fn host_of(node_id: &str) -> &str {
    match node_id.rfind(':') {
        Some(idx) => &node_id[..idx],
        None => node_id,
    }
}

/// Port suffix of a node id, if any.
pub fn port_of(node_id: &str) -> Option<&str> {
    node_id.rfind(':').map(|idx| &node_id[idx + 1..])
}

/// Cluster-ID set parsed from `ACCESS_CLUSTERS`.
pub type ClusterSet = BTreeSet<String>;

/// Parse a comma separated cluster list.
pub fn parse_clusters(value: Option<&str>) -> ClusterSet {
    value
        .map(|v| split_commas(v).map(str::to_string).collect())
        .unwrap_or_default()
}

/// Outcome of matching a peer's advertised clusters against ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterMatch {
    /// Neither side restricts membership.
    Unrestricted,
    /// At least one shared cluster.
    Shared,
    /// We are restricted and the peer advertised nothing.
    PeerAdvertisedNone,
    /// Both advertised clusters but none overlap.
    Disjoint,
}

/// Compare cluster memberships without revealing the IDs themselves.
pub fn match_clusters(ours: &ClusterSet, theirs: &ClusterSet) -> ClusterMatch {
    if ours.is_empty() && theirs.is_empty() {
        return ClusterMatch::Unrestricted;
    }
    if theirs.is_empty() {
        return ClusterMatch::PeerAdvertisedNone;
    }
    if ours.intersection(theirs).next().is_some() {
        ClusterMatch::Shared
    } else {
        ClusterMatch::Disjoint
    }
}

/// Snapshot of the host restrictions in force.
///
/// Host names are compared case-insensitively. `None` means "no list
/// configured", which is different from an empty list: an empty permitted
/// list admits nobody.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessPolicy {
    permitted: Option<HashSet<String>>,
    denied: Option<HashSet<String>>,
    clusters: ClusterSet,
}

impl AccessPolicy {
    pub fn new(
        permitted: Option<&[String]>,
        denied: Option<&[String]>,
        clusters: ClusterSet,
    ) -> Self {
        Self {
            permitted: permitted.map(upper_set),
            denied: denied.map(upper_set),
            clusters,
        }
    }

    pub fn clusters(&self) -> &ClusterSet {
        &self.clusters
    }

    pub fn has_host_restrictions(&self) -> bool {
        self.permitted.is_some() || self.denied.is_some()
    }

    /// Check the permitted/denied host lists for the host of `node_id`.
    pub fn permits_host(&self, node_id: &str) -> bool {
        let host = host_of(node_id).to_uppercase();
        if let Some(denied) = &self.denied {
            if denied.contains(&host) {
                return false;
            }
        }
        if let Some(permitted) = &self.permitted {
            if !permitted.contains(&host) {
                return false;
            }
        }
        true
    }

    pub fn match_clusters(&self, theirs: &ClusterSet) -> ClusterMatch {
        match_clusters(&self.clusters, theirs)
    }
}

fn upper_set(hosts: &[String]) -> HashSet<String> {
    hosts
        .iter()
        .map(|h| h.trim().to_uppercase())
        .filter(|h| !h.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_host_and_port() {
        assert_eq!(host_of("node1:6415"), "node1");
        assert_eq!(host_of("node1"), "node1");
        assert_eq!(port_of("node1:6415"), Some("6415"));
        assert_eq!(port_of("node1"), None);
    }

    #[test]
    fn test_denied_host_case_insensitive() {
        let denied = hosts(&["b"]);
        let policy = AccessPolicy::new(None, Some(&denied), ClusterSet::new());
        assert!(!policy.permits_host("B:6414"));
        assert!(!policy.permits_host("b"));
        assert!(policy.permits_host("a:6414"));
    }

    #[test]
    fn test_permitted_list() {
        let permitted = hosts(&["alpha", "beta"]);
        let policy = AccessPolicy::new(Some(&permitted), None, ClusterSet::new());
        assert!(policy.permits_host("ALPHA:1"));
        assert!(!policy.permits_host("gamma"));

        let empty: Vec<String> = Vec::new();
        let nobody = AccessPolicy::new(Some(&empty), None, ClusterSet::new());
        assert!(!nobody.permits_host("alpha"));
    }

    #[test]
    fn test_cluster_matching() {
        let none = ClusterSet::new();
        let x = parse_clusters(Some("X"));
        let xy = parse_clusters(Some("X, Y"));
        let z = parse_clusters(Some("Z"));

        assert_eq!(match_clusters(&none, &none), ClusterMatch::Unrestricted);
        assert_eq!(match_clusters(&x, &none), ClusterMatch::PeerAdvertisedNone);
        assert_eq!(match_clusters(&x, &xy), ClusterMatch::Shared);
        assert_eq!(match_clusters(&xy, &z), ClusterMatch::Disjoint);
        // An unrestricted node still refuses a restricted requester it shares nothing with.
        assert_eq!(match_clusters(&none, &z), ClusterMatch::Disjoint);
    }
}
