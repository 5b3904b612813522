// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gaiandb.org

//! # gaian-seeker - GaianDB node discovery
//!
//! Discovers peer GaianDB nodes over UDP multicast, broadcast or unicast and
//! negotiates which side of each pair maintains the connection.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gaian_seeker::{ConnectionTable, NodeSeeker, SeekerConfig, SharedConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), gaian_seeker::SeekerError> {
//! let config = Arc::new(SharedConfig::new(SeekerConfig {
//!     node_id: "db1:6414".into(),
//!     min_discovered_connections: 2,
//!     ..Default::default()
//! }));
//! let seeker = Arc::new(NodeSeeker::new(config, Arc::new(ConnectionTable::new()))?);
//! let handle = seeker.handle();
//! let task = seeker.spawn();
//! // ...
//! handle.shutdown();
//! # let _ = task.await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Protocol
//!
//! ```text
//! node A                                    node B
//!   | REQ A <dest> ARGS...   (multicast)     |
//!   |--------------------------------------->|  policy, quota, tie-break
//!   |   ACK A B <user> <pwd> <version> ...   |  (delayed per strategy)
//!   |<---------------------------------------|  ACK granted for B -> A
//!   | connect to B, B.maintain_connection(A) |
//!   |=======================================>|  ACK kept until expiry
//! ```
//!
//! ## Modules Overview
//!
//! - [`codec`] - REQ/ACK wire format and gateway envelopes
//! - [`negotiation`] - routing, REQ/ACK handling and inbound validation
//! - [`seeker`] - discovery loop and lifecycle
//! - [`maintenance`] - periodic revocation and connection drops
//! - [`transport`] - discovery sockets and multicast membership

pub mod codec;
pub mod config;
pub mod connections;
pub mod interfaces;
pub mod maintenance;
pub mod negotiation;
pub mod policy;
pub mod registry;
pub mod seeker;
pub mod targets;
pub mod transport;

/// Tracing target for connection lifecycle events (established, removed).
pub const CONNECTION_LOG_TARGET: &str = "gaian_seeker::connections";

pub use codec::{Acknowledgment, DiscoveryMessage, MessageArgs, NodeId, Request};
pub use config::{ConfigError, ConfigProvider, SeekerConfig, SharedConfig};
pub use connections::{ConnectionId, ConnectionTable, PeerConnections};
pub use maintenance::{ConnectionSummary, MaintenanceScheduler};
pub use negotiation::{ConnectionStrategy, Negotiator, Rejection};
pub use policy::{AccessPolicy, ClusterMatch};
pub use registry::{PeerRegistry, SharedRegistry};
pub use seeker::{NodeSeeker, SeekerError, SeekerHandle};

#[cfg(test)]
mod tests {
    use std::path::Path;

    #[test]
    fn test_source_files_carry_license_header() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR"));
        let mut checked = 0;
        for dir in ["src", "tests"] {
            for entry in std::fs::read_dir(root.join(dir)).unwrap() {
                let path = entry.unwrap().path();
                if path.extension().map_or(true, |e| e != "rs") {
                    continue;
                }
                let text = std::fs::read_to_string(&path).unwrap();
                let mut lines = text.lines();
                assert_eq!(
                    lines.next(),
                    Some("// SPDX-License-Identifier: Apache-2.0 OR MIT"),
                    "{}",
                    path.display()
                );
                assert_eq!(
                    lines.next(),
                    Some("// Copyright (c) 2025-2026 gaiandb.org"),
                    "{}",
                    path.display()
                );
                checked += 1;
            }
        }
        assert!(checked > 10);
    }
}
