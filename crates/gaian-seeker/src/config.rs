// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gaiandb.org

//! Node seeker configuration.
//!
//! Settings can be given programmatically, loaded from a TOML file, or from a
//! JSON file (selected by the `.json` extension). Property names on disk match
//! the GaianDB properties file keys:
//!
//! ```toml
//! NODE_ID = "alpha:6415"
//! DISCOVERY_IP = "230.255.255.255"
//! DISCOVERY_PORT = 7777
//! MIN_DISCOVERED_CONNECTIONS = 2
//! MAX_DISCOVERED_CONNECTIONS = 10
//! ACCESS_CLUSTERS = ["lab"]
//! ACCESS_HOSTS_DENIED = ["badhost"]
//! ```

use crate::policy::{parse_clusters, AccessPolicy, ClusterSet};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Multicast group used by every GaianDB node unless told otherwise.
pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(230, 255, 255, 255);

/// `DISCOVERY_IP` value that selects every local broadcast address.
pub const BROADCAST_ALL: &str = "BROADCAST_ALL";

/// `MULTICAST_INTERFACES` value that selects every local IPv4 address.
pub const ALL_INTERFACES: &str = "ALL";

/// Default SQL listener port. Node ids omit the port when it is the default.
pub const DEFAULT_NODE_PORT: u16 = 6414;

/// Version advertised in ACKs.
pub const PROTOCOL_VERSION: &str = "2.1.8";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Node seeker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SeekerConfig {
    /// This node's id, `<host>[:<port>]`.
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// User advertised to peers for connecting back to us.
    #[serde(default = "default_user")]
    pub node_user: String,

    /// Password as already scrambled by the security layer.
    #[serde(default = "default_password")]
    pub node_password_scrambled: String,

    /// SSL mode advertised in ACKs (`basic`, `peerAuthentication`, ...).
    #[serde(default)]
    pub ssl_mode: Option<String>,

    /// Multicast group, broadcast IP, comma separated list, or
    /// `BROADCAST_ALL`. Unset means the default group; empty disables
    /// discovery entirely.
    #[serde(default)]
    pub discovery_ip: Option<String>,

    /// UDP port shared by every node for discovery traffic.
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,

    /// Nodes outside the local segment to send unicast gateway REQs to.
    #[serde(default)]
    pub discovery_gateways: Vec<String>,

    /// `ALL` or a comma separated list of local interface addresses.
    /// Unset means the default interface only.
    #[serde(default)]
    pub multicast_interfaces: Option<String>,

    /// Cluster IDs this node belongs to.
    #[serde(default)]
    pub access_clusters: Vec<String>,

    /// Hosts allowed to connect. Unset admits every host.
    #[serde(default)]
    pub access_hosts_permitted: Option<Vec<String>>,

    /// Hosts never allowed to connect.
    #[serde(default)]
    pub access_hosts_denied: Option<Vec<String>>,

    /// Strategy peers should use when answering our REQs.
    #[serde(default)]
    pub connection_strategy: Option<String>,

    /// Outbound connections to seek. Negative disables discovery replies.
    #[serde(default)]
    pub min_discovered_connections: i32,

    /// Upper bound on discovered connections in both directions.
    #[serde(default = "default_max_discovered")]
    pub max_discovered_connections: usize,

    /// Validity of a granted ACK, and the connection maintenance period.
    #[serde(default = "default_heartbeat_ms")]
    pub gaian_connections_checker_heartbeat_ms: u64,

    /// Period of the watchdog actions (probe, rejoin, maintenance).
    #[serde(default = "default_watchdog_ms")]
    pub watchdog_poll_ms: u64,

    /// Maximum wait on the receive socket per loop iteration.
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_poll_timeout_ms: u64,

    /// IP TTL for discovery datagrams so they can cross routers.
    #[serde(default = "default_ttl")]
    pub discovery_ttl: u32,
}

fn default_node_id() -> String {
    "localhost".to_string()
}

fn default_user() -> String {
    "gaiandb".to_string()
}

fn default_password() -> String {
    "passw0rd".to_string()
}

fn default_discovery_port() -> u16 {
    7777
}

fn default_max_discovered() -> usize {
    10
}

fn default_heartbeat_ms() -> u64 {
    5000
}

fn default_watchdog_ms() -> u64 {
    5000
}

fn default_socket_timeout_ms() -> u64 {
    100
}

fn default_ttl() -> u32 {
    50
}

impl Default for SeekerConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            node_user: default_user(),
            node_password_scrambled: default_password(),
            ssl_mode: None,
            discovery_ip: None,
            discovery_port: default_discovery_port(),
            discovery_gateways: Vec::new(),
            multicast_interfaces: None,
            access_clusters: Vec::new(),
            access_hosts_permitted: None,
            access_hosts_denied: None,
            connection_strategy: None,
            min_discovered_connections: 0,
            max_discovered_connections: default_max_discovered(),
            gaian_connections_checker_heartbeat_ms: default_heartbeat_ms(),
            watchdog_poll_ms: default_watchdog_ms(),
            socket_poll_timeout_ms: default_socket_timeout_ms(),
            discovery_ttl: default_ttl(),
        }
    }
}

impl SeekerConfig {
    /// Load configuration from a TOML file, or JSON when the extension is `.json`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = if path.extension().is_some_and(|e| e == "json") {
            serde_json::from_str(&content)?
        } else {
            toml::from_str(&content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Save configuration as TOML.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.trim().is_empty() || self.node_id.contains(' ') {
            return Err(ConfigError::Invalid(format!(
                "NODE_ID must be a non-empty token without spaces: '{}'",
                self.node_id
            )));
        }
        if self.node_user.is_empty() || self.node_user.contains(' ') {
            return Err(ConfigError::Invalid(
                "NODE_USER must be a non-empty token without spaces".into(),
            ));
        }
        if self.node_password_scrambled.is_empty() || self.node_password_scrambled.contains(' ') {
            return Err(ConfigError::Invalid(
                "NODE_PASSWORD_SCRAMBLED must be a non-empty token without spaces".into(),
            ));
        }
        if self.discovery_port == 0 {
            return Err(ConfigError::Invalid("DISCOVERY_PORT cannot be 0".into()));
        }
        if self.socket_poll_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "SOCKET_POLL_TIMEOUT_MS cannot be 0".into(),
            ));
        }
        if self.watchdog_poll_ms == 0 {
            return Err(ConfigError::Invalid("WATCHDOG_POLL_MS cannot be 0".into()));
        }
        Ok(())
    }

    /// `false` when `DISCOVERY_IP` is explicitly empty.
    pub fn is_discovery_enabled(&self) -> bool {
        self.discovery_ip.as_deref().map_or(true, |ip| !ip.is_empty())
    }

    /// Effective discovery IP property, defaulting to the multicast group.
    pub fn discovery_ip_or_default(&self) -> String {
        match &self.discovery_ip {
            Some(ip) => ip.trim().to_string(),
            None => DEFAULT_MULTICAST_GROUP.to_string(),
        }
    }

    /// Outbound connections required, clamped to `[0, max]`.
    ///
    /// Clamping to the maximum keeps outbound + inbound within
    /// `MAX_DISCOVERED_CONNECTIONS`.
    pub fn required_outbound(&self) -> usize {
        usize::try_from(self.min_discovered_connections)
            .unwrap_or(0)
            .min(self.max_discovered_connections)
    }

    /// Replies to REQs and ACKs are suppressed when the minimum is negative.
    pub fn is_reply_disabled(&self) -> bool {
        self.min_discovered_connections < 0
    }

    pub fn clusters(&self) -> ClusterSet {
        parse_clusters(Some(&self.access_clusters.join(",")))
    }

    /// Access policy snapshot for this configuration.
    pub fn access_policy(&self) -> AccessPolicy {
        AccessPolicy::new(
            self.access_hosts_permitted.as_deref(),
            self.access_hosts_denied.as_deref(),
            self.clusters(),
        )
    }

    /// Node id with any port suffix removed.
    pub fn node_host(&self) -> &str {
        crate::policy::host_of(&self.node_id)
    }

    /// SQL port embedded in the node id, or the default port.
    pub fn node_port(&self) -> String {
        crate::policy::port_of(&self.node_id)
            .map(str::to_string)
            .unwrap_or_else(|| DEFAULT_NODE_PORT.to_string())
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.gaian_connections_checker_heartbeat_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_poll_ms)
    }

    pub fn socket_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_poll_timeout_ms)
    }
}

/// Source of the current configuration.
///
/// The discovery loop asks for a fresh snapshot on every iteration, so an
/// implementation can change settings at any time.
pub trait ConfigProvider: Send + Sync {
    fn current(&self) -> Arc<SeekerConfig>;
}

/// Hot-swappable configuration.
#[derive(Debug)]
pub struct SharedConfig {
    inner: ArcSwap<SeekerConfig>,
}

impl SharedConfig {
    pub fn new(config: SeekerConfig) -> Self {
        Self {
            inner: ArcSwap::from_pointee(config),
        }
    }

    /// Replace the configuration; readers see it on their next snapshot.
    pub fn store(&self, config: SeekerConfig) {
        self.inner.store(Arc::new(config));
    }

    /// Apply an in-place edit to a copy of the current configuration.
    pub fn update(&self, edit: impl Fn(&mut SeekerConfig)) {
        self.inner.rcu(|current| {
            let mut next = SeekerConfig::clone(current);
            edit(&mut next);
            next
        });
    }

    /// Reload from a file, keeping the current configuration on error.
    pub fn reload_from<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let config = SeekerConfig::from_file(path)?;
        self.store(config);
        Ok(())
    }
}

impl ConfigProvider for SharedConfig {
    fn current(&self) -> Arc<SeekerConfig> {
        self.inner.load_full()
    }
}
