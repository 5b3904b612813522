// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gaiandb.org

//! GaianDB Node Seeker
//!
//! Runs peer discovery for one node, recording negotiated connections in an
//! in-memory table:
//! - multicast on the default group `230.255.255.255:7777`
//! - broadcast on every interface (`--discovery-ip BROADCAST_ALL`)
//! - unicast gateways into other segments (`--gateway <host>`)
//!
//! # Usage
//!
//! ```bash
//! # Seek two outbound connections on the default group
//! gaian-seeker --node-id db1:6414 --min 2
//!
//! # Restrict to one cluster, and deny a host
//! gaian-seeker --node-id db1 --min 2 --cluster finance --deny db9
//!
//! # Full configuration from file (TOML, or JSON by extension)
//! gaian-seeker --config seeker.toml
//! ```

use clap::Parser;
use gaian_seeker::{
    ConnectionTable, NodeSeeker, SeekerConfig, SharedConfig, CONNECTION_LOG_TARGET,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// GaianDB Node Seeker - discovers peer nodes and negotiates connections
#[derive(Parser, Debug)]
#[command(name = "gaian-seeker")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML, or JSON with a .json extension)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// This node's id, <host>[:<port>]
    #[arg(short, long)]
    node_id: Option<String>,

    /// Scrambled password advertised to peers in ACKs
    #[arg(long)]
    password: Option<String>,

    /// Multicast group, broadcast address, comma list, or BROADCAST_ALL.
    /// An empty value disables discovery.
    #[arg(long)]
    discovery_ip: Option<String>,

    /// UDP discovery port
    #[arg(short = 'p', long, default_value = "7777")]
    discovery_port: u16,

    /// ALL, or comma separated local interface addresses
    #[arg(long)]
    multicast_interfaces: Option<String>,

    /// Outbound connections to seek (negative disables replies)
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    min: i32,

    /// Maximum discovered connections (inbound + outbound)
    #[arg(long, default_value = "10")]
    max: usize,

    /// Cluster id this node belongs to (repeatable)
    #[arg(long = "cluster")]
    clusters: Vec<String>,

    /// Host allowed to connect (repeatable; unset admits all)
    #[arg(long = "permit")]
    permitted: Vec<String>,

    /// Host never allowed to connect (repeatable)
    #[arg(long = "deny")]
    denied: Vec<String>,

    /// Node in another segment to send unicast REQs to (repeatable)
    #[arg(long = "gateway")]
    gateways: Vec<String>,

    /// Strategy requested from peers (RANDOM, USER_DB:<node>, or preferential)
    #[arg(long)]
    strategy: Option<String>,

    /// ACK validity and maintenance period in milliseconds
    #[arg(long, default_value = "5000")]
    heartbeat_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> SeekerConfig {
        let defaults = SeekerConfig::default();
        SeekerConfig {
            node_id: self.node_id.unwrap_or(defaults.node_id),
            node_password_scrambled: self.password.unwrap_or(defaults.node_password_scrambled),
            discovery_ip: self.discovery_ip,
            discovery_port: self.discovery_port,
            multicast_interfaces: self.multicast_interfaces,
            access_clusters: self.clusters,
            access_hosts_permitted: (!self.permitted.is_empty()).then_some(self.permitted),
            access_hosts_denied: (!self.denied.is_empty()).then_some(self.denied),
            discovery_gateways: self.gateways,
            connection_strategy: self.strategy,
            min_discovered_connections: self.min,
            max_discovered_connections: self.max,
            gaian_connections_checker_heartbeat_ms: self.heartbeat_ms,
            ..defaults
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging; connection events stay visible at any level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{},{}=info",
            args.log_level, CONNECTION_LOG_TARGET
        ))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let config = match args.config.clone() {
        Some(path) => {
            info!("Loading config from {:?}", path);
            SeekerConfig::from_file(path)?
        }
        None => args.into_config(),
    };
    config.validate()?;

    info!("+----------------------------------------------------+");
    info!(
        "|       GaianDB Node Seeker v{}                |",
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    info!("|  Node:     {:38} |", config.node_id);
    info!(
        "|  Targets:  {:38} |",
        if config.is_discovery_enabled() {
            format!("{}:{}", config.discovery_ip_or_default(), config.discovery_port)
        } else {
            "disabled".to_string()
        }
    );
    info!(
        "|  Seeking:  {:38} |",
        format!(
            "{} of max {}",
            config.min_discovered_connections, config.max_discovered_connections
        )
    );
    info!(
        "|  Clusters: {:38} |",
        if config.access_clusters.is_empty() {
            "none".to_string()
        } else {
            config.access_clusters.join(",")
        }
    );
    info!("+----------------------------------------------------+");

    let shared = Arc::new(SharedConfig::new(config));
    let connections = Arc::new(ConnectionTable::new());
    let seeker = Arc::new(NodeSeeker::new(shared, connections)?);

    // Handle shutdown signals
    let handle = seeker.handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received, stopping node seeker...");
        handle.shutdown();
    });

    seeker.run().await?;

    info!("{}", seeker.maintenance().summary());
    Ok(())
}
