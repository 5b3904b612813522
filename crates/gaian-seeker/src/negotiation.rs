// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gaiandb.org

//! Discovery negotiation state machine.
//!
//! A connection between two nodes is set up in three steps:
//!
//! ```text
//!   N                                P
//!   | ---- REQ (multicast) --------> |
//!   | <--- ACK (unicast) ----------- |   P records an acknowledgment for N
//!   | establishes outbound to P      |
//!   | ---- maintain_connection ----> |   P validates against its record and
//!   |                                |   establishes the reciprocal link
//! ```
//!
//! When both nodes acknowledge each other at the same time, the node with the
//! lexicographically greater id maintains the connection.

use crate::codec::{
    self, Acknowledgment, CodecError, DiscoveryMessage, MessageArgs, NodeId, Request,
    ARG_ACCESS_CLUSTERS, ARG_CONNECTION_STRATEGY,
};
use crate::config::{ConfigProvider, SeekerConfig, PROTOCOL_VERSION};
use crate::connections::{ConnectionId, PeerConnections};
use crate::maintenance::{drop_connections_locked, ConnectionSummary};
use crate::policy::{host_of, parse_clusters, port_of, ClusterMatch};
use crate::registry::{PeerRegistry, SharedRegistry};
use crate::targets::LocalAddresses;
use crate::CONNECTION_LOG_TARGET;
use arc_swap::ArcSwap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Upper bound of the attachment delays.
pub const ATTACHMENT_HOLD_TIME: Duration = Duration::from_millis(100);

/// First version whose ACKs honour cluster membership.
pub const CLUSTER_AWARE_VERSION: &str = "1.04";

/// Prefix of an initial maintenance request from a freshly started peer.
pub const INIT_TAG: &str = "INIT";

/// SSL mode tag inside maintenance extra info: `SSL:<mode>,`.
pub const SSL_MODE_TAG: &str = "SSL:";

const STRATEGY_RANDOM: &str = "ATTACHMENT_RANDOM";
const STRATEGY_PREFERENTIAL: &str = "ATTACHMENT_PREFERENTIAL_ON_HIGH_CONNECTIVITY";
const STRATEGY_USER_DB: &str = "ATTACHMENT_TO_USER_DB_NODE";

/// How a node answering our REQ should time its ACK.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionStrategy {
    /// Uniform random delay, spreading clients over the answering nodes.
    Random,
    /// Well connected nodes answer faster.
    #[default]
    PreferentialOnHighConnectivity,
    /// Only the node responsible for this user database answers.
    ToUserDbNode(String),
}

impl ConnectionStrategy {
    /// Parse a strategy selector. Unknown values fall back to preferential attachment.
    pub fn parse(value: Option<&str>) -> Self {
        let Some(value) = value.map(str::trim) else {
            return Self::default();
        };

        if value == STRATEGY_RANDOM || value == "RANDOM" {
            return Self::Random;
        }
        let user_db = value
            .strip_prefix(STRATEGY_USER_DB)
            .and_then(|rest| rest.strip_prefix(':'))
            .or_else(|| value.strip_prefix("USER_DB:"));
        if let Some(db) = user_db {
            return Self::ToUserDbNode(db.to_string());
        }
        Self::PreferentialOnHighConnectivity
    }

    /// Delay before answering a REQ, or `None` when this node must not answer.
    ///
    /// `discovered` is the number of live discovered connections and `seeking`
    /// whether this node still wants outbound connections.
    pub fn reply_delay(&self, my_host: &str, discovered: usize, seeking: bool) -> Option<Duration> {
        match self {
            Self::Random => Some(random_below(ATTACHMENT_HOLD_TIME)),
            Self::ToUserDbNode(db) => db
                .to_uppercase()
                .starts_with(&my_host.to_uppercase())
                .then_some(Duration::ZERO),
            Self::PreferentialOnHighConnectivity if seeking => Some(Duration::ZERO),
            Self::PreferentialOnHighConnectivity => {
                let divisor = u32::try_from(discovered.saturating_add(1)).unwrap_or(u32::MAX);
                Some(random_below(ATTACHMENT_HOLD_TIME / divisor))
            }
        }
    }
}

impl fmt::Display for ConnectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Random => f.write_str(STRATEGY_RANDOM),
            Self::PreferentialOnHighConnectivity => f.write_str(STRATEGY_PREFERENTIAL),
            Self::ToUserDbNode(db) => write!(f, "{}:{}", STRATEGY_USER_DB, db),
        }
    }
}

fn random_below(bound: Duration) -> Duration {
    let millis = u64::try_from(bound.as_millis()).unwrap_or(u64::MAX);
    if millis == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(fastrand::u64(..millis))
}

/// Arguments carried by this node's REQs.
pub fn request_args(config: &SeekerConfig) -> MessageArgs {
    let mut args = MessageArgs::new();
    let clusters = config.clusters();
    if !clusters.is_empty() {
        let joined: Vec<&str> = clusters.iter().map(String::as_str).collect();
        args.push(ARG_ACCESS_CLUSTERS, joined.join(","));
    }
    if let Some(strategy) = &config.connection_strategy {
        args.push(ARG_CONNECTION_STRATEGY, ConnectionStrategy::parse(Some(strategy)).to_string());
    }
    args
}

// ============================================================================
// Routing
// ============================================================================

/// What to do with a received datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Process the message: a REQ from another node or an ACK addressed to us.
    Deliver {
        sender_ip: IpAddr,
        /// Arrived inside a gateway envelope.
        relayed: bool,
        message: DiscoveryMessage,
    },
    /// Gateway request: forward to our discovery targets and to every node
    /// previously seen through a gateway request.
    RelayRequest {
        sender_ip: IpAddr,
        request: Request,
        /// Original message text, forwarded verbatim inside an envelope.
        raw: String,
    },
    /// ACK for another node on this host: re-broadcast once on loopback.
    ForwardAck { target: NodeId, wrapped: String },
    /// Our own REQ, or an ACK for someone else that was already relayed.
    NotForUs,
}

/// Decide how to handle a datagram from `source_ip`.
pub fn route(raw: &str, source_ip: IpAddr, my_id: &str) -> Result<Route, CodecError> {
    let raw = raw.trim();
    let (sender_ip, inner, enveloped) = match codec::unwrap_envelope(raw)? {
        Some((ip, inner)) => (ip, inner, true),
        None => (source_ip, raw, false),
    };

    let message = codec::decode(inner)?;

    if !enveloped {
        match &message {
            DiscoveryMessage::Request(req) if req.destination == sender_ip.to_string() => {
                return Ok(Route::RelayRequest {
                    sender_ip,
                    request: req.clone(),
                    raw: inner.to_string(),
                });
            }
            DiscoveryMessage::Acknowledgment(ack) if ack.target != my_id => {
                return Ok(Route::ForwardAck {
                    target: ack.target.clone(),
                    wrapped: codec::wrap_envelope(sender_ip, inner),
                });
            }
            _ => {}
        }
    }

    let is_request = matches!(message, DiscoveryMessage::Request(_));
    if (message.addressed_node() != my_id) != is_request {
        return Ok(Route::NotForUs);
    }

    Ok(Route::Deliver {
        sender_ip,
        relayed: enveloped,
        message,
    })
}

/// Where the ACK for a delivered REQ goes.
///
/// A direct REQ is answered at its source. A relayed REQ came from the
/// gateway's socket, so the answer goes to the requester's discovery port.
pub fn reply_address(
    sender_ip: IpAddr,
    relayed: bool,
    source: SocketAddr,
    discovery_port: u16,
) -> SocketAddr {
    if relayed {
        SocketAddr::new(sender_ip, discovery_port)
    } else {
        source
    }
}

// ============================================================================
// Decisions
// ============================================================================

/// Why a REQ or ACK was not acted upon. Logged at debug level only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IgnoreReason {
    #[error("discovery replies are disabled (MIN_DISCOVERED_CONNECTIONS < 0)")]
    RepliesDisabled,

    #[error("max number of discovered connections reached: {0}")]
    QuotaReached(usize),

    #[error("REQ carries no cluster ID and ours are restricted")]
    NoClusterId,

    #[error("no local cluster ID matches the {0} in the REQ")]
    ClusterMismatch(usize),

    #[error("host not permitted: {0}")]
    HostNotAllowed(NodeId),

    #[error("node is already maintained outbound: {0}")]
    AlreadyOutbound(NodeId),

    #[error("this node is not responsible for user db: {0}")]
    NotResponsibleForUserDb(String),

    #[error("peer {0} runs a version prior to 1.04 and cannot match cluster IDs")]
    VersionTooOld(NodeId),

    #[error("no outbound connections sought")]
    NotSeeking,

    #[error("yielding to lexicographically greater node {0}")]
    TieBreakYield(NodeId),

    #[error("connection to {0} could not be established")]
    EstablishFailed(NodeId),
}

/// ACK to send in answer to a REQ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub node: NodeId,
    pub delay: Duration,
    pub ack: String,
    /// Effective sender IP and the datagram's source port.
    pub dest: SocketAddr,
    /// We already hold a connection to the requester (its side may have lost it).
    pub already_connected: bool,
}

/// Outcome of a REQ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestDecision {
    Respond(Reply),
    Ignore(IgnoreReason),
}

/// Refusal returned to a peer's maintenance call, sent back verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("Node '{0}' does not meet ACCESS restrictions for cluster membership or permitted/denied hosts")]
    AccessRestricted(NodeId),

    #[error("Connection already established in opposite direction")]
    OppositeDirection,

    #[error("Max number of discovered connections reached: {0}")]
    MaxDiscovered(usize),

    #[error("ACK revoked (connection aborted) for: {0}: Either ACK validity timed out *OR* Cluster memberships were removed from ACCESS_CLUSTERS. For high latency networks, increase GAIAN_CONNECTIONS_CHECKER_HEARTBEAT_MS")]
    AckRevoked(NodeId),

    #[error("Connection request comes from node with identical ip and port(!) {ip}:{port}")]
    SelfConnection { ip: IpAddr, port: String },

    #[error("Connection to node could not be established: {0}")]
    EstablishFailed(NodeId),
}

/// Connection counts a decision is based on.
#[derive(Debug, Clone, Copy)]
struct Quota {
    discovered: usize,
    outbound: usize,
    required: usize,
    max: usize,
}

impl Quota {
    fn inbound_full(&self) -> bool {
        self.discovered.saturating_sub(self.outbound) >= self.max.saturating_sub(self.required)
    }

    /// Outbound connections still wanted, bounded by the total quota.
    fn sought(&self) -> usize {
        self.required
            .saturating_sub(self.outbound)
            .min(self.max.saturating_sub(self.discovered))
    }
}

// ============================================================================
// Negotiator
// ============================================================================

/// Applies the negotiation rules to received messages and maintenance calls.
pub struct Negotiator {
    config: Arc<dyn ConfigProvider>,
    registry: SharedRegistry,
    connections: Arc<dyn PeerConnections>,
    local: ArcSwap<LocalAddresses>,
}

impl Negotiator {
    pub fn new(
        config: Arc<dyn ConfigProvider>,
        registry: SharedRegistry,
        connections: Arc<dyn PeerConnections>,
    ) -> Self {
        Self {
            config,
            registry,
            connections,
            local: ArcSwap::from_pointee(LocalAddresses::default()),
        }
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn connections(&self) -> &Arc<dyn PeerConnections> {
        &self.connections
    }

    /// Refresh the local addressing used to detect self-connections.
    pub fn set_local_addresses(&self, local: LocalAddresses) {
        self.local.store(Arc::new(local));
    }

    fn quota(&self, config: &SeekerConfig, registry: &PeerRegistry) -> Quota {
        Quota {
            discovered: self.connections.discovered_connections().len(),
            outbound: registry.outbound_count(),
            required: config.required_outbound(),
            max: config.max_discovered_connections,
        }
    }

    /// Outbound connections this node still seeks.
    pub fn outbound_sought(&self) -> usize {
        let config = self.config.current();
        let registry = self.registry.lock();
        self.quota(&config, &registry).sought()
    }

    /// Decide whether and when to acknowledge a REQ.
    ///
    /// `sender` is the effective sender IP with the datagram's source port.
    /// The acknowledgment is only recorded by [`commit_acknowledgment`](Self::commit_acknowledgment)
    /// once the ACK has been sent.
    pub fn handle_request(&self, req: &Request, sender: SocketAddr) -> RequestDecision {
        let config = self.config.current();
        if config.is_reply_disabled() {
            return RequestDecision::Ignore(IgnoreReason::RepliesDisabled);
        }

        let mut registry = self.registry.lock();
        let quota = self.quota(&config, &registry);
        if quota.inbound_full() {
            return RequestDecision::Ignore(IgnoreReason::QuotaReached(quota.discovered));
        }

        let policy = config.access_policy();
        let theirs = parse_clusters(req.args.get(ARG_ACCESS_CLUSTERS));
        match policy.match_clusters(&theirs) {
            ClusterMatch::PeerAdvertisedNone => {
                return RequestDecision::Ignore(IgnoreReason::NoClusterId)
            }
            ClusterMatch::Disjoint => {
                return RequestDecision::Ignore(IgnoreReason::ClusterMismatch(theirs.len()))
            }
            ClusterMatch::Unrestricted | ClusterMatch::Shared => {}
        }
        registry.clear_dropped(&req.origin);

        if !policy.permits_host(&req.origin) {
            return RequestDecision::Ignore(IgnoreReason::HostNotAllowed(req.origin.clone()));
        }
        if registry.is_outbound(&req.origin) {
            return RequestDecision::Ignore(IgnoreReason::AlreadyOutbound(req.origin.clone()));
        }
        drop(registry);

        let strategy = ConnectionStrategy::parse(req.args.get(ARG_CONNECTION_STRATEGY));
        let Some(delay) = strategy.reply_delay(config.node_host(), quota.discovered, quota.sought() > 0)
        else {
            let ConnectionStrategy::ToUserDbNode(db) = strategy else {
                return RequestDecision::Ignore(IgnoreReason::NotSeeking);
            };
            return RequestDecision::Ignore(IgnoreReason::NotResponsibleForUserDb(db));
        };
        tracing::debug!("Answering REQ from {} ({}, delay {:?})", req.origin, strategy, delay);

        let ack = codec::encode_acknowledgment(
            &req.origin,
            &config.node_id,
            &config.node_user,
            &config.node_password_scrambled,
            PROTOCOL_VERSION,
            config.ssl_mode.as_deref(),
            &MessageArgs::new(),
        );

        RequestDecision::Respond(Reply {
            already_connected: self.connections.connection_for(&req.origin).is_some(),
            node: req.origin.clone(),
            delay,
            ack,
            dest: sender,
        })
    }

    /// Record the acknowledgment granted by a sent [`Reply`].
    pub fn commit_acknowledgment(&self, reply: &Reply) {
        let mut registry = self.registry.lock();
        registry.grant_ack(&reply.node, reply.dest.ip());
        tracing::debug!(
            "Sent ACK to {}, granted ACKs: {:?}",
            reply.node,
            registry.acknowledged_nodes().collect::<Vec<_>>()
        );
    }

    /// Act on an ACK addressed to this node, establishing an outbound connection.
    pub fn handle_acknowledgment(
        &self,
        ack: &Acknowledgment,
        sender_ip: IpAddr,
    ) -> Result<ConnectionId, IgnoreReason> {
        let config = self.config.current();
        if config.is_reply_disabled() {
            return Err(IgnoreReason::RepliesDisabled);
        }

        let policy = config.access_policy();
        let too_old = ack
            .version
            .as_deref()
            .map_or(true, |v| v < CLUSTER_AWARE_VERSION);
        if !policy.clusters().is_empty() && too_old {
            return Err(IgnoreReason::VersionTooOld(ack.sender.clone()));
        }
        if !policy.permits_host(&ack.sender) {
            return Err(IgnoreReason::HostNotAllowed(ack.sender.clone()));
        }

        let mut registry = self.registry.lock();
        if self.quota(&config, &registry).sought() == 0 {
            return Err(IgnoreReason::NotSeeking);
        }
        if registry.is_outbound(&ack.sender) {
            return Err(IgnoreReason::AlreadyOutbound(ack.sender.clone()));
        }

        if registry.acknowledgment(&ack.sender).is_some() {
            if config.node_id.as_str() < ack.sender.as_str() {
                return Err(IgnoreReason::TieBreakYield(ack.sender.clone()));
            }
            // We maintain this one: our own grant is void.
            registry.revoke_ack(&ack.sender);
        }

        let Some(id) = self.connections.add_peer_connection(
            &ack.sender,
            ack.ssl_mode(),
            sender_ip,
            &ack.user,
            &ack.scrambled_password,
        ) else {
            return Err(IgnoreReason::EstablishFailed(ack.sender.clone()));
        };

        registry.add_outbound(&ack.sender);
        registry.clear_dropped(&ack.sender);
        tracing::info!(
            target: CONNECTION_LOG_TARGET,
            "OUTBOUND connection {} established: -> {}",
            id,
            ack.sender
        );
        tracing::info!("{}", ConnectionSummary::capture(&registry, self.connections.as_ref(), &config));
        Ok(id)
    }

    /// Check the access policy for `node`, including policy drops after a
    /// cluster membership change.
    pub fn is_node_allowed(&self, node: &str) -> bool {
        let policy = self.config.current().access_policy();
        policy.permits_host(node) && !self.registry.lock().is_dropped(node)
    }

    /// Validate a peer's claim that it maintains a connection to us, and
    /// establish the reciprocal link when it does not exist yet.
    pub fn maintain_connection(
        &self,
        sender: &str,
        user: &str,
        scrambled_password: &str,
        extra_info: Option<&str>,
    ) -> Result<(), Rejection> {
        let config = self.config.current();
        let policy = config.access_policy();
        let mut registry = self.registry.lock();

        if !policy.permits_host(sender) || registry.is_dropped(sender) {
            let rejection = Rejection::AccessRestricted(sender.to_string());
            tracing::info!("Rejecting maintenance call from {}: {}", sender, rejection);
            return Err(rejection);
        }

        let mut ssl_mode = None;
        if let Some(extra) = extra_info {
            if extra.starts_with(INIT_TAG) && !registry.is_outbound(sender) {
                if let Some(stale) = self.connections.connection_for(sender) {
                    tracing::info!(
                        "Removing stale connection to {} which has just been recycled",
                        sender
                    );
                    drop_connections_locked(
                        &mut registry,
                        self.connections.as_ref(),
                        &[stale],
                    );
                }
            }
            ssl_mode = parse_ssl_tag(extra);
        }

        let reject = |rejection: Rejection| {
            tracing::info!("Rejecting maintenance call from {}: {}", sender, rejection);
            Err(rejection)
        };

        if registry.is_outbound(sender) {
            return reject(Rejection::OppositeDirection);
        }
        if self.connections.connection_for(sender).is_some() {
            return Ok(());
        }

        let quota = self.quota(&config, &registry);
        if quota.inbound_full() {
            return reject(Rejection::MaxDiscovered(quota.discovered));
        }

        let record = registry
            .acknowledgment(sender)
            .filter(|r| !r.is_expired(config.heartbeat()))
            .copied();
        let Some(record) = record else {
            return reject(Rejection::AckRevoked(sender.to_string()));
        };

        if self.local.load().is_local(record.sender_ip) {
            let port = port_of(sender)
                .map(str::to_string)
                .unwrap_or_else(|| crate::config::DEFAULT_NODE_PORT.to_string());
            if port == config.node_port() {
                return reject(Rejection::SelfConnection {
                    ip: record.sender_ip,
                    port,
                });
            }
        }

        tracing::debug!("Reciprocating inbound connection from {}", sender);
        let Some(id) = self.connections.add_peer_connection(
            sender,
            ssl_mode,
            record.sender_ip,
            user,
            scrambled_password,
        ) else {
            return reject(Rejection::EstablishFailed(sender.to_string()));
        };

        tracing::info!(
            target: CONNECTION_LOG_TARGET,
            "INBOUND connection {} established: <- {}",
            id,
            sender
        );
        tracing::info!("{}", ConnectionSummary::capture(&registry, self.connections.as_ref(), &config));
        Ok(())
    }

    /// Record a sender of a gateway REQ, returning the nodes seen that way
    /// before it (those the REQ must also be forwarded to).
    pub fn note_gateway_sender(&self, sender_ip: IpAddr) -> Vec<IpAddr> {
        let mut registry = self.registry.lock();
        let previous: Vec<IpAddr> = registry
            .unicast_discovered()
            .filter(|ip| *ip != sender_ip)
            .collect();
        registry.note_unicast_discovery(sender_ip);
        previous
    }

    /// Whether a gateway must still be probed: we seek connections or hold
    /// none to that host.
    pub fn should_probe_gateway(&self, gateway: &str) -> bool {
        if self.outbound_sought() > 0 {
            return true;
        }
        let gateway_host = host_of(gateway).to_uppercase();
        !self
            .connections
            .connected_nodes()
            .iter()
            .any(|node| host_of(node).to_uppercase() == gateway_host)
    }
}

/// Extract `<mode>` from `...SSL:<mode>,...`.
fn parse_ssl_tag(extra: &str) -> Option<&str> {
    let start = extra.find(SSL_MODE_TAG)? + SSL_MODE_TAG.len();
    let rest = &extra[start..];
    let end = rest.find(',')?;
    Some(&rest[..end]).filter(|m| !m.is_empty())
}
