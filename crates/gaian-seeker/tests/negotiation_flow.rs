// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gaiandb.org

#![allow(clippy::uninlined_format_args)] // Test code readability over pedantic
#![allow(clippy::missing_panics_doc)] // Tests panic on failure
#![allow(clippy::similar_names)] // Test variable naming

//! Multi-node negotiation tests
//!
//! Drives several in-process seekers through REQ / ACK / maintenance
//! exchanges by passing the encoded messages between them, without sockets.

use gaian_seeker::codec::{self, DiscoveryMessage, MessageArgs};
use gaian_seeker::negotiation::{self, IgnoreReason, RequestDecision, Route};
use gaian_seeker::{
    ConfigProvider, ConnectionTable, NodeSeeker, PeerConnections, Rejection, SeekerConfig,
    SharedConfig,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

const DISCOVERY_PORT: u16 = 7777;

struct Node {
    ip: IpAddr,
    config: Arc<SharedConfig>,
    table: Arc<ConnectionTable>,
    seeker: NodeSeeker,
}

impl Node {
    fn new(node_id: &str, last_octet: u8, edit: impl Fn(&mut SeekerConfig)) -> Self {
        let mut config = SeekerConfig {
            node_id: node_id.to_string(),
            node_password_scrambled: format!("pwd-{}", node_id),
            ..Default::default()
        };
        edit(&mut config);
        let config = Arc::new(SharedConfig::new(config));
        let table = Arc::new(ConnectionTable::new());
        let seeker = NodeSeeker::new(config.clone(), table.clone()).unwrap();
        Self {
            ip: IpAddr::V4(Ipv4Addr::new(10, 1, 0, last_octet)),
            config,
            table,
            seeker,
        }
    }

    fn id(&self) -> String {
        self.config.current().node_id.clone()
    }

    /// Multicast REQ as this node would send it.
    fn req(&self) -> String {
        let config = self.config.current();
        codec::encode_request(
            &config.node_id,
            "230.255.255.255",
            &negotiation::request_args(&config),
        )
    }

    /// Receive a REQ; returns the ACK text if one was sent.
    fn receive_req(&self, raw: &str, from: &Node) -> Result<String, IgnoreReason> {
        let route = negotiation::route(raw, from.ip, &self.id()).unwrap();
        let Route::Deliver {
            sender_ip,
            message: DiscoveryMessage::Request(req),
            ..
        } = route
        else {
            panic!("expected a deliverable REQ, got {:?}", route);
        };

        let sender = SocketAddr::new(sender_ip, 40_000);
        match self.seeker.negotiator().handle_request(&req, sender) {
            RequestDecision::Respond(reply) => {
                assert!(reply.delay <= negotiation::ATTACHMENT_HOLD_TIME);
                self.seeker.negotiator().commit_acknowledgment(&reply);
                Ok(reply.ack)
            }
            RequestDecision::Ignore(reason) => Err(reason),
        }
    }

    /// Receive an ACK, establishing the outbound connection if accepted.
    fn receive_ack(&self, raw: &str, from: &Node) -> Result<(), IgnoreReason> {
        let route = negotiation::route(raw, from.ip, &self.id()).unwrap();
        let Route::Deliver {
            sender_ip,
            message: DiscoveryMessage::Acknowledgment(ack),
            ..
        } = route
        else {
            panic!("expected a deliverable ACK, got {:?}", route);
        };
        self.seeker
            .negotiator()
            .handle_acknowledgment(&ack, sender_ip)
            .map(|_| ())
    }

    /// Maintenance call a freshly established outbound connection makes.
    fn call_maintain(&self, on: &Node) -> Result<(), Rejection> {
        on.seeker
            .maintain_connection(&self.id(), "gaiandb", &format!("pwd-{}", self.id()), Some("INIT,"))
    }

    fn is_outbound_to(&self, other: &Node) -> bool {
        self.seeker.registry().lock().is_outbound(&other.id())
    }

    fn connected_to(&self, other: &Node) -> bool {
        self.table.connection_for(&other.id()).is_some()
    }
}

/// Full handshake from `seeker` to `peer`.
fn handshake(seeker: &Node, peer: &Node) {
    let ack = peer.receive_req(&seeker.req(), seeker).unwrap();
    seeker.receive_ack(&ack, peer).unwrap();
    seeker.call_maintain(peer).unwrap();
}

#[test]
fn test_single_handshake() {
    let a = Node::new("alpha:6414", 1, |c| c.min_discovered_connections = 1);
    let b = Node::new("bravo:6414", 2, |_| {});

    let ack = b.receive_req(&a.req(), &a).unwrap();
    assert!(ack.starts_with("ACK alpha:6414 bravo:6414 gaiandb pwd-bravo:6414 2.1.8"));
    assert!(b.seeker.registry().lock().acknowledgment("alpha:6414").is_some());

    a.receive_ack(&ack, &b).unwrap();
    assert!(a.is_outbound_to(&b));
    assert!(a.connected_to(&b));
    let link = a.table.link(&a.table.connection_for("bravo:6414").unwrap()).unwrap();
    assert_eq!(link.url, "jdbc:derby://10.1.0.2:6414/gaiandb6414;create=true");

    a.call_maintain(&b).unwrap();
    assert!(b.connected_to(&a));
    assert!(!b.is_outbound_to(&a));

    // Seeking is satisfied: no further ACK is accepted.
    let c = Node::new("charlie:6414", 3, |_| {});
    let ack = c.receive_req(&a.req(), &a).unwrap();
    assert_eq!(a.receive_ack(&ack, &c), Err(IgnoreReason::NotSeeking));
    assert_eq!(a.seeker.negotiator().outbound_sought(), 0);
}

#[test]
fn test_simultaneous_discovery_converges() {
    let a = Node::new("nodeA", 1, |c| c.min_discovered_connections = 1);
    let b = Node::new("nodeB", 2, |c| c.min_discovered_connections = 1);

    // Both REQs cross, both nodes grant an ACK.
    let ack_from_b = b.receive_req(&a.req(), &a).unwrap();
    let ack_from_a = a.receive_req(&b.req(), &b).unwrap();

    // The lower id yields and keeps its grant for the greater one.
    assert_eq!(
        a.receive_ack(&ack_from_b, &b),
        Err(IgnoreReason::TieBreakYield("nodeB".into()))
    );
    assert!(a.seeker.registry().lock().acknowledgment("nodeB").is_some());

    // The greater id maintains and voids its own grant.
    b.receive_ack(&ack_from_a, &a).unwrap();
    assert!(b.seeker.registry().lock().acknowledgment("nodeA").is_none());

    b.call_maintain(&a).unwrap();
    assert!(b.is_outbound_to(&a));
    assert!(!a.is_outbound_to(&b));
    assert!(a.connected_to(&b) && b.connected_to(&a));
    assert_eq!(a.table.len(), 1);
    assert_eq!(b.table.len(), 1);

    // A reverse maintenance call is refused.
    assert_eq!(a.call_maintain(&b), Err(Rejection::OppositeDirection));
}

#[test]
fn test_tie_break_is_deterministic() {
    for (low, high) in [("a", "b"), ("node1:6414", "node2:6414"), ("X", "x")] {
        let l = Node::new(low, 1, |c| c.min_discovered_connections = 1);
        let h = Node::new(high, 2, |c| c.min_discovered_connections = 1);
        let ack_from_h = h.receive_req(&l.req(), &l).unwrap();
        let ack_from_l = l.receive_req(&h.req(), &h).unwrap();

        assert!(l.receive_ack(&ack_from_h, &h).is_err());
        assert!(h.receive_ack(&ack_from_l, &l).is_ok());
        assert!(h.is_outbound_to(&l));
        assert!(!l.is_outbound_to(&h));
    }
}

#[test]
fn test_discovered_connections_never_exceed_max() {
    let hub = Node::new("hub", 10, |c| c.max_discovered_connections = 2);
    let spokes: Vec<Node> = (1..=3)
        .map(|i| Node::new(&format!("spoke{}", i), i, |c| c.min_discovered_connections = 1))
        .collect();

    // All three ACKs are granted before any connection exists.
    let acks: Vec<String> = spokes
        .iter()
        .map(|s| hub.receive_req(&s.req(), s).unwrap())
        .collect();

    let mut accepted = 0;
    for (spoke, ack) in spokes.iter().zip(&acks) {
        spoke.receive_ack(ack, &hub).unwrap();
        match spoke.call_maintain(&hub) {
            Ok(()) => accepted += 1,
            Err(rejection) => {
                assert_eq!(rejection, Rejection::MaxDiscovered(2));
                assert_eq!(
                    rejection.to_string(),
                    "Max number of discovered connections reached: 2"
                );
            }
        }
        assert!(hub.table.len() <= 2);
    }
    assert_eq!(accepted, 2);

    // With the quota full further REQs are not answered.
    let late = Node::new("late", 9, |c| c.min_discovered_connections = 1);
    assert_eq!(
        hub.receive_req(&late.req(), &late),
        Err(IgnoreReason::QuotaReached(2))
    );
}

#[test]
fn test_expired_ack_is_revoked() {
    let a = Node::new("alpha", 1, |c| c.min_discovered_connections = 1);
    let b = Node::new("bravo", 2, |c| c.gaian_connections_checker_heartbeat_ms = 50);

    let granted = Instant::now()
        .checked_sub(Duration::from_secs(1))
        .unwrap_or_else(Instant::now);
    b.seeker
        .registry()
        .lock()
        .grant_ack_at("alpha", a.ip, granted);

    let rejection = a.call_maintain(&b).unwrap_err();
    assert_eq!(rejection, Rejection::AckRevoked("alpha".into()));
    assert!(rejection
        .to_string()
        .starts_with("ACK revoked (connection aborted) for: alpha: Either ACK validity timed out"));
    assert!(!b.connected_to(&a));

    // The maintenance pass evicts the stale record.
    let report = b.seeker.maintenance().run_pass();
    assert_eq!(report.acks_expired, vec!["alpha".to_string()]);
    assert_eq!(b.seeker.registry().lock().ack_count(), 0);
}

#[test]
fn test_denied_host_is_refused_and_dropped() {
    let a = Node::new("badhost:6414", 1, |c| c.min_discovered_connections = 1);
    let b = Node::new("bravo", 2, |_| {});

    handshake(&a, &b);
    assert!(b.connected_to(&a));

    b.config.update(|c| c.access_hosts_denied = Some(vec!["BADHOST".into()]));
    let report = b.seeker.maintenance().run_pass();
    assert_eq!(report.connections_dropped, 1);
    assert!(!b.connected_to(&a));

    assert!(!b.seeker.is_node_allowed("badhost:6414"));
    assert!(matches!(
        b.receive_req(&a.req(), &a),
        Err(IgnoreReason::HostNotAllowed(_))
    ));
    assert_eq!(
        a.call_maintain(&b).unwrap_err().to_string(),
        "Node 'badhost:6414' does not meet ACCESS restrictions for cluster membership or permitted/denied hosts"
    );
}

#[test]
fn test_cluster_membership_change_drops_until_shared() {
    let a = Node::new("alpha", 1, |c| c.min_discovered_connections = 1);
    let b = Node::new("bravo", 2, |_| {});

    handshake(&a, &b);
    assert!(b.connected_to(&a));

    // bravo joins cluster X: every discovered connection goes.
    b.config.update(|c| c.access_clusters = vec!["X".into()]);
    let report = b.seeker.maintenance().run_pass();
    assert_eq!(report.connections_dropped, 1);
    assert!(b.table.is_empty());
    assert!(!b.seeker.is_node_allowed("alpha"));
    assert!(matches!(a.call_maintain(&b), Err(Rejection::AccessRestricted(_))));

    // A REQ without clusters changes nothing.
    assert_eq!(b.receive_req(&a.req(), &a), Err(IgnoreReason::NoClusterId));
    assert!(!b.seeker.is_node_allowed("alpha"));

    // Once alpha advertises X it is admitted again.
    a.config.update(|c| c.access_clusters = vec!["X".into()]);
    assert!(a.req().contains("ACCESS_CLUSTERS='X'"));
    assert!(b.receive_req(&a.req(), &a).is_ok());
    assert!(b.seeker.is_node_allowed("alpha"));
}

#[test]
fn test_cluster_aware_ack_requires_version() {
    let a = Node::new("alpha", 1, |c| {
        c.min_discovered_connections = 1;
        c.access_clusters = vec!["X".into()];
    });
    let b = Node::new("bravo", 2, |_| {});

    let old = "ACK alpha bravo gaiandb pwd 1.03";
    assert_eq!(
        a.receive_ack(old, &b),
        Err(IgnoreReason::VersionTooOld("bravo".into()))
    );
    let unversioned = "ACK alpha bravo gaiandb pwd";
    assert!(matches!(
        a.receive_ack(unversioned, &b),
        Err(IgnoreReason::VersionTooOld(_))
    ));
    assert!(a.receive_ack("ACK alpha bravo gaiandb pwd 2.1.8", &b).is_ok());
}

#[test]
fn test_gateway_relay_is_not_relayed_again() {
    let remote = Node::new("remote", 1, |c| c.min_discovered_connections = 1);
    let gateway = Node::new("gateway", 2, |_| {});
    let local = Node::new("local", 3, |_| {});

    // The remote node asks the gateway to relay: destination is its own IP.
    let args = MessageArgs::new();
    let raw = codec::encode_request("remote", &remote.ip.to_string(), &args);
    let route = negotiation::route(&raw, remote.ip, &gateway.id()).unwrap();
    let Route::RelayRequest {
        sender_ip, request, ..
    } = route
    else {
        panic!("expected a relay, got {:?}", route);
    };
    assert_eq!(sender_ip, remote.ip);
    assert!(gateway.seeker.negotiator().note_gateway_sender(sender_ip).is_empty());

    // The relayed copy is enveloped and is delivered, never relayed again.
    let envelope = codec::wrap_envelope(
        sender_ip,
        &codec::encode_request(&request.origin, "230.255.255.255", &request.args),
    );
    let route = negotiation::route(&envelope, gateway.ip, &local.id()).unwrap();
    let Route::Deliver {
        sender_ip,
        relayed,
        message: DiscoveryMessage::Request(req),
    } = route
    else {
        panic!("expected delivery, got {:?}", route);
    };
    assert_eq!(sender_ip, remote.ip);
    assert!(relayed);
    assert_eq!(req.origin, "remote");

    // The ACK goes straight back to the remote node's discovery port, not to
    // the gateway socket the envelope came from.
    let gateway_socket = SocketAddr::new(gateway.ip, 51_234);
    let reply_to =
        negotiation::reply_address(sender_ip, relayed, gateway_socket, DISCOVERY_PORT);
    let ack = match local.seeker.negotiator().handle_request(&req, reply_to) {
        RequestDecision::Respond(reply) => {
            assert_eq!(reply.dest, SocketAddr::new(remote.ip, DISCOVERY_PORT));
            local.seeker.negotiator().commit_acknowledgment(&reply);
            reply.ack
        }
        RequestDecision::Ignore(reason) => panic!("REQ ignored: {}", reason),
    };
    remote.receive_ack(&ack, &local).unwrap();
    remote.call_maintain(&local).unwrap();

    // An enveloped ACK for another node is never forwarded again.
    let wrapped = codec::wrap_envelope(local.ip, &ack);
    assert_eq!(
        negotiation::route(&wrapped, Ipv4Addr::LOCALHOST.into(), "bystander").unwrap(),
        Route::NotForUs
    );

    // A second gateway sender learns about the first.
    let other = IpAddr::V4(Ipv4Addr::new(10, 9, 9, 9));
    assert_eq!(
        gateway.seeker.negotiator().note_gateway_sender(other),
        vec![remote.ip]
    );
}

#[test]
fn test_ack_for_colocated_node_is_forwarded_once() {
    let here = Node::new("here:6414", 1, |_| {});
    let raw = "ACK there:6415 peer gaiandb pwd 2.1.8";
    let peer_ip = IpAddr::V4(Ipv4Addr::new(10, 1, 0, 7));

    let Route::ForwardAck { target, wrapped } =
        negotiation::route(raw, peer_ip, &here.id()).unwrap()
    else {
        panic!("expected a local forward");
    };
    assert_eq!(target, "there:6415");

    // The co-located node sees the original sender inside the envelope.
    let Route::Deliver { sender_ip, .. } =
        negotiation::route(&wrapped, Ipv4Addr::LOCALHOST.into(), "there:6415").unwrap()
    else {
        panic!("expected delivery");
    };
    assert_eq!(sender_ip, peer_ip);
}

#[test]
fn test_negative_minimum_disables_replies() {
    let a = Node::new("alpha", 1, |c| c.min_discovered_connections = 1);
    let quiet = Node::new("quiet", 2, |c| c.min_discovered_connections = -1);

    assert_eq!(
        quiet.receive_req(&a.req(), &a),
        Err(IgnoreReason::RepliesDisabled)
    );
    assert_eq!(
        quiet.receive_ack("ACK quiet alpha gaiandb pwd 2.1.8", &a),
        Err(IgnoreReason::RepliesDisabled)
    );
}
