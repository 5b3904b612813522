// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gaiandb.org

//! Discovery loop.
//!
//! One tokio task owns the sockets. Each iteration:
//! - re-reads the configuration (port or interface property change reopens sockets)
//! - on every watchdog tick: re-resolves interfaces and targets, rejoins the
//!   multicast groups if they changed, evicts expired ACKs and sends REQs
//!   (to the targets and to configured gateways) while connections are sought
//! - polls for one datagram (bounded by the socket poll timeout) and hands it
//!   to the negotiator
//!
//! On IO failure every tracked connection is dropped, the loop sleeps for two
//! watchdog intervals and starts again with fresh sockets.
//!
//! Maintenance runs for the whole life of [`NodeSeeker::run`], including
//! while `DISCOVERY_IP` is empty and no sockets are open.

use crate::codec::{self, DiscoveryMessage, Request};
use crate::config::{ConfigError, ConfigProvider, SeekerConfig, DEFAULT_MULTICAST_GROUP};
use crate::connections::PeerConnections;
use crate::interfaces;
use crate::maintenance::MaintenanceScheduler;
use crate::negotiation::{self, Negotiator, RequestDecision, Route};
use crate::registry::{PeerRegistry, SharedRegistry};
use crate::targets::{self, DiscoveryTargets, LocalAddresses};
use crate::transport::{Datagram, TransportManager};
use std::collections::BTreeSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Fallback for re-broadcasting ACKs on this host when multicast fails.
pub const LOOPBACK_BROADCAST: Ipv4Addr = Ipv4Addr::new(127, 255, 255, 255);

/// Node seeker errors.
#[derive(Debug, Error)]
pub enum SeekerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Socket error: {0}")]
    Io(#[from] io::Error),

    #[error("Node seeker already running")]
    AlreadyRunning,
}

/// Why a socket attempt ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptEnd {
    Shutdown,
    Disabled,
    /// Discovery port or multicast interface property changed.
    Reopen,
}

/// Resolved addressing for the current attempt.
#[derive(Debug, Default)]
struct AttemptState {
    local: Option<LocalAddresses>,
    discovery_ip: String,
    interfaces: BTreeSet<Ipv4Addr>,
    targets: Option<DiscoveryTargets>,
}

/// Stops a running [`NodeSeeker`].
#[derive(Debug, Clone)]
pub struct SeekerHandle {
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl SeekerHandle {
    /// Signal the discovery loop and the maintenance scheduler to stop.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Peer discovery for one node.
pub struct NodeSeeker {
    config: Arc<dyn ConfigProvider>,
    registry: SharedRegistry,
    negotiator: Arc<Negotiator>,
    maintenance: Arc<MaintenanceScheduler>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl NodeSeeker {
    /// Create a seeker. The configuration is validated once here.
    pub fn new(
        config: Arc<dyn ConfigProvider>,
        connections: Arc<dyn PeerConnections>,
    ) -> Result<Self, SeekerError> {
        let initial = config.current();
        initial.validate()?;

        let registry = PeerRegistry::shared(initial.clusters());
        let negotiator = Arc::new(Negotiator::new(
            config.clone(),
            registry.clone(),
            connections.clone(),
        ));
        let maintenance = Arc::new(MaintenanceScheduler::new(
            config.clone(),
            registry.clone(),
            connections,
        ));

        Ok(Self {
            config,
            registry,
            negotiator,
            maintenance,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn handle(&self) -> SeekerHandle {
        SeekerHandle {
            running: self.running.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn negotiator(&self) -> &Arc<Negotiator> {
        &self.negotiator
    }

    pub fn maintenance(&self) -> &Arc<MaintenanceScheduler> {
        &self.maintenance
    }

    /// Inbound validation entry point; `Err` carries the message for the caller.
    pub fn maintain_connection(
        &self,
        sender: &str,
        user: &str,
        scrambled_password: &str,
        extra_info: Option<&str>,
    ) -> Result<(), negotiation::Rejection> {
        self.negotiator
            .maintain_connection(sender, user, scrambled_password, extra_info)
    }

    pub fn is_node_allowed(&self, node: &str) -> bool {
        self.negotiator.is_node_allowed(node)
    }

    pub fn drop_connection(&self, id: &str) -> bool {
        self.maintenance.drop_connection(id)
    }

    pub fn reverse_maintenance_direction(&self, id: &str) -> bool {
        self.maintenance.reverse_maintenance_direction(id)
    }

    /// Run discovery and maintenance on a new task.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<Result<(), SeekerError>> {
        tokio::spawn(async move { self.run().await })
    }

    /// Run discovery and connection maintenance until shut down.
    ///
    /// An empty `DISCOVERY_IP` closes the sockets; the property is re-read
    /// every watchdog interval and discovery resumes once it is set again.
    pub async fn run(&self) -> Result<(), SeekerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SeekerError::AlreadyRunning);
        }

        let maintenance_task = self
            .maintenance
            .clone()
            .spawn(self.running.clone(), self.shutdown.clone());

        let mut first_failure = true;
        let mut disabled = false;
        while self.running.load(Ordering::SeqCst) {
            let config = self.config.current();
            if !config.is_discovery_enabled() {
                if !disabled {
                    info!("DISCOVERY_IP is empty: node discovery disabled");
                    disabled = true;
                }
                if self.wait_or_shutdown(config.watchdog_interval()).await {
                    break;
                }
                continue;
            }
            if disabled {
                info!("DISCOVERY_IP is set: node discovery resumed");
                disabled = false;
            }

            let mut healthy = false;
            match self.run_attempt(&mut healthy).await {
                Ok(AttemptEnd::Shutdown) => break,
                Ok(AttemptEnd::Disabled) => {}
                Ok(AttemptEnd::Reopen) => {
                    debug!("Discovery socket settings changed, reopening");
                }
                Err(e) => {
                    if healthy {
                        first_failure = true;
                    }
                    if first_failure {
                        warn!("Node discovery failure (retrying until recovered): {}", e);
                    } else {
                        debug!("Node discovery failure persists: {}", e);
                    }
                    first_failure = false;

                    let dropped = self.maintenance.drop_all_connections();
                    self.registry.lock().reset_negotiations();
                    debug!("Dropped {} discovered connections", dropped);

                    if self.wait_or_shutdown(config.watchdog_interval() * 2).await {
                        break;
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        if let Err(e) = maintenance_task.await {
            warn!("Maintenance task failed: {}", e);
        }
        info!("Node seeker stopped");
        Ok(())
    }

    /// Sleep for `period`. Returns `true` if shutdown was requested meanwhile.
    async fn wait_or_shutdown(&self, period: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(period) => !self.running.load(Ordering::SeqCst),
            _ = self.shutdown.notified() => true,
        }
    }

    async fn run_attempt(&self, healthy: &mut bool) -> Result<AttemptEnd, SeekerError> {
        let config = self.config.current();
        let mut transport = TransportManager::open(
            config.discovery_port,
            config.discovery_ttl,
            config.socket_poll_timeout(),
        )?;
        info!(
            "Node seeker {} listening for discovery messages on port {}",
            config.node_id,
            transport.port()
        );

        let end = self.attempt_loop(&mut transport, &config, healthy).await;
        transport.close();
        end
    }

    async fn attempt_loop(
        &self,
        transport: &mut TransportManager,
        opened_with: &SeekerConfig,
        healthy: &mut bool,
    ) -> Result<AttemptEnd, SeekerError> {
        let mut state = AttemptState::default();
        let mut next_tick = Instant::now();

        loop {
            if !self.running.load(Ordering::SeqCst) {
                return Ok(AttemptEnd::Shutdown);
            }
            let config = self.config.current();
            if !config.is_discovery_enabled() {
                return Ok(AttemptEnd::Disabled);
            }
            if config.discovery_port != opened_with.discovery_port
                || config.multicast_interfaces != opened_with.multicast_interfaces
            {
                return Ok(AttemptEnd::Reopen);
            }

            if Instant::now() >= next_tick {
                self.watchdog_tick(transport, &config, &mut state).await?;
                next_tick = Instant::now() + config.watchdog_interval();
                *healthy = true;
            }

            let datagram = tokio::select! {
                result = transport.poll_incoming() => result?,
                _ = self.shutdown.notified() => return Ok(AttemptEnd::Shutdown),
            };
            if let Some(datagram) = datagram {
                self.dispatch(transport, &config, &state, datagram).await?;
            }
        }
    }

    async fn watchdog_tick(
        &self,
        transport: &mut TransportManager,
        config: &SeekerConfig,
        state: &mut AttemptState,
    ) -> io::Result<()> {
        let local = tokio::task::spawn_blocking(LocalAddresses::probe)
            .await
            .unwrap_or_default();
        self.negotiator.set_local_addresses(local.clone());

        let discovery_ip = config.discovery_ip_or_default();
        let interfaces =
            targets::resolve_interfaces(config.multicast_interfaces.as_deref(), &local);

        if state.local.as_ref() != Some(&local)
            || state.discovery_ip != discovery_ip
            || state.interfaces != interfaces
        {
            let resolved = {
                let (discovery_ip, local) = (discovery_ip.clone(), local.clone());
                tokio::task::spawn_blocking(move || {
                    targets::resolve_targets(&discovery_ip, &local)
                })
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
            };
            transport.leave_all();
            transport.set_multicast_interfaces(interfaces.clone());
            for group in resolved.multicast_groups() {
                if transport.join_group(group, &interfaces) == 0 {
                    warn!("Unable to join multicast group {} on any interface", group);
                }
            }
            info!(
                "Discovery targets {:?} via interfaces {:?}",
                resolved.addresses(),
                interfaces
            );

            state.local = Some(local.clone());
            state.discovery_ip = discovery_ip;
            state.interfaces = interfaces;
            state.targets = Some(resolved);
        }

        let expired = self
            .registry
            .lock()
            .remove_expired_acks(config.heartbeat());
        if !expired.is_empty() {
            debug!("Evicted expired ACKs: {:?}", expired);
        }

        let sought = self.negotiator.outbound_sought();
        let args = negotiation::request_args(config);
        if sought > 0 {
            for addr in state.targets.iter().flat_map(DiscoveryTargets::addresses) {
                let req = codec::encode_request(&config.node_id, &addr.to_string(), &args);
                trace!("Sending {} to {}", req, addr);
                transport
                    .send_to(&req, addr, config.discovery_port, None)
                    .await?;
            }
        }

        for gateway in &config.discovery_gateways {
            if self.negotiator.should_probe_gateway(gateway) {
                self.probe_gateway(transport, config, &local, gateway, &args)
                    .await;
            }
        }

        Ok(())
    }

    /// Ask a gateway to relay our REQ into its network.
    async fn probe_gateway(
        &self,
        transport: &mut TransportManager,
        config: &SeekerConfig,
        local: &LocalAddresses,
        gateway: &str,
        args: &codec::MessageArgs,
    ) {
        let Some(gateway_ip) = targets::lookup_host(gateway).await else {
            return;
        };
        let Some(reply_ip) =
            interfaces::longest_prefix_match(&gateway_ip.to_string(), &local.all)
        else {
            debug!("No local IP to reach gateway {}", gateway);
            return;
        };

        let req = codec::encode_request(&config.node_id, &reply_ip.to_string(), args);
        if let Err(e) = transport
            .send_to(&req, gateway_ip, config.discovery_port, None)
            .await
        {
            debug!("Gateway REQ to {} failed: {}", gateway, e);
        }
    }

    async fn dispatch(
        &self,
        transport: &mut TransportManager,
        config: &SeekerConfig,
        state: &AttemptState,
        datagram: Datagram,
    ) -> io::Result<()> {
        if config.is_reply_disabled() {
            trace!("Discovery replies disabled, dropping: {}", datagram.payload);
            return Ok(());
        }

        let route = match negotiation::route(
            &datagram.payload,
            datagram.source.ip(),
            &config.node_id,
        ) {
            Ok(route) => route,
            Err(e) => {
                debug!("Dropping discovery message ({}): {}", e, datagram.payload);
                return Ok(());
            }
        };

        match route {
            Route::NotForUs => {}
            Route::RelayRequest {
                sender_ip,
                request,
                raw,
            } => {
                self.relay_gateway_request(transport, config, state, sender_ip, &request, &raw)
                    .await;
            }
            Route::ForwardAck { target, wrapped } => {
                self.forward_ack(transport, config, &target, &wrapped).await;
            }
            Route::Deliver {
                sender_ip,
                relayed,
                message: DiscoveryMessage::Request(req),
            } => {
                let sender = negotiation::reply_address(
                    sender_ip,
                    relayed,
                    datagram.source,
                    config.discovery_port,
                );
                match self.negotiator.handle_request(&req, sender) {
                    RequestDecision::Respond(reply) => {
                        if !reply.delay.is_zero() {
                            tokio::time::sleep(reply.delay).await;
                        }
                        let IpAddr::V4(dest) = reply.dest.ip() else {
                            debug!("Cannot answer IPv6 sender {}", reply.dest);
                            return Ok(());
                        };
                        transport
                            .send_to(&reply.ack, dest, reply.dest.port(), None)
                            .await?;
                        self.negotiator.commit_acknowledgment(&reply);
                        if reply.already_connected {
                            debug!("Re-acknowledged connected node {}", reply.node);
                        } else {
                            info!("Sent ACK to {} at {}", reply.node, reply.dest);
                        }
                    }
                    RequestDecision::Ignore(reason) => {
                        debug!("Ignoring REQ from {}: {}", req.origin, reason);
                    }
                }
            }
            Route::Deliver {
                sender_ip,
                message: DiscoveryMessage::Acknowledgment(ack),
                ..
            } => {
                if let Err(reason) = self.negotiator.handle_acknowledgment(&ack, sender_ip) {
                    debug!("Ignoring ACK from {}: {}", ack.sender, reason);
                }
            }
        }

        Ok(())
    }

    /// Forward a gateway REQ to our discovery targets, and to every node that
    /// reached us through a gateway request before.
    async fn relay_gateway_request(
        &self,
        transport: &mut TransportManager,
        config: &SeekerConfig,
        state: &AttemptState,
        sender_ip: IpAddr,
        request: &Request,
        raw: &str,
    ) {
        info!("Acting as gateway by forwarding REQ from {}: {}", sender_ip, raw);

        for addr in state.targets.iter().flat_map(DiscoveryTargets::addresses) {
            let req = codec::encode_request(&request.origin, &addr.to_string(), &request.args);
            let wrapped = codec::wrap_envelope(sender_ip, &req);
            if let Err(e) = transport
                .send_to(&wrapped, addr, config.discovery_port, None)
                .await
            {
                debug!("Gateway relay to {} failed: {}", addr, e);
            }
        }

        let wrapped = codec::wrap_envelope(sender_ip, raw);
        for ip in self.negotiator.note_gateway_sender(sender_ip) {
            let IpAddr::V4(dest) = ip else { continue };
            debug!("Forwarding discovery message from {} to {}", sender_ip, dest);
            if let Err(e) = transport
                .send_to(&wrapped, dest, config.discovery_port, None)
                .await
            {
                debug!("Gateway forward to {} failed: {}", dest, e);
            }
        }
    }

    /// Re-broadcast an ACK for another node on this host, once, on loopback.
    async fn forward_ack(
        &self,
        transport: &mut TransportManager,
        config: &SeekerConfig,
        target: &str,
        wrapped: &str,
    ) {
        debug!("Locally forwarding ACK destined to node {}", target);
        let loopback = interfaces::loopback_addresses();
        let Err(multicast_err) = transport
            .send_to(
                wrapped,
                DEFAULT_MULTICAST_GROUP,
                config.discovery_port,
                Some(&loopback),
            )
            .await
        else {
            return;
        };

        if let Err(broadcast_err) = transport
            .send_to(wrapped, LOOPBACK_BROADCAST, config.discovery_port, None)
            .await
        {
            warn!(
                "Unable to locally re-multicast or re-broadcast ACK destined to {}: {}; {}",
                target, multicast_err, broadcast_err
            );
        }
    }
}
