// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gaiandb.org

//! UDP transport for discovery traffic.
//!
//! Socket layout:
//! - one receive socket bound to `0.0.0.0:<discovery port>` (SO_REUSEADDR) that
//!   joins the multicast group on each multicast interface
//! - one general socket (ephemeral port) for unicast and broadcast sends
//! - one socket per local interface (ephemeral port, created on first use) for
//!   multicast sends through that interface
//!
//! Direct replies are unicast back to the source port of the datagram they
//! answer, so the general and per-interface sockets are polled too. Replies to
//! gateway-relayed REQs go to the requester's discovery port instead, where
//! its receive socket listens.

use socket2::{Domain, Protocol, Socket, Type};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;

/// Largest discovery datagram accepted.
pub const MAX_DATAGRAM_SIZE: usize = 4096;

/// A received discovery datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub payload: String,
    pub source: SocketAddr,
}

/// Discovery sockets for one run of the discovery loop.
pub struct TransportManager {
    port: u16,
    ttl: u32,
    poll_timeout: Duration,
    receiver: UdpSocket,
    general: UdpSocket,
    per_interface: BTreeMap<Ipv4Addr, UdpSocket>,
    /// Interfaces multicast sends go out on by default.
    multicast_interfaces: BTreeSet<Ipv4Addr>,
    /// Memberships held by the receive socket: (group, interface).
    joined: BTreeSet<(Ipv4Addr, Ipv4Addr)>,
}

impl TransportManager {
    /// Bind the discovery sockets. Must be called from within a tokio runtime.
    pub fn open(port: u16, ttl: u32, poll_timeout: Duration) -> io::Result<Self> {
        let receiver = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        receiver.set_reuse_address(true)?;
        receiver.set_nonblocking(true)?;
        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        receiver.bind(&bind_addr.into())?;
        receiver.set_multicast_loop_v4(true)?;
        let receiver = UdpSocket::from_std(receiver.into())?;

        let general = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        general.set_nonblocking(true)?;
        general.set_broadcast(true)?;
        general.set_ttl(ttl)?;
        general.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())?;
        let general = UdpSocket::from_std(general.into())?;

        let port = receiver.local_addr()?.port();
        tracing::debug!("Discovery transport bound to 0.0.0.0:{} (ttl={})", port, ttl);

        Ok(Self {
            port,
            ttl,
            poll_timeout,
            receiver,
            general,
            per_interface: BTreeMap::new(),
            multicast_interfaces: BTreeSet::new(),
            joined: BTreeSet::new(),
        })
    }

    /// Port the receive socket is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_multicast_interfaces(&mut self, interfaces: BTreeSet<Ipv4Addr>) {
        self.multicast_interfaces = interfaces;
    }

    /// Join `group` on each interface. Interfaces that refuse are logged and skipped.
    /// Returns how many memberships are now held for the group.
    pub fn join_group(&mut self, group: Ipv4Addr, interfaces: &BTreeSet<Ipv4Addr>) -> usize {
        for iface in interfaces {
            if self.joined.contains(&(group, *iface)) {
                continue;
            }
            match self.receiver.join_multicast_v4(group, *iface) {
                Ok(()) => {
                    tracing::debug!("Joined multicast group {} on interface {}", group, iface);
                    self.joined.insert((group, *iface));
                }
                Err(e) => {
                    tracing::debug!(
                        "Unable to join multicast group {} on interface {} (skipped): {}",
                        group,
                        iface,
                        e
                    );
                }
            }
        }
        self.joined.iter().filter(|(g, _)| *g == group).count()
    }

    /// Leave every joined group.
    pub fn leave_all(&mut self) {
        for (group, iface) in std::mem::take(&mut self.joined) {
            if let Err(e) = self.receiver.leave_multicast_v4(group, iface) {
                tracing::debug!("Unable to leave multicast group {} on {}: {}", group, iface, e);
            }
        }
    }

    /// Send a discovery message.
    ///
    /// A multicast destination is sent once per interface in `interfaces`
    /// (default: the configured multicast interfaces). Anything else goes out
    /// through the general socket. Fails only if every attempt failed.
    pub async fn send_to(
        &mut self,
        message: &str,
        dest: Ipv4Addr,
        port: u16,
        interfaces: Option<&BTreeSet<Ipv4Addr>>,
    ) -> io::Result<()> {
        let target = SocketAddr::V4(SocketAddrV4::new(dest, port));

        if !dest.is_multicast() {
            self.general.send_to(message.as_bytes(), target).await?;
            tracing::trace!("Sent to {}: {}", target, message);
            return Ok(());
        }

        let interfaces: Vec<Ipv4Addr> = interfaces
            .unwrap_or(&self.multicast_interfaces)
            .iter()
            .copied()
            .collect();
        if interfaces.is_empty() {
            self.general.send_to(message.as_bytes(), target).await?;
            return Ok(());
        }

        let mut last_error = None;
        let mut sent = 0usize;
        for iface in interfaces {
            let result = match self.interface_socket(iface) {
                Ok(socket) => socket.send_to(message.as_bytes(), target).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(_) => {
                    sent += 1;
                    tracing::trace!("Sent to {} via {}: {}", target, iface, message);
                }
                Err(e) => {
                    tracing::debug!("Multicast send to {} via {} failed: {}", target, iface, e);
                    last_error = Some(e);
                }
            }
        }

        match (sent, last_error) {
            (0, Some(e)) => Err(e),
            _ => Ok(()),
        }
    }

    /// Per-interface multicast send socket, created on first use.
    fn interface_socket(&mut self, iface: Ipv4Addr) -> io::Result<&UdpSocket> {
        if !self.per_interface.contains_key(&iface) {
            let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
            socket.set_nonblocking(true)?;
            socket.set_multicast_if_v4(&iface)?;
            socket.set_multicast_ttl_v4(self.ttl)?;
            socket.set_multicast_loop_v4(true)?;
            socket.bind(&SocketAddrV4::new(iface, 0).into())?;
            let socket = UdpSocket::from_std(socket.into())?;
            tracing::debug!("Created multicast send socket on interface {}", iface);
            self.per_interface.insert(iface, socket);
        }
        self.per_interface
            .get(&iface)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "interface socket missing"))
    }

    /// Receive at most one datagram.
    ///
    /// Send sockets are checked without waiting first; then the receive socket
    /// is awaited for at most the poll timeout. `Ok(None)` means nothing arrived.
    pub async fn poll_incoming(&self) -> io::Result<Option<Datagram>> {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];

        for socket in self.per_interface.values().chain(std::iter::once(&self.general)) {
            match socket.try_recv_from(&mut buf) {
                Ok((len, source)) => return Ok(Some(datagram(&buf[..len], source))),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }

        match tokio::time::timeout(self.poll_timeout, self.receiver.recv_from(&mut buf)).await {
            Ok(Ok((len, source))) => Ok(Some(datagram(&buf[..len], source))),
            Ok(Err(e)) => Err(e),
            Err(_elapsed) => Ok(None),
        }
    }

    /// Leave every group and release the sockets.
    pub fn close(mut self) {
        self.leave_all();
        tracing::debug!("Discovery transport on port {} closed", self.port);
    }
}

fn datagram(bytes: &[u8], source: SocketAddr) -> Datagram {
    Datagram {
        payload: String::from_utf8_lossy(bytes).trim().to_string(),
        source,
    }
}
