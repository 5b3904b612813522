// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gaiandb.org

//! Discovery target and multicast interface resolution.
//!
//! `DISCOVERY_IP` selects where REQs go:
//! - unset: the default multicast group `230.255.255.255`
//! - `BROADCAST_ALL`: the broadcast address of every local interface
//! - `a,b,c`: each listed address (multicast, broadcast or unicast)
//! - a single multicast, broadcast or unicast address
//!
//! `MULTICAST_INTERFACES` selects which local interfaces join the group and
//! send multicast REQs. Loopback is always included so that nodes on the
//! same host find each other.

use crate::codec::split_commas;
use crate::config::{ALL_INTERFACES, BROADCAST_ALL};
use crate::interfaces;
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};

/// Snapshot of the local addressing, taken once per watchdog tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalAddresses {
    /// Interface used for multicast when none is configured.
    pub default_ip: Option<Ipv4Addr>,
    /// Every non-alias local IPv4 address, loopback included.
    pub all: BTreeSet<Ipv4Addr>,
    /// Broadcast address of every interface that has one.
    pub broadcasts: BTreeSet<Ipv4Addr>,
}

impl LocalAddresses {
    /// Query the operating system.
    pub fn probe() -> Self {
        let default_ip = match interfaces::default_local_ip() {
            Ok(ip) => Some(ip),
            Err(e) => {
                tracing::debug!("No default local IP: {}", e);
                None
            }
        };
        Self {
            default_ip,
            all: interfaces::local_ipv4_addresses(false),
            broadcasts: interfaces::broadcast_addresses(),
        }
    }

    /// Check if `ip` belongs to this host.
    pub fn is_local(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => v4.is_loopback() || self.all.contains(&v4),
            IpAddr::V6(v6) => v6.is_loopback(),
        }
    }
}

/// Where discovery REQs are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryTargets {
    /// One multicast group, sent on every multicast interface.
    Multicast(Ipv4Addr),
    /// One broadcast or unicast address.
    Single(Ipv4Addr),
    /// Several addresses, each sent to in turn.
    List(Vec<Ipv4Addr>),
}

impl DiscoveryTargets {
    pub fn addresses(&self) -> Vec<Ipv4Addr> {
        match self {
            Self::Multicast(group) => vec![*group],
            Self::Single(addr) => vec![*addr],
            Self::List(addrs) => addrs.clone(),
        }
    }

    /// Multicast groups to join among the targets.
    pub fn multicast_groups(&self) -> Vec<Ipv4Addr> {
        self.addresses()
            .into_iter()
            .filter(Ipv4Addr::is_multicast)
            .collect()
    }
}

/// Resolve the `DISCOVERY_IP` property.
///
/// Unresolvable entries are logged and skipped.
pub fn resolve_targets(discovery_ip: &str, local: &LocalAddresses) -> DiscoveryTargets {
    let value = discovery_ip.trim();

    if value.eq_ignore_ascii_case(BROADCAST_ALL) {
        return DiscoveryTargets::List(local.broadcasts.iter().copied().collect());
    }

    if value.contains(',') {
        let addrs = split_commas(value).filter_map(resolve_host).collect();
        return DiscoveryTargets::List(addrs);
    }

    match resolve_host(value) {
        Some(addr) if addr.is_multicast() => DiscoveryTargets::Multicast(addr),
        Some(addr) => DiscoveryTargets::Single(addr),
        None => DiscoveryTargets::List(Vec::new()),
    }
}

/// Resolve the `MULTICAST_INTERFACES` property to local addresses.
pub fn resolve_interfaces(property: Option<&str>, local: &LocalAddresses) -> BTreeSet<Ipv4Addr> {
    let mut selected: BTreeSet<Ipv4Addr> = match property.map(str::trim) {
        None | Some("") => local.default_ip.into_iter().collect(),
        Some(p) if p.eq_ignore_ascii_case(ALL_INTERFACES) => local.all.clone(),
        Some(p) => split_commas(p)
            .filter_map(|entry| match entry.parse::<Ipv4Addr>() {
                Ok(addr) => Some(addr),
                Err(_) => {
                    tracing::warn!("Ignoring invalid multicast interface address: {}", entry);
                    None
                }
            })
            .collect(),
    };

    selected.extend(interfaces::loopback_addresses());
    selected
}

/// Resolve a host name or dotted address to an IPv4 address.
///
/// Blocks on the system resolver; run it off the async runtime.
pub fn resolve_host(host: &str) -> Option<Ipv4Addr> {
    if let Ok(addr) = host.parse::<Ipv4Addr>() {
        return Some(addr);
    }

    let resolved = (host, 0u16)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.find_map(|a| first_v4(a.ip())));
    if resolved.is_none() {
        tracing::warn!("Unable to resolve discovery address: {}", host);
    }
    resolved
}

/// Async counterpart of [`resolve_host`], safe to await on the runtime.
pub async fn lookup_host(host: &str) -> Option<Ipv4Addr> {
    if let Ok(addr) = host.parse::<Ipv4Addr>() {
        return Some(addr);
    }

    let resolved = match tokio::net::lookup_host((host, 0u16)).await {
        Ok(mut addrs) => addrs.find_map(|a| first_v4(a.ip())),
        Err(e) => {
            tracing::debug!("Lookup of {} failed: {}", host, e);
            None
        }
    };
    if resolved.is_none() {
        tracing::warn!("Unable to resolve discovery address: {}", host);
    }
    resolved
}

fn first_v4(ip: IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(_) => None,
    }
}
