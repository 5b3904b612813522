// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gaiandb.org

//! Local IPv4 interface discovery.
//!
//! - Linux: parses `ip -4 addr show` (gives broadcast addresses and alias labels)
//! - Windows/other: uses the `local_ip_address` crate

use std::collections::BTreeSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr};

/// One IPv4 address bound to a local interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalInterface {
    /// Interface label, e.g. `eth0` or `eth0:1` for an alias.
    pub name: String,
    pub addr: Ipv4Addr,
    pub broadcast: Option<Ipv4Addr>,
    /// Alias (sub-)interface such as `eth0:1`.
    pub is_virtual: bool,
}

/// List every local IPv4 address.
pub fn list_ipv4_interfaces() -> io::Result<Vec<LocalInterface>> {
    list_platform()
}

#[cfg(target_os = "linux")]
fn list_platform() -> io::Result<Vec<LocalInterface>> {
    use std::process::Command;

    let output = match Command::new("ip").args(["-4", "addr", "show"]).output() {
        Ok(o) if o.status.success() => o,
        _ => {
            tracing::debug!("'ip' command unavailable, using local_ip_address crate");
            return list_portable();
        }
    };

    let parsed = parse_ip_addr_output(&String::from_utf8_lossy(&output.stdout));
    if parsed.is_empty() {
        return list_portable();
    }
    Ok(parsed)
}

#[cfg(not(target_os = "linux"))]
fn list_platform() -> io::Result<Vec<LocalInterface>> {
    list_portable()
}

fn list_portable() -> io::Result<Vec<LocalInterface>> {
    let interfaces = local_ip_address::list_afinet_netifas()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    Ok(interfaces
        .into_iter()
        .filter_map(|(name, ip)| match ip {
            IpAddr::V4(addr) => Some(LocalInterface {
                is_virtual: name.contains(':'),
                name,
                addr,
                broadcast: None,
            }),
            IpAddr::V6(_) => None,
        })
        .collect())
}

/// Parse the output of `ip -4 addr show`.
///
/// Only `inet` lines matter:
/// `inet 192.168.1.5/24 brd 192.168.1.255 scope global secondary eth0:1`
pub fn parse_ip_addr_output(stdout: &str) -> Vec<LocalInterface> {
    let mut interfaces = Vec::new();

    for line in stdout.lines() {
        let Some(rest) = line.trim().strip_prefix("inet ") else {
            continue;
        };
        let tokens: Vec<&str> = rest.split_whitespace().collect();
        let Some(addr) = tokens
            .first()
            .and_then(|t| t.split('/').next())
            .and_then(|a| a.parse::<Ipv4Addr>().ok())
        else {
            continue;
        };

        let broadcast = tokens
            .iter()
            .position(|t| *t == "brd")
            .and_then(|i| tokens.get(i + 1))
            .and_then(|b| b.parse::<Ipv4Addr>().ok());
        let name = tokens.last().copied().unwrap_or_default().to_string();

        interfaces.push(LocalInterface {
            is_virtual: name.contains(':'),
            name,
            addr,
            broadcast,
        });
    }

    interfaces
}

/// Every local IPv4 address, optionally skipping alias interfaces.
/// Errors yield an empty set, logged.
pub fn local_ipv4_addresses(include_virtual: bool) -> BTreeSet<Ipv4Addr> {
    match list_ipv4_interfaces() {
        Ok(ifs) => ifs
            .into_iter()
            .filter(|i| include_virtual || !i.is_virtual)
            .map(|i| i.addr)
            .collect(),
        Err(e) => {
            tracing::warn!(
                "Unable to resolve local network interfaces (using empty set): {}",
                e
            );
            BTreeSet::new()
        }
    }
}

/// Broadcast address of every local interface that has one.
pub fn broadcast_addresses() -> BTreeSet<Ipv4Addr> {
    list_ipv4_interfaces()
        .map(|ifs| ifs.into_iter().filter_map(|i| i.broadcast).collect())
        .unwrap_or_default()
}

/// Loopback addresses to always include in multicast membership.
pub fn loopback_addresses() -> BTreeSet<Ipv4Addr> {
    BTreeSet::from([Ipv4Addr::LOCALHOST])
}

/// Pick the interface used for multicast by default.
///
/// The first non-loopback, non-alias address wins. With only loopback
/// addresses, the last one found is used.
pub fn default_local_ip() -> io::Result<Ipv4Addr> {
    pick_default(&local_ipv4_addresses(false))
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "No local address found"))
}

fn pick_default(addrs: &BTreeSet<Ipv4Addr>) -> Option<Ipv4Addr> {
    addrs
        .iter()
        .find(|a| !a.is_loopback())
        .or_else(|| addrs.iter().next_back())
        .copied()
}

/// Local address whose dotted form shares the longest prefix with `target`.
///
/// Used to pick the IP a gateway can reply to. Returns `None` when no
/// candidate shares even its first character.
pub fn longest_prefix_match<'a, I>(target: &str, candidates: I) -> Option<Ipv4Addr>
where
    I: IntoIterator<Item = &'a Ipv4Addr>,
{
    let mut best: Option<(usize, Ipv4Addr)> = None;
    for candidate in candidates {
        let text = candidate.to_string();
        let shared = text
            .bytes()
            .zip(target.bytes())
            .take_while(|(a, b)| a == b)
            .count();
        if shared > 0 && best.map_or(true, |(len, _)| shared > len) {
            best = Some((shared, *candidate));
        }
    }
    best.map(|(_, addr)| addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    const IP_OUTPUT: &str = "\
1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 qdisc noqueue state UNKNOWN group default qlen 1000
    inet 127.0.0.1/8 scope host lo
       valid_lft forever preferred_lft forever
2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc fq_codel state UP group default qlen 1000
    inet 192.168.1.5/24 brd 192.168.1.255 scope global dynamic eth0
       valid_lft 85000sec preferred_lft 85000sec
    inet 192.168.1.6/24 brd 192.168.1.255 scope global secondary eth0:1
       valid_lft forever preferred_lft forever
3: docker0: <NO-CARRIER,BROADCAST,MULTICAST,UP> mtu 1500 qdisc noqueue state DOWN group default
    inet 172.17.0.1/16 brd 172.17.255.255 scope global docker0
";

    #[test]
    fn test_parse_ip_addr_output() {
        let ifs = parse_ip_addr_output(IP_OUTPUT);
        assert_eq!(ifs.len(), 4);

        assert_eq!(ifs[0].addr, Ipv4Addr::LOCALHOST);
        assert_eq!(ifs[0].broadcast, None);
        assert_eq!(ifs[0].name, "lo");

        assert_eq!(ifs[1].addr, Ipv4Addr::new(192, 168, 1, 5));
        assert_eq!(ifs[1].broadcast, Some(Ipv4Addr::new(192, 168, 1, 255)));
        assert!(!ifs[1].is_virtual);

        assert_eq!(ifs[2].name, "eth0:1");
        assert!(ifs[2].is_virtual);
    }

    #[test]
    fn test_pick_default() {
        let addrs: BTreeSet<_> = [Ipv4Addr::LOCALHOST, Ipv4Addr::new(10, 0, 0, 4)].into();
        assert_eq!(pick_default(&addrs), Some(Ipv4Addr::new(10, 0, 0, 4)));

        let only_lo: BTreeSet<_> = [Ipv4Addr::LOCALHOST].into();
        assert_eq!(pick_default(&only_lo), Some(Ipv4Addr::LOCALHOST));

        assert_eq!(pick_default(&BTreeSet::new()), None);
    }

    #[test]
    fn test_longest_prefix_match() {
        let locals = [
            Ipv4Addr::new(127, 0, 0, 1),
            Ipv4Addr::new(192, 168, 1, 5),
            Ipv4Addr::new(10, 20, 0, 3),
        ];
        assert_eq!(
            longest_prefix_match("192.168.7.1", &locals),
            Some(Ipv4Addr::new(192, 168, 1, 5))
        );
        assert_eq!(
            longest_prefix_match("10.20.9.9", &locals),
            Some(Ipv4Addr::new(10, 20, 0, 3))
        );
        assert_eq!(longest_prefix_match("gateway.example", &locals), None);
    }
}
