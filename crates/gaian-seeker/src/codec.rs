// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gaiandb.org

//! Discovery wire codec.
//!
//! Discovery messages are single UDP datagrams of space-delimited UTF-8 text:
//!
//! ```text
//! REQ <origin-node-id> <destination-or-reply-ip> [ARG='VAL' ...]
//! ACK <target-node-id> <sender-node-id> <user> <scrambled-pwd> <version> [ssl='<mode>'] [ARG='VAL' ...]
//! X<original-sender-ip> <REQ-or-ACK>
//! ```
//!
//! The `X` form is a re-broadcast envelope added by a relaying node so the
//! receiver can attribute the message to its original sender.
//!
//! For backwards compatibility the first two tokens must always be the
//! message kind followed by the origin (REQ) or target (ACK) node id.

use std::fmt;
use std::net::IpAddr;
use thiserror::Error;

/// Opaque peer identifier, conventionally `<host>[:<port>]`.
pub type NodeId = String;

/// Sentinel byte that opens a re-broadcast envelope.
pub const ENVELOPE_SENTINEL: char = 'X';

/// Cluster membership list (comma separated).
pub const ARG_ACCESS_CLUSTERS: &str = "ACCESS_CLUSTERS";

/// Connection strategy selector.
pub const ARG_CONNECTION_STRATEGY: &str = "CONNECTION_STRATEGY";

/// SSL mode of the acknowledging node.
pub const ARG_SSL: &str = "ssl";

const REQUEST_PREFIX: &str = "REQ";
const ACK_PREFIX: &str = "ACK";

/// Codec errors. All of them mean "drop the datagram".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("message has fewer than two tokens")]
    TooShort,

    #[error("unrecognized message kind: {0}")]
    Unrecognized(String),

    #[error("ACK is missing its {0} field")]
    IncompleteAck(&'static str),

    #[error("re-broadcast envelope has no resolvable original sender")]
    BadEnvelope,
}

/// Ordered `NAME='VALUE'` arguments carried at the tail of a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageArgs(Vec<(String, String)>);

impl MessageArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an argument. Later duplicates shadow earlier ones on lookup.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Builder form of [`push`](Self::push).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Parse `A1='V1' A2='V2' ...`.
    ///
    /// A quote inside a value is written twice. Parsing stops silently at the
    /// first token that is not well formed; everything before it is kept.
    pub fn parse(input: &str) -> Self {
        let mut args = Self::new();
        let mut rest = input;

        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }

            let Some(eq) = rest.find('=') else { break };
            let name = &rest[..eq];
            if name.is_empty() || name.contains(' ') {
                break;
            }

            let Some(quoted) = rest[eq + 1..].strip_prefix('\'') else {
                break;
            };

            let Some((value, consumed)) = scan_quoted(quoted) else {
                break;
            };

            args.push(name, value);
            rest = &quoted[consumed..];
        }

        args
    }
}

/// Scan a quoted value whose opening quote was already stripped.
/// Returns the unescaped value and the number of bytes consumed including
/// the closing quote.
fn scan_quoted(s: &str) -> Option<(String, usize)> {
    let bytes = s.as_bytes();
    let mut value = String::new();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\'' {
            value.push_str(&s[start..i]);
            if bytes.get(i + 1) == Some(&b'\'') {
                value.push('\'');
                i += 2;
                start = i;
                continue;
            }
            return Some((value, i + 1));
        }
        i += 1;
    }

    None
}

impl fmt::Display for MessageArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}='{}'", name, value.replace('\'', "''"))?;
        }
        Ok(())
    }
}

/// `REQ`: solicits acknowledgments from peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub origin: NodeId,
    /// Discovery address the REQ was sent to, or the requester's own IP when
    /// it asks the receiver to act as a gateway.
    pub destination: String,
    pub args: MessageArgs,
}

/// `ACK`: grants a handshake to the target node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgment {
    pub target: NodeId,
    pub sender: NodeId,
    pub user: String,
    pub scrambled_password: String,
    /// Absent on very old peers.
    pub version: Option<String>,
    pub args: MessageArgs,
}

impl Acknowledgment {
    pub fn ssl_mode(&self) -> Option<&str> {
        self.args.get(ARG_SSL)
    }
}

/// Decoded discovery message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryMessage {
    Request(Request),
    Acknowledgment(Acknowledgment),
}

impl DiscoveryMessage {
    /// Node id in second position: REQ origin or ACK target.
    pub fn addressed_node(&self) -> &str {
        match self {
            Self::Request(r) => &r.origin,
            Self::Acknowledgment(a) => &a.target,
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", REQUEST_PREFIX, self.origin, self.destination)?;
        if !self.args.is_empty() {
            write!(f, " {}", self.args)?;
        }
        Ok(())
    }
}

impl fmt::Display for Acknowledgment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            ACK_PREFIX, self.target, self.sender, self.user, self.scrambled_password
        )?;
        if let Some(version) = &self.version {
            write!(f, " {}", version)?;
        }
        if !self.args.is_empty() {
            write!(f, " {}", self.args)?;
        }
        Ok(())
    }
}

impl fmt::Display for DiscoveryMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request(r) => r.fmt(f),
            Self::Acknowledgment(a) => a.fmt(f),
        }
    }
}

/// Build a `REQ` line.
pub fn encode_request(origin: &str, destination: &str, args: &MessageArgs) -> String {
    Request {
        origin: origin.to_string(),
        destination: destination.to_string(),
        args: args.clone(),
    }
    .to_string()
}

/// Build an `ACK` line. The SSL mode, when set, is always the first argument.
pub fn encode_acknowledgment(
    target: &str,
    sender: &str,
    user: &str,
    scrambled_password: &str,
    version: &str,
    ssl_mode: Option<&str>,
    extra: &MessageArgs,
) -> String {
    let mut args = MessageArgs::new();
    if let Some(mode) = ssl_mode {
        args.push(ARG_SSL, mode);
    }
    for (name, value) in extra.iter() {
        args.push(name, value);
    }

    Acknowledgment {
        target: target.to_string(),
        sender: sender.to_string(),
        user: user.to_string(),
        scrambled_password: scrambled_password.to_string(),
        version: Some(version.to_string()),
        args,
    }
    .to_string()
}

/// Decode a bare (non-enveloped) message.
pub fn decode(raw: &str) -> Result<DiscoveryMessage, CodecError> {
    let msg = raw.trim();
    let (kind, body) = msg.split_once(' ').ok_or(CodecError::TooShort)?;
    let body = body.trim_start_matches(' ');
    if body.is_empty() {
        return Err(CodecError::TooShort);
    }

    match kind {
        REQUEST_PREFIX => {
            let mut parts = body.splitn(3, ' ');
            let origin = parts.next().unwrap_or_default().to_string();
            let destination = parts.next().unwrap_or_default().trim().to_string();
            let args = parts.next().map(MessageArgs::parse).unwrap_or_default();
            Ok(DiscoveryMessage::Request(Request {
                origin,
                destination,
                args,
            }))
        }
        ACK_PREFIX => {
            let mut parts = body.splitn(6, ' ');
            let target = parts.next().unwrap_or_default().to_string();
            let sender = non_empty(parts.next()).ok_or(CodecError::IncompleteAck("sender"))?;
            let user = non_empty(parts.next()).ok_or(CodecError::IncompleteAck("user"))?;
            let scrambled_password =
                non_empty(parts.next()).ok_or(CodecError::IncompleteAck("password"))?;
            let version = non_empty(parts.next());
            let args = parts.next().map(MessageArgs::parse).unwrap_or_default();
            Ok(DiscoveryMessage::Acknowledgment(Acknowledgment {
                target,
                sender,
                user,
                scrambled_password,
                version,
                args,
            }))
        }
        other => Err(CodecError::Unrecognized(other.to_string())),
    }
}

fn non_empty(token: Option<&str>) -> Option<String> {
    token
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

/// Wrap a message in a re-broadcast envelope naming its original sender.
pub fn wrap_envelope(original_sender: IpAddr, message: &str) -> String {
    format!("{}{} {}", ENVELOPE_SENTINEL, original_sender, message)
}

/// Split a re-broadcast envelope.
///
/// Returns `Ok(None)` for a bare message, `Ok(Some((ip, inner)))` for an
/// enveloped one.
pub fn unwrap_envelope(raw: &str) -> Result<Option<(IpAddr, &str)>, CodecError> {
    let Some(rest) = raw.strip_prefix(ENVELOPE_SENTINEL) else {
        return Ok(None);
    };

    let (ip, inner) = rest.split_once(' ').ok_or(CodecError::BadEnvelope)?;
    if inner.is_empty() {
        return Err(CodecError::BadEnvelope);
    }
    let ip: IpAddr = ip.parse().map_err(|_| CodecError::BadEnvelope)?;
    Ok(Some((ip, inner)))
}

/// Split a comma separated property or argument into trimmed, non-empty items.
pub fn split_commas(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}
