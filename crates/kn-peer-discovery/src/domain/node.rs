//! Core Domain Entities: node identifiers, roles and node records.

use std::fmt;
use std::hash::Hash as StdHash;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::SystemTime;

use rand::RngCore;
use shared_crypto::{keccak256, Hash, Secp256k1PublicKey};

use super::errors::{DiscoveryError, ParseNodeError};

/// URI scheme of node records.
pub const NODE_URI_SCHEME: &str = "kni";

/// 512-bit node identifier: the uncompressed secp256k1 public key without
/// its SEC1 tag byte.
///
/// # Security
///
/// Comparison is constant-time so that ids cannot be probed byte by byte
/// through timing.
// Hash uses the raw bytes, so equal ids hash equally even though PartialEq
// is hand-written.
#[allow(clippy::derived_hash_with_manual_eq)]
#[derive(Clone, Copy, StdHash)]
pub struct NodeId(pub [u8; 64]);

impl PartialEq for NodeId {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        let mut result = 0u8;
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            result |= a ^ b;
        }
        result == 0
    }
}

impl Eq for NodeId {}

impl NodeId {
    /// Length of an id in bytes.
    pub const LENGTH: usize = 64;

    /// Create a NodeId from raw bytes.
    pub fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// All-zero id, used as a lookup target by flat stores.
    pub fn zero() -> Self {
        Self([0u8; 64])
    }

    /// Random id, used as a refresh target. It is not a valid public key.
    pub fn random() -> Self {
        let mut bytes = [0u8; 64];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Derive the id of a public key.
    pub fn from_public_key(key: &Secp256k1PublicKey) -> Self {
        Self(*key.as_bytes())
    }

    /// Create from a byte slice, checking the length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DiscoveryError> {
        let arr: [u8; 64] = bytes.try_into().map_err(|_| {
            DiscoveryError::InvalidNode(format!("wrong length id, want 64 bytes got {}", bytes.len()))
        })?;
        Ok(Self(arr))
    }

    /// Parse a hex-encoded id (an optional `0x` prefix is accepted).
    pub fn from_hex(s: &str) -> Result<Self, ParseNodeError> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|e| ParseNodeError::InvalidId(e.to_string()))?;
        let arr: [u8; 64] = bytes.as_slice().try_into().map_err(|_| {
            ParseNodeError::InvalidId(format!("wrong length, want 128 hex chars got {}", s.len()))
        })?;
        Ok(Self(arr))
    }

    /// Get the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    /// keccak-256 of the id, the coordinate used for XOR distances.
    pub fn sha(&self) -> Hash {
        keccak256(&self.0)
    }

    /// Reconstruct the public key, checking that the point is on the curve.
    pub fn public_key(&self) -> Result<Secp256k1PublicKey, DiscoveryError> {
        Ok(Secp256k1PublicKey::from_bytes(self.0)?)
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}…)", hex::encode(&self.0[..8]))
    }
}

impl FromStr for NodeId {
    type Err = ParseNodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// Role of a node in the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum NodeType {
    /// Role not announced.
    #[default]
    Unknown = 0,
    /// Consensus node.
    Cn = 1,
    /// Proxy node.
    Pn = 2,
    /// Endpoint node.
    En = 3,
    /// Boot node.
    Bn = 4,
}

impl NodeType {
    /// Every role that can own a store.
    pub const ROLES: [NodeType; 4] = [NodeType::Cn, NodeType::Pn, NodeType::En, NodeType::Bn];

    /// Wire representation.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Short lowercase name as used in node URIs.
    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::Unknown => "unknown",
            NodeType::Cn => "cn",
            NodeType::Pn => "pn",
            NodeType::En => "en",
            NodeType::Bn => "bn",
        }
    }
}

impl From<u8> for NodeType {
    /// Unassigned values decode as `Unknown`.
    fn from(v: u8) -> Self {
        match v {
            1 => NodeType::Cn,
            2 => NodeType::Pn,
            3 => NodeType::En,
            4 => NodeType::Bn,
            _ => NodeType::Unknown,
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_uppercase())
    }
}

impl FromStr for NodeType {
    type Err = ParseNodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cn" => Ok(NodeType::Cn),
            "pn" => Ok(NodeType::Pn),
            "en" => Ok(NodeType::En),
            "bn" => Ok(NodeType::Bn),
            "" | "unknown" => Ok(NodeType::Unknown),
            other => Err(ParseNodeError::InvalidNodeType(other.to_string())),
        }
    }
}

/// A discovered host.
///
/// The record is immutable once built, except for `added_at` which the
/// store sets on admission.
#[derive(Clone)]
pub struct Node {
    /// Public-key identifier.
    pub id: NodeId,
    /// IP address; IPv4-mapped IPv6 is normalized to IPv4.
    pub ip: IpAddr,
    /// Discovery port.
    pub udp: u16,
    /// Session (RLPx) port.
    pub tcp: u16,
    /// Announced role.
    pub node_type: NodeType,
    sha: Hash,
    added_at: Option<SystemTime>,
}

impl Node {
    /// Create a node record.
    pub fn new(id: NodeId, ip: IpAddr, udp: u16, tcp: u16, node_type: NodeType) -> Self {
        Self {
            id,
            ip: ip.to_canonical(),
            udp,
            tcp,
            node_type,
            sha: id.sha(),
            added_at: None,
        }
    }

    /// keccak-256 of the id.
    pub fn sha(&self) -> &Hash {
        &self.sha
    }

    /// When the node entered a store, if it did.
    pub fn added_at(&self) -> Option<SystemTime> {
        self.added_at
    }

    pub(crate) fn set_added_at(&mut self, at: SystemTime) {
        self.added_at = Some(at);
    }

    /// Discovery endpoint.
    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp)
    }

    /// Session endpoint.
    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.tcp)
    }

    /// True for records that carry only an id.
    pub fn incomplete(&self) -> bool {
        self.ip.is_unspecified()
    }

    /// Checks that the node can be contacted and that its id is a valid key.
    pub fn validate_complete(&self) -> Result<(), DiscoveryError> {
        if self.incomplete() {
            return Err(DiscoveryError::IncompleteNode("missing IP address"));
        }
        if self.udp == 0 {
            return Err(DiscoveryError::IncompleteNode("missing UDP port"));
        }
        if self.tcp == 0 {
            return Err(DiscoveryError::IncompleteNode("missing TCP port"));
        }
        if self.ip.is_multicast() {
            return Err(DiscoveryError::InvalidNode(
                "invalid IP (multicast/unspecified)".to_string(),
            ));
        }
        self.id.public_key()?;
        Ok(())
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.ip == other.ip
            && self.udp == other.udp
            && self.tcp == other.tcp
            && self.node_type == other.node_type
    }
}

impl Eq for Node {}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({:?} {} {}", self.id, self.node_type, self.udp_addr())?;
        if self.tcp != self.udp {
            write!(f, " tcp:{}", self.tcp)?;
        }
        f.write_str(")")
    }
}

impl fmt::Display for Node {
    /// Formats the node as a `kni://` URI.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", NODE_URI_SCHEME, self.id)?;
        if self.incomplete() {
            return Ok(());
        }
        write!(f, "@{}", self.tcp_addr())?;
        let mut query = Vec::new();
        if self.udp != self.tcp {
            query.push(format!("discport={}", self.udp));
        }
        if self.node_type != NodeType::Unknown {
            query.push(format!("ntype={}", self.node_type.as_str()));
        }
        if !query.is_empty() {
            write!(f, "?{}", query.join("&"))?;
        }
        Ok(())
    }
}

impl FromStr for Node {
    type Err = ParseNodeError;

    /// Parses `kni://<hex id>@<ip>:<tcp>?discport=<udp>&ntype=<role>`.
    ///
    /// `discport` defaults to the TCP port and `ntype` to unknown. A bare
    /// `kni://<hex id>` yields an incomplete node.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let rest = raw
            .strip_prefix(NODE_URI_SCHEME)
            .and_then(|r| r.strip_prefix("://"))
            .ok_or(ParseNodeError::InvalidScheme)?;

        let Some((id, host)) = rest.split_once('@') else {
            let id = NodeId::from_hex(rest)?;
            return Ok(Node::new(id, IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0, 0, NodeType::Unknown));
        };
        let id = NodeId::from_hex(id)?;

        let (addr, query) = match host.split_once('?') {
            Some((addr, query)) => (addr, Some(query)),
            None => (host, None),
        };
        let tcp_addr: SocketAddr = addr
            .parse()
            .map_err(|_| ParseNodeError::InvalidHost(addr.to_string()))?;

        let mut udp = tcp_addr.port();
        let mut node_type = NodeType::Unknown;
        for pair in query.into_iter().flat_map(|q| q.split('&')) {
            match pair.split_once('=') {
                Some(("discport", v)) => {
                    udp = v
                        .parse()
                        .map_err(|_| ParseNodeError::InvalidPort(v.to_string()))?;
                }
                Some(("ntype", v)) => node_type = v.parse()?,
                _ => {}
            }
        }

        Ok(Node::new(id, tcp_addr.ip(), udp, tcp_addr.port(), node_type))
    }
}

#[cfg(test)]
mod tests;
