//! Domain Errors for Peer Discovery

use shared_crypto::CryptoError;
use thiserror::Error;

use super::netutil::NetError;
use super::node::NodeType;

/// Errors that can occur during discovery operations.
///
/// Bond results are shared between every caller waiting on the same
/// handshake, so the type is `Clone`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    /// Inbound datagram shorter than the packet header plus type byte
    #[error("too small")]
    PacketTooSmall,
    /// Leading hash does not match the packet body
    #[error("bad hash")]
    BadHash,
    /// Expiration timestamp lies in the past
    #[error("expired")]
    Expired,
    /// Reply without a matching pending request
    #[error("unsolicited reply")]
    UnsolicitedReply,
    /// Findnode from a peer without a live bond
    #[error("unknown node")]
    UnknownNode,
    /// Pending deadline elapsed
    #[error("RPC timeout")]
    Timeout,
    /// Pending deadline too far in the future
    #[error("reply deadline too far in the future")]
    ClockWarp,
    /// Transport closed while a request was pending
    #[error("socket closed")]
    Closed,
    /// Ping from an id missing from a non-empty allow-list
    #[error("unauthorized node")]
    Unauthorized,
    /// Ping carrying another network id
    #[error("mismatch network id: local {local}, remote {remote}")]
    MismatchNetwork {
        /// Our network id
        local: u64,
        /// Network id in the packet
        remote: u64,
    },

    /// Attempt to bond with the local node
    #[error("is self")]
    SelfBond,
    /// Inbound bond before the first refresh completed
    #[error("still initializing")]
    StillInitializing,
    /// Neighbor advertised a privileged UDP port
    #[error("low port")]
    LowPort,
    /// Neighbor IP inconsistent with the relaying sender
    #[error("relay IP rejected: {0}")]
    RelayIp(#[from] NetError),
    /// Neighbor outside the configured CIDR allow-list
    #[error("not contained in netrestrict whitelist")]
    Restricted,
    /// Node record lacks a required field
    #[error("incomplete node: {0}")]
    IncompleteNode(&'static str),
    /// Node record is malformed
    #[error("invalid node: {0}")]
    InvalidNode(String),
    /// Packet type byte not recognised
    #[error("unknown packet type: {0}")]
    UnknownPacketType(u8),
    /// RLP payload could not be decoded
    #[error("packet decode failed: {0}")]
    Decode(String),
    /// Signing or sender recovery failed
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    /// Socket error
    #[error("I/O error: {0}")]
    Io(String),
    /// Node database error
    #[error("database error: {0}")]
    Database(String),
    /// Requested node is not known
    #[error("node not found")]
    NodeNotFound,
    /// No store is installed for the role
    #[error("unsupported node type: {0}")]
    UnsupportedNodeType(NodeType),
}

impl From<rlp::DecoderError> for DiscoveryError {
    fn from(e: rlp::DecoderError) -> Self {
        Self::Decode(e.to_string())
    }
}

impl From<std::io::Error> for DiscoveryError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Errors from parsing a `kni://` node URI.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseNodeError {
    /// URI does not start with `kni://`
    #[error("invalid URL scheme, want \"kni\"")]
    InvalidScheme,
    /// Node id is not 64 hex-encoded bytes
    #[error("invalid node ID: {0}")]
    InvalidId(String),
    /// Host part is not an IP literal with a port
    #[error("invalid host: {0}")]
    InvalidHost(String),
    /// Port or discport is not a 16-bit number
    #[error("invalid port: {0}")]
    InvalidPort(String),
    /// `ntype` query parameter is not a known role
    #[error("invalid node type: {0}")]
    InvalidNodeType(String),
}
