//! RLP payloads of the four discovery packets.
//!
//! Every payload is an RLP list. Decoders read fields by position and ignore
//! trailing items, so newer peers can append fields.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};

use crate::domain::{Node, NodeId, NodeType};

/// Packet type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Ping = 1,
    Pong = 2,
    FindNode = 3,
    Neighbors = 4,
}

impl PacketType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            PacketType::Ping => "PING/v4",
            PacketType::Pong => "PONG/v4",
            PacketType::FindNode => "FINDNODE/v4",
            PacketType::Neighbors => "NEIGHBORS/v4",
        }
    }
}

impl TryFrom<u8> for PacketType {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(PacketType::Ping),
            2 => Ok(PacketType::Pong),
            3 => Ok(PacketType::FindNode),
            4 => Ok(PacketType::Neighbors),
            other => Err(other),
        }
    }
}

// =============================================================================
// Field helpers
// =============================================================================

fn ip_bytes(ip: &IpAddr) -> Vec<u8> {
    match ip.to_canonical() {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Result<IpAddr, DecoderError> {
    match bytes.len() {
        0 => Ok(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        4 => {
            let arr: [u8; 4] = bytes.try_into().map_err(|_| DecoderError::RlpInvalidLength)?;
            Ok(IpAddr::V4(Ipv4Addr::from(arr)))
        }
        16 => {
            let arr: [u8; 16] = bytes.try_into().map_err(|_| DecoderError::RlpInvalidLength)?;
            Ok(IpAddr::V6(Ipv6Addr::from(arr)).to_canonical())
        }
        _ => Err(DecoderError::Custom("invalid IP length")),
    }
}

fn expect_list(rlp: &Rlp) -> Result<(), DecoderError> {
    if rlp.is_list() {
        Ok(())
    } else {
        Err(DecoderError::RlpExpectedToBeList)
    }
}

fn decode_node_id(rlp: &Rlp) -> Result<NodeId, DecoderError> {
    let bytes: Vec<u8> = rlp.as_val()?;
    let arr: [u8; 64] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| DecoderError::RlpInvalidLength)?;
    Ok(NodeId::new(arr))
}

fn decode_node_type(rlp: &Rlp) -> Result<NodeType, DecoderError> {
    Ok(NodeType::from(rlp.as_val::<u8>()?))
}

// =============================================================================
// Endpoint and node records
// =============================================================================

/// Network endpoint carried in PING and PONG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub udp: u16,
    pub tcp: u16,
    pub node_type: NodeType,
}

impl Endpoint {
    /// Endpoint for a UDP address, normalizing IPv4-mapped addresses.
    pub fn new(addr: SocketAddr, tcp: u16, node_type: NodeType) -> Self {
        Self {
            ip: addr.ip().to_canonical(),
            udp: addr.port(),
            tcp,
            node_type,
        }
    }
}

impl Encodable for Endpoint {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(4);
        s.append(&ip_bytes(&self.ip));
        s.append(&self.udp);
        s.append(&self.tcp);
        s.append(&self.node_type.as_u8());
    }
}

impl Decodable for Endpoint {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        expect_list(rlp)?;
        Ok(Self {
            ip: ip_from_bytes(&rlp.val_at::<Vec<u8>>(0)?)?,
            udp: rlp.val_at(1)?,
            tcp: rlp.val_at(2)?,
            node_type: decode_node_type(&rlp.at(3)?)?,
        })
    }
}

/// Node record carried in NEIGHBORS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcNode {
    pub ip: IpAddr,
    pub udp: u16,
    pub tcp: u16,
    pub id: NodeId,
    pub node_type: NodeType,
}

impl From<&Node> for RpcNode {
    fn from(n: &Node) -> Self {
        Self {
            ip: n.ip,
            udp: n.udp,
            tcp: n.tcp,
            id: n.id,
            node_type: n.node_type,
        }
    }
}

impl Encodable for RpcNode {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(5);
        s.append(&ip_bytes(&self.ip));
        s.append(&self.udp);
        s.append(&self.tcp);
        s.append(&self.id.as_bytes().to_vec());
        s.append(&self.node_type.as_u8());
    }
}

impl Decodable for RpcNode {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        expect_list(rlp)?;
        Ok(Self {
            ip: ip_from_bytes(&rlp.val_at::<Vec<u8>>(0)?)?,
            udp: rlp.val_at(1)?,
            tcp: rlp.val_at(2)?,
            id: decode_node_id(&rlp.at(3)?)?,
            node_type: decode_node_type(&rlp.at(4)?)?,
        })
    }
}

// =============================================================================
// Packets
// =============================================================================

/// Liveness probe; also announces the sender's network and endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ping {
    pub network_id: u64,
    pub version: u32,
    pub from: Endpoint,
    pub to: Endpoint,
    pub expiration: u64,
}

impl Encodable for Ping {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(5);
        s.append(&self.network_id);
        s.append(&self.version);
        s.append(&self.from);
        s.append(&self.to);
        s.append(&self.expiration);
    }
}

impl Decodable for Ping {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        expect_list(rlp)?;
        Ok(Self {
            network_id: rlp.val_at(0)?,
            version: rlp.val_at(1)?,
            from: rlp.val_at(2)?,
            to: rlp.val_at(3)?,
            expiration: rlp.val_at(4)?,
        })
    }
}

/// Reply to PING. `to` mirrors the envelope address the ping came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pong {
    pub to: Endpoint,
    /// Hash of the PING being answered.
    pub reply_tok: Vec<u8>,
    pub expiration: u64,
}

impl Encodable for Pong {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(3);
        s.append(&self.to);
        s.append(&self.reply_tok);
        s.append(&self.expiration);
    }
}

impl Decodable for Pong {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        expect_list(rlp)?;
        Ok(Self {
            to: rlp.val_at(0)?,
            reply_tok: rlp.val_at(1)?,
            expiration: rlp.val_at(2)?,
        })
    }
}

/// Query for peers of `target_type` close to `target`.
///
/// `target` does not need to be a valid public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindNode {
    pub target: NodeId,
    pub target_type: NodeType,
    pub expiration: u64,
}

impl Encodable for FindNode {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(3);
        s.append(&self.target.as_bytes().to_vec());
        s.append(&self.target_type.as_u8());
        s.append(&self.expiration);
    }
}

impl Decodable for FindNode {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        expect_list(rlp)?;
        Ok(Self {
            target: decode_node_id(&rlp.at(0)?)?,
            target_type: decode_node_type(&rlp.at(1)?)?,
            expiration: rlp.val_at(2)?,
        })
    }
}

/// Reply to FINDNODE. A reply may span several datagrams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbors {
    pub target_type: NodeType,
    pub nodes: Vec<RpcNode>,
    pub expiration: u64,
}

impl Encodable for Neighbors {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(3);
        s.append(&self.target_type.as_u8());
        s.append_list::<RpcNode, RpcNode>(&self.nodes);
        s.append(&self.expiration);
    }
}

impl Decodable for Neighbors {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        expect_list(rlp)?;
        Ok(Self {
            target_type: decode_node_type(&rlp.at(0)?)?,
            nodes: rlp.list_at(1)?,
            expiration: rlp.val_at(2)?,
        })
    }
}

/// A decoded packet body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Ping(Ping),
    Pong(Pong),
    FindNode(FindNode),
    Neighbors(Neighbors),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Ping(_) => PacketType::Ping,
            Packet::Pong(_) => PacketType::Pong,
            Packet::FindNode(_) => PacketType::FindNode,
            Packet::Neighbors(_) => PacketType::Neighbors,
        }
    }

    pub fn name(&self) -> &'static str {
        self.packet_type().name()
    }

    /// Absolute expiry in unix seconds.
    pub fn expiration(&self) -> u64 {
        match self {
            Packet::Ping(p) => p.expiration,
            Packet::Pong(p) => p.expiration,
            Packet::FindNode(p) => p.expiration,
            Packet::Neighbors(p) => p.expiration,
        }
    }

    pub(crate) fn rlp_body(&self) -> Vec<u8> {
        match self {
            Packet::Ping(p) => rlp::encode(p).to_vec(),
            Packet::Pong(p) => rlp::encode(p).to_vec(),
            Packet::FindNode(p) => rlp::encode(p).to_vec(),
            Packet::Neighbors(p) => rlp::encode(p).to_vec(),
        }
    }

    pub(crate) fn decode_body(ptype: PacketType, body: &[u8]) -> Result<Self, DecoderError> {
        let rlp = Rlp::new(body);
        Ok(match ptype {
            PacketType::Ping => Packet::Ping(rlp.as_val()?),
            PacketType::Pong => Packet::Pong(rlp.as_val()?),
            PacketType::FindNode => Packet::FindNode(rlp.as_val()?),
            PacketType::Neighbors => Packet::Neighbors(rlp.as_val()?),
        })
    }
}
