//! Packet framing: `hash(32) || signature(65) || type(1) || rlp(body)`.
//!
//! `hash = keccak256(signature || type || body)` and the signature covers
//! `keccak256(type || body)`. The sender id is recovered from the signature.

use std::net::{IpAddr, Ipv6Addr};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use shared_crypto::{keccak256, recover_public_key, Hash, RecoverableSignature, Secp256k1KeyPair};

use super::messages::{Neighbors, Packet, PacketType, RpcNode};
use crate::domain::{DiscoveryError, NodeId, NodeType, EXPIRATION, MAX_PACKET_SIZE};

/// Length of the leading packet hash.
pub const MAC_SIZE: usize = 32;
/// Length of the recoverable signature.
pub const SIG_SIZE: usize = 65;
/// Header length before the type byte.
pub const HEAD_SIZE: usize = MAC_SIZE + SIG_SIZE;

/// A verified inbound packet.
#[derive(Debug, Clone)]
pub struct DecodedPacket {
    pub packet: Packet,
    /// Sender id recovered from the signature.
    pub from: NodeId,
    /// Leading hash; PONG echoes it as `reply_tok`.
    pub hash: Hash,
}

/// Frame and sign `packet`, returning the datagram and its hash.
pub fn encode_packet(
    key: &Secp256k1KeyPair,
    packet: &Packet,
) -> Result<(Vec<u8>, Hash), DiscoveryError> {
    let body = packet.rlp_body();
    let mut buf = Vec::with_capacity(HEAD_SIZE + 1 + body.len());
    buf.resize(HEAD_SIZE, 0);
    buf.push(packet.packet_type().as_u8());
    buf.extend_from_slice(&body);

    let digest = keccak256(&buf[HEAD_SIZE..]);
    let sig = key.sign_recoverable(&digest)?;
    buf[MAC_SIZE..HEAD_SIZE].copy_from_slice(sig.as_bytes());

    let hash = keccak256(&buf[MAC_SIZE..]);
    buf[..MAC_SIZE].copy_from_slice(&hash);
    Ok((buf, hash))
}

/// Verify and decode a datagram.
pub fn decode_packet(buf: &[u8]) -> Result<DecodedPacket, DiscoveryError> {
    if buf.len() < HEAD_SIZE + 1 {
        return Err(DiscoveryError::PacketTooSmall);
    }
    let (hash, rest) = buf.split_at(MAC_SIZE);
    let should_hash = keccak256(rest);
    if hash != should_hash.as_slice() {
        return Err(DiscoveryError::BadHash);
    }

    let sig = RecoverableSignature::from_slice(&buf[MAC_SIZE..HEAD_SIZE])?;
    let sigdata = &buf[HEAD_SIZE..];
    let key = recover_public_key(&keccak256(sigdata), &sig)?;
    let from = NodeId::from_public_key(&key);

    let ptype = PacketType::try_from(sigdata[0]).map_err(DiscoveryError::UnknownPacketType)?;
    let packet = Packet::decode_body(ptype, &sigdata[1..])?;
    Ok(DecodedPacket {
        packet,
        from,
        hash: should_hash,
    })
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Expiration stamp for an outbound packet.
pub fn expiration_from_now() -> u64 {
    unix_now() + EXPIRATION.as_secs()
}

/// Reports whether an absolute unix timestamp lies in the past.
pub fn expired(ts: u64) -> bool {
    ts < unix_now()
}

/// Largest number of maximum-size node records that fit in one NEIGHBORS
/// datagram.
pub fn max_neighbors() -> usize {
    static MAX_NEIGHBORS: OnceLock<usize> = OnceLock::new();
    *MAX_NEIGHBORS.get_or_init(|| {
        let max_node = RpcNode {
            ip: IpAddr::V6(Ipv6Addr::new(0xffff, 1, 1, 1, 1, 1, 1, 1)),
            udp: u16::MAX,
            tcp: u16::MAX,
            id: NodeId::new([0xff; 64]),
            node_type: NodeType::Bn,
        };
        let mut p = Neighbors {
            target_type: NodeType::Bn,
            nodes: Vec::new(),
            expiration: u64::MAX,
        };
        let mut n = 0;
        loop {
            p.nodes.push(max_node.clone());
            let size = rlp::encode(&p).len();
            if HEAD_SIZE + size + 1 >= MAX_PACKET_SIZE {
                return n;
            }
            n += 1;
        }
    })
}
