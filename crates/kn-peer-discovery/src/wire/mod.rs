//! # Wire Protocol
//!
//! Discovery v4 packets as exchanged over UDP. See [`codec`] for the
//! framing and [`messages`] for the payloads.

pub mod codec;
pub mod messages;

pub use codec::{
    decode_packet, encode_packet, expiration_from_now, expired, max_neighbors, DecodedPacket,
    HEAD_SIZE, MAC_SIZE, SIG_SIZE,
};
pub use messages::{Endpoint, FindNode, Neighbors, Packet, PacketType, Ping, Pong, RpcNode};
