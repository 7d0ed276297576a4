//! Inbound packet handlers.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use shared_crypto::{keccak256, Hash};
use tracing::{debug, trace, warn};

use super::UdpTransport;
use crate::domain::{check_relay_ip, DiscoveryError, NodeId, NodeType, BUCKET_SIZE};
use crate::ports::inbound::Discovery;
use crate::table::Table;
use crate::wire::{
    decode_packet, expiration_from_now, expired, max_neighbors, Endpoint, FindNode, Neighbors,
    Packet, PacketType, Ping, Pong, RpcNode,
};

/// Decode one datagram and dispatch it by type.
pub(super) async fn handle_packet(
    t: &UdpTransport,
    tab: &Arc<Table>,
    from: SocketAddr,
    buf: &[u8],
) -> Result<(), DiscoveryError> {
    let decoded = match decode_packet(buf) {
        Ok(d) => d,
        Err(e) => {
            warn!(addr = %from, error = %e, "Bad discovery packet");
            return Err(e);
        }
    };
    trace!(addr = %from, packet = decoded.packet.name(), "<< packet");

    let from_id = decoded.from;
    let result = match decoded.packet {
        Packet::Ping(req) => handle_ping(t, tab, from, from_id, decoded.hash, req).await,
        Packet::Pong(req) => handle_pong(t, from_id, req).await,
        Packet::FindNode(req) => handle_find_node(t, tab, from, from_id, req).await,
        Packet::Neighbors(req) => handle_neighbors(t, from_id, req).await,
    };
    if let Err(e) = &result {
        debug!(addr = %from, id = ?from_id, error = %e, "Failed to handle packet");
    }
    result
}

async fn handle_ping(
    t: &UdpTransport,
    tab: &Arc<Table>,
    from: SocketAddr,
    from_id: NodeId,
    hash: Hash,
    req: Ping,
) -> Result<(), DiscoveryError> {
    let node_type = req.from.node_type;
    if !tab.is_authorized(&from_id, node_type) {
        trace!(id = ?from_id, %node_type, "Unauthorized node");
        return Err(DiscoveryError::Unauthorized);
    }
    if cfg!(feature = "reject-unknown-ping") && node_type == NodeType::Unknown {
        trace!(id = ?from_id, "Ping from node of unknown type");
        return Err(DiscoveryError::Unauthorized);
    }
    if req.network_id != t.network_id {
        t.mismatch_network.fetch_add(1, Ordering::Relaxed);
        debug!(local = t.network_id, remote = req.network_id, "Ping from another network");
        return Err(DiscoveryError::MismatchNetwork {
            local: t.network_id,
            remote: req.network_id,
        });
    }
    if expired(req.expiration) {
        return Err(DiscoveryError::Expired);
    }

    let pong = Packet::Pong(Pong {
        to: Endpoint::new(from, req.from.tcp, node_type),
        reply_tok: hash.to_vec(),
        expiration: expiration_from_now(),
    });
    if let Err(e) = t.send(from, &pong).await {
        trace!(%from, error = %e, "Failed to send pong");
    }

    let tcp = req.from.tcp;
    if !t.pending.handle_reply(from_id, PacketType::Ping, Packet::Ping(req)).await {
        // Unprompted ping: bond back. The advertised IP is ignored.
        let tab = Arc::clone(tab);
        tokio::spawn(async move {
            if let Err(e) = tab.bond(true, from_id, from, tcp, node_type).await {
                trace!(id = ?from_id, error = %e, "Bond after ping failed");
            }
        });
    }
    Ok(())
}

async fn handle_pong(t: &UdpTransport, from_id: NodeId, req: Pong) -> Result<(), DiscoveryError> {
    if expired(req.expiration) {
        return Err(DiscoveryError::Expired);
    }
    if !t.pending.handle_reply(from_id, PacketType::Pong, Packet::Pong(req)).await {
        return Err(DiscoveryError::UnsolicitedReply);
    }
    Ok(())
}

async fn handle_find_node(
    t: &UdpTransport,
    tab: &Table,
    from: SocketAddr,
    from_id: NodeId,
    req: FindNode,
) -> Result<(), DiscoveryError> {
    if expired(req.expiration) {
        return Err(DiscoveryError::Expired);
    }
    // Answering unbonded peers would let a spoofed source address turn us
    // into a traffic amplifier.
    if !tab.has_bond(&from_id) {
        return Err(DiscoveryError::UnknownNode);
    }

    let target = keccak256(req.target.as_bytes());
    let closest = tab.retrieve_nodes(&target, req.target_type, BUCKET_SIZE);

    let chunk = neighbors_per_packet(t.max_neighbors_node);
    let mut p = Neighbors {
        target_type: req.target_type,
        nodes: Vec::with_capacity(chunk),
        expiration: expiration_from_now(),
    };
    let mut sent = false;
    for n in &closest {
        if check_relay_ip(from.ip().to_canonical(), n.ip).is_ok() {
            p.nodes.push(RpcNode::from(n));
        }
        if p.nodes.len() == chunk {
            send_neighbors(t, from, &p).await;
            p.nodes.clear();
            sent = true;
        }
    }
    if !p.nodes.is_empty() || !sent {
        send_neighbors(t, from, &p).await;
    }
    Ok(())
}

/// Records per NEIGHBORS datagram, optionally capped by configuration.
fn neighbors_per_packet(max_neighbors_node: usize) -> usize {
    match max_neighbors_node {
        0 => max_neighbors(),
        n => n.min(max_neighbors()),
    }
}

async fn send_neighbors(t: &UdpTransport, to: SocketAddr, p: &Neighbors) {
    let packet = Packet::Neighbors(p.clone());
    if let Err(e) = t.send(to, &packet).await {
        trace!(%to, error = %e, "Failed to send neighbors");
    }
}

async fn handle_neighbors(
    t: &UdpTransport,
    from_id: NodeId,
    req: Neighbors,
) -> Result<(), DiscoveryError> {
    if expired(req.expiration) {
        return Err(DiscoveryError::Expired);
    }
    if !t.pending.handle_reply(from_id, PacketType::Neighbors, Packet::Neighbors(req)).await {
        return Err(DiscoveryError::UnsolicitedReply);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_neighbors_per_packet_respects_cap() {
        assert_eq!(neighbors_per_packet(0), max_neighbors());
        assert_eq!(neighbors_per_packet(3), 3);
        assert_eq!(neighbors_per_packet(usize::MAX), max_neighbors());
    }
}
