//! # UDP Transport
//!
//! Speaks the discovery protocol over a single UDP socket.
//!
//! ## Tasks
//!
//! - **Read loop:** receives datagrams and dispatches them to the packet
//!   handlers in [`handler`].
//! - **Pending loop:** owns outstanding requests and matches replies to
//!   them, see [`pending`].
//!
//! Both stop when [`Transport::close`] is called, which the routing table
//! does on shutdown.

mod config;
mod handler;
pub mod ntp;
mod pending;

pub use config::{Config, ReadPacket};

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use shared_crypto::{Hash, Secp256k1KeyPair};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::domain::{
    check_relay_ip, DiscoveryError, Netlist, Node, NodeId, NodeType, MAX_PACKET_SIZE,
    MIN_RELAY_UDP_PORT, PROTOCOL_VERSION,
};
use crate::nodedb::NodeDb;
use crate::ports::outbound::Transport;
use crate::table::Table;
use crate::wire::{
    encode_packet, expiration_from_now, Endpoint, FindNode, Packet, PacketType, Ping, RpcNode,
};

use pending::PendingQueue;

/// Discovery protocol endpoint on a UDP socket.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    key: Secp256k1KeyPair,
    network_id: u64,
    our_endpoint: Endpoint,
    net_restrict: Option<Arc<Netlist>>,
    max_neighbors_node: usize,
    pending: PendingQueue,
    closing: watch::Sender<bool>,
    mismatch_network: AtomicU64,
}

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("our_endpoint", &self.our_endpoint)
            .field("network_id", &self.network_id)
            .finish_non_exhaustive()
    }
}

/// Bind the socket, open the node database and start discovery.
///
/// Returns the routing table, which is the [`Discovery`] façade, and the
/// transport for observability. Closing the table closes the transport.
///
/// [`Discovery`]: crate::ports::Discovery
///
/// # Errors
///
/// Fails if the socket cannot be bound, the key is unusable, the node
/// database cannot be opened or a bootstrap node is invalid.
pub async fn listen_udp(config: Config) -> Result<(Arc<Table>, Arc<UdpTransport>), DiscoveryError> {
    let socket = UdpSocket::bind(config.listen_addr).await?;
    let local = socket.local_addr()?;
    let self_id = NodeId::from_public_key(&config.private_key.public_key()?);

    let transport = Arc::new(UdpTransport::new(socket, &config, local));
    let db = Arc::new(NodeDb::open(config.node_db_path.as_deref(), self_id)?);
    let self_node = Node::new(self_id, local.ip(), local.port(), local.port(), config.node_type);

    let table = match Table::new(
        Arc::clone(&transport) as Arc<dyn Transport>,
        self_node,
        db,
        &config.bootnodes,
        &config.authorized_nodes,
    ) {
        Ok(table) => table,
        Err(e) => {
            transport.close();
            return Err(e);
        }
    };

    tokio::spawn(read_loop(
        Arc::clone(&transport),
        Arc::clone(&table),
        config.unhandled,
    ));
    info!(self = %table.self_node(), node_type = %config.node_type, "UDP listener up");
    Ok((table, transport))
}

impl UdpTransport {
    fn new(socket: UdpSocket, config: &Config, local: SocketAddr) -> Self {
        let (closing, closing_rx) = watch::channel(false);
        let announce = config.announce_addr.unwrap_or(local);
        Self {
            socket: Arc::new(socket),
            key: config.private_key.clone(),
            network_id: config.network_id,
            our_endpoint: Endpoint::new(announce, announce.port(), config.node_type),
            net_restrict: config.net_restrict.clone().map(Arc::new),
            max_neighbors_node: config.max_neighbors_node,
            pending: PendingQueue::spawn(closing_rx),
            closing,
            mismatch_network: AtomicU64::new(0),
        }
    }

    /// Local socket address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Endpoint announced in outbound PINGs.
    pub fn our_endpoint(&self) -> &Endpoint {
        &self.our_endpoint
    }

    /// PINGs refused so far for carrying another network id.
    pub fn mismatch_network_count(&self) -> u64 {
        self.mismatch_network.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        *self.closing.borrow()
    }

    /// Sign and send `packet`, returning its hash.
    pub(crate) async fn send(&self, to: SocketAddr, packet: &Packet) -> Result<Hash, DiscoveryError> {
        let (datagram, hash) = encode_packet(&self.key, packet)?;
        self.write(to, packet.name(), &datagram).await?;
        Ok(hash)
    }

    async fn write(&self, to: SocketAddr, what: &'static str, datagram: &[u8]) -> Result<(), DiscoveryError> {
        match self.socket.send_to(datagram, to).await {
            Ok(_) => {
                trace!(%to, packet = what, "Sent packet");
                Ok(())
            }
            Err(e) => {
                trace!(%to, packet = what, error = %e, "Failed to send packet");
                Err(e.into())
            }
        }
    }
}

/// Validate a NEIGHBORS record received from `sender`.
pub(crate) fn node_from_rpc(
    sender: SocketAddr,
    rn: &RpcNode,
    net_restrict: Option<&Netlist>,
) -> Result<Node, DiscoveryError> {
    if rn.udp < MIN_RELAY_UDP_PORT {
        return Err(DiscoveryError::LowPort);
    }
    let ip = rn.ip.to_canonical();
    check_relay_ip(sender.ip().to_canonical(), ip)?;
    if let Some(restrict) = net_restrict {
        if !restrict.contains(ip) {
            return Err(DiscoveryError::Restricted);
        }
    }
    let node = Node::new(rn.id, ip, rn.udp, rn.tcp, rn.node_type);
    node.validate_complete()?;
    Ok(node)
}

#[async_trait]
impl Transport for UdpTransport {
    async fn ping(&self, to: NodeId, addr: SocketAddr) -> Result<(), DiscoveryError> {
        let req = Packet::Ping(Ping {
            network_id: self.network_id,
            version: PROTOCOL_VERSION,
            from: self.our_endpoint,
            to: Endpoint::new(addr, 0, NodeType::Unknown),
            expiration: expiration_from_now(),
        });
        let (datagram, hash) = encode_packet(&self.key, &req)?;
        let rx = self
            .pending
            .add(
                to,
                PacketType::Pong,
                NodeType::Unknown,
                Box::new(move |p: &Packet| matches!(p, Packet::Pong(pong) if pong.reply_tok[..] == hash[..])),
            )
            .await;
        // A failed write surfaces as a timeout.
        let _ = self.write(addr, req.name(), &datagram).await;
        pending::wait(rx).await
    }

    async fn wait_ping(&self, from: NodeId) -> Result<(), DiscoveryError> {
        let rx = self
            .pending
            .add(from, PacketType::Ping, NodeType::Unknown, Box::new(|_: &Packet| true))
            .await;
        pending::wait(rx).await
    }

    async fn find_node(
        &self,
        to: NodeId,
        addr: SocketAddr,
        target: NodeId,
        target_type: NodeType,
        max: usize,
    ) -> Result<Vec<Node>, DiscoveryError> {
        let nodes = Arc::new(Mutex::new(Vec::new()));
        let answered = Arc::new(AtomicBool::new(false));

        let collected = Arc::clone(&nodes);
        let replied = Arc::clone(&answered);
        let restrict = self.net_restrict.clone();
        let mut nreceived = 0;
        let callback = Box::new(move |p: &Packet| {
            let Packet::Neighbors(reply) = p else {
                return false;
            };
            replied.store(true, Ordering::Relaxed);
            for rn in &reply.nodes {
                nreceived += 1;
                match node_from_rpc(addr, rn, restrict.as_deref()) {
                    Ok(n) => collected.lock().push(n),
                    Err(e) => trace!(ip = %rn.ip, %addr, error = %e, "Invalid neighbor node received"),
                }
            }
            nreceived >= max
        });
        let rx = self
            .pending
            .add(to, PacketType::Neighbors, target_type, callback)
            .await;

        let req = Packet::FindNode(FindNode {
            target,
            target_type,
            expiration: expiration_from_now(),
        });
        let _ = self.send(addr, &req).await;

        let result = pending::wait(rx).await;
        let found = std::mem::take(&mut *nodes.lock());
        match result {
            Ok(()) => Ok(found),
            // The peer may simply know fewer than `max` nodes.
            Err(DiscoveryError::Timeout) if answered.load(Ordering::Relaxed) => Ok(found),
            Err(e) => Err(e),
        }
    }

    fn close(&self) {
        if !self.closing.send_replace(true) {
            debug!(endpoint = ?self.our_endpoint, "Closing UDP transport");
        }
    }
}

/// Receive datagrams until the transport closes or the socket fails.
async fn read_loop(
    t: Arc<UdpTransport>,
    tab: Arc<Table>,
    unhandled: Option<mpsc::Sender<ReadPacket>>,
) {
    let mut closing = t.closing.subscribe();
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        if *closing.borrow_and_update() {
            break;
        }
        let received = tokio::select! {
            res = t.socket.recv_from(&mut buf) => res,
            _ = closing.changed() => break,
        };
        let (n, from) = match received {
            Ok(v) => v,
            Err(e) if is_temporary(&e) => {
                debug!(error = %e, "Temporary UDP read error");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "UDP read error");
                break;
            }
        };
        if let Err(e) = handler::handle_packet(&t, &tab, from, &buf[..n]).await {
            if let Some(tx) = &unhandled {
                let _ = tx.try_send(ReadPacket {
                    data: buf[..n].to_vec(),
                    addr: from,
                });
            }
            trace!(%from, error = %e, "Unhandled packet");
        }
    }
    debug!("UDP read loop stopped");
}

fn is_temporary(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
    )
}

#[cfg(test)]
mod tests;
