//! Transport configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use shared_crypto::Secp256k1KeyPair;
use tokio::sync::mpsc;

use crate::domain::{Netlist, Node, NodeType};

/// Packet the transport could not handle, forwarded to
/// [`Config::unhandled`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPacket {
    pub data: Vec<u8>,
    pub addr: SocketAddr,
}

/// Settings for [`listen_udp`](super::listen_udp).
#[derive(Debug, Clone)]
pub struct Config {
    /// Peers pinging with another network id are refused.
    pub network_id: u64,
    /// Node key. The node id is derived from its public half.
    pub private_key: Secp256k1KeyPair,
    /// Local socket address to bind.
    pub listen_addr: SocketAddr,
    /// Address advertised in PING instead of the bound one.
    pub announce_addr: Option<SocketAddr>,
    /// Node database location; `None` keeps it in memory.
    pub node_db_path: Option<PathBuf>,
    /// CIDR allow-list applied to every NEIGHBORS record.
    pub net_restrict: Option<Netlist>,
    /// Bootstrap nodes.
    pub bootnodes: Vec<Node>,
    /// Receives datagrams that failed to decode or dispatch.
    pub unhandled: Option<mpsc::Sender<ReadPacket>>,
    /// Own role.
    pub node_type: NodeType,
    /// Caps records per NEIGHBORS datagram when non-zero.
    pub max_neighbors_node: usize,
    /// Peers admitted by the allow-listed stores of a boot node.
    pub authorized_nodes: Vec<Node>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network_id: 1,
            private_key: Secp256k1KeyPair::generate(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 32323)),
            announce_addr: None,
            node_db_path: None,
            net_restrict: None,
            bootnodes: Vec::new(),
            unhandled: None,
            node_type: NodeType::En,
            max_neighbors_node: 0,
            authorized_nodes: Vec::new(),
        }
    }
}

impl Config {
    /// Loopback configuration on an ephemeral port with an in-memory
    /// database.
    pub fn for_testing(node_type: NodeType) -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            node_type,
            ..Self::default()
        }
    }
}
