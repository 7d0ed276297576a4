//! # Driving Ports (Inbound API)
//!
//! The public surface of peer discovery, implemented by
//! [`crate::table::Table`].

use std::net::SocketAddr;

use async_trait::async_trait;
use shared_crypto::Hash;

use crate::domain::{DiscoveryError, Node, NodeId, NodeType};

/// Primary API for finding and managing peers.
///
/// # Example
///
/// ```rust,ignore
/// use kn_peer_discovery::{Discovery, NodeType};
///
/// async fn connect_targets(disc: &dyn Discovery) {
///     for node in disc.get_nodes(NodeType::Cn, 10).await {
///         println!("dial {}", node);
///     }
/// }
/// ```
#[async_trait]
pub trait Discovery: Send + Sync {
    /// The local node.
    fn self_node(&self) -> &Node;

    /// Stop background work, close the transport and flush the node database.
    ///
    /// Safe to call more than once.
    async fn close(&self);

    /// Find the node with the given id.
    ///
    /// The local table is consulted first; otherwise a network lookup runs.
    async fn resolve(&self, target: NodeId, target_type: NodeType) -> Option<Node>;

    /// Search the network for nodes close to `target`.
    ///
    /// `target` does not need to be an actual node identifier.
    async fn lookup(&self, target: NodeId, target_type: NodeType) -> Vec<Node>;

    /// Up to `max` peers of `target_type`, topped up by a lookup if short.
    async fn get_nodes(&self, target_type: NodeType, max: usize) -> Vec<Node>;

    /// Up to `max` distinct random peers of `target_type`.
    ///
    /// Empty until the initial seeding has completed.
    fn read_random_nodes(&self, max: usize, target_type: NodeType) -> Vec<Node>;

    /// Peers closest to `target`; boot nodes are excluded unless
    /// `target_type` is [`NodeType::Bn`].
    fn retrieve_nodes(&self, target: &Hash, target_type: NodeType, max: usize) -> Vec<Node>;

    /// True if `id` completed a handshake within the bond lifetime.
    fn has_bond(&self, id: &NodeId) -> bool;

    /// Ensure a bond with the given peer and admit it to the table.
    ///
    /// `pinged` is true when the peer has just pinged us, which skips
    /// waiting for its ping.
    async fn bond(
        &self,
        pinged: bool,
        id: NodeId,
        addr: SocketAddr,
        tcp: u16,
        node_type: NodeType,
    ) -> Result<Node, DiscoveryError>;

    /// True if `id` may talk to us as a `node_type` peer.
    fn is_authorized(&self, id: &NodeId, node_type: NodeType) -> bool;

    /// Human-readable table name.
    fn name(&self) -> String;

    // =========================================================================
    // Administration
    // =========================================================================

    fn create_update_node_on_db(&self, node: &Node) -> Result<(), DiscoveryError>;

    fn create_update_node_on_table(&self, node: Node) -> Result<(), DiscoveryError>;

    fn get_node_from_db(&self, id: &NodeId) -> Result<Node, DiscoveryError>;

    fn delete_node_from_db(&self, node: &Node) -> Result<(), DiscoveryError>;

    fn delete_node_from_table(&self, node: &Node) -> Result<(), DiscoveryError>;

    /// Live entries of every store.
    fn get_bucket_entries(&self) -> Vec<Node>;

    /// Replacement candidates of every bucketed store.
    fn get_replacements(&self) -> Vec<Node>;

    fn get_authorized_nodes(&self) -> Vec<Node>;

    /// Add nodes to the allow-list of the store matching their role.
    fn put_authorized_nodes(&self, nodes: &[Node]);

    fn delete_authorized_nodes(&self, nodes: &[Node]);
}
