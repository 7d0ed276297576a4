//! [`Discovery`] implementation.

use std::net::SocketAddr;

use async_trait::async_trait;
use shared_crypto::Hash;
use tracing::warn;

use super::{remove_bn, Table};
use crate::domain::{DiscoveryError, Node, NodeId, NodeType};
use crate::ports::inbound::Discovery;

#[async_trait]
impl Discovery for Table {
    fn self_node(&self) -> &Node {
        &self.self_node
    }

    async fn close(&self) {
        self.shutdown().await;
    }

    async fn resolve(&self, target: NodeId, target_type: NodeType) -> Option<Node> {
        let closest = self.closest(&target.sha(), target_type, 1);
        if let Some(n) = closest.entries().first() {
            if n.id == target {
                return Some(n.clone());
            }
        }
        Discovery::lookup(self, target, target_type)
            .await
            .into_iter()
            .find(|n| n.id == target)
    }

    async fn lookup(&self, target: NodeId, target_type: NodeType) -> Vec<Node> {
        match self.storage(target_type) {
            Some(s) => s.lookup(self, target, true, target_type).await,
            None => {
                warn!(%target_type, "Lookup: unsupported node type");
                Vec::new()
            }
        }
    }

    async fn get_nodes(&self, target_type: NodeType, max: usize) -> Vec<Node> {
        match self.storage(target_type) {
            Some(s) => s.get_nodes(self, max).await,
            None => {
                warn!(%target_type, "Get_nodes: unsupported node type");
                Vec::new()
            }
        }
    }

    fn read_random_nodes(&self, max: usize, target_type: NodeType) -> Vec<Node> {
        if !self.is_init_done() {
            return Vec::new();
        }
        match self.storage(target_type) {
            Some(s) => s.read_random_nodes(self, max),
            None => {
                warn!(%target_type, "Read_random_nodes: unsupported node type");
                Vec::new()
            }
        }
    }

    fn retrieve_nodes(&self, target: &Hash, target_type: NodeType, max: usize) -> Vec<Node> {
        let Some(s) = self.storage(target_type) else {
            warn!(%target_type, "Retrieve_nodes: unsupported node type");
            return Vec::new();
        };
        let nodes = s.closest(target, max).into_entries();
        if target_type == NodeType::Bn {
            nodes
        } else {
            remove_bn(nodes)
        }
    }

    fn has_bond(&self, id: &NodeId) -> bool {
        self.db.has_bond(id)
    }

    async fn bond(
        &self,
        pinged: bool,
        id: NodeId,
        addr: SocketAddr,
        tcp: u16,
        node_type: NodeType,
    ) -> Result<Node, DiscoveryError> {
        match self.bond_inner(pinged, id, addr, tcp, node_type).await {
            (_, Err(e)) => Err(e),
            (Some(node), Ok(())) => Ok(node),
            (None, Ok(())) => Err(DiscoveryError::NodeNotFound),
        }
    }

    fn is_authorized(&self, id: &NodeId, node_type: NodeType) -> bool {
        self.storage(node_type)
            .map_or(true, |s| s.is_authorized(id))
    }

    fn name(&self) -> String {
        self.table_name()
    }

    // =========================================================================
    // Administration
    // =========================================================================

    fn create_update_node_on_db(&self, node: &Node) -> Result<(), DiscoveryError> {
        self.db.update_node(node)
    }

    fn create_update_node_on_table(&self, node: Node) -> Result<(), DiscoveryError> {
        if node.node_type != NodeType::Bn && self.storage(node.node_type).is_none() {
            return Err(DiscoveryError::UnsupportedNodeType(node.node_type));
        }
        self.add(node);
        Ok(())
    }

    fn get_node_from_db(&self, id: &NodeId) -> Result<Node, DiscoveryError> {
        self.db.node(id).ok_or(DiscoveryError::NodeNotFound)
    }

    fn delete_node_from_db(&self, node: &Node) -> Result<(), DiscoveryError> {
        self.db.delete_node(&node.id)
    }

    fn delete_node_from_table(&self, node: &Node) -> Result<(), DiscoveryError> {
        self.delete(node);
        Ok(())
    }

    fn get_bucket_entries(&self) -> Vec<Node> {
        self.all_storages()
            .iter()
            .flat_map(|s| s.bucket_entries())
            .collect()
    }

    fn get_replacements(&self) -> Vec<Node> {
        self.all_storages()
            .iter()
            .flat_map(|s| s.replacements())
            .collect()
    }

    fn get_authorized_nodes(&self) -> Vec<Node> {
        self.all_storages()
            .iter()
            .flat_map(|s| s.authorized_nodes())
            .collect()
    }

    fn put_authorized_nodes(&self, nodes: &[Node]) {
        for s in self.all_storages() {
            for n in nodes {
                s.put_authorized_node(n);
            }
        }
    }

    fn delete_authorized_nodes(&self, nodes: &[Node]) {
        for s in self.all_storages() {
            for n in nodes {
                s.delete_authorized_node(n);
            }
        }
    }
}
