//! Bonding: the ping/pong handshake that gates store admission.
//!
//! A bond exists once both sides completed a ping/pong exchange within
//! [`NODE_DB_NODE_EXPIRATION`]. Handshakes to the same id are serialized:
//! the first caller runs it and later callers wait for its result.

use std::net::SocketAddr;
use std::time::SystemTime;

use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, trace};

use super::Table;
use crate::domain::{DiscoveryError, Node, NodeId, NodeType, NODE_DB_NODE_EXPIRATION};

/// Outcome of one handshake, shared with every waiter.
pub(crate) type BondResult = Result<Node, DiscoveryError>;

/// Unregisters a handshake when its leader finishes or is cancelled.
struct BondGuard<'a> {
    tab: &'a Table,
    id: NodeId,
}

impl Drop for BondGuard<'_> {
    fn drop(&mut self) {
        self.tab.bonding.lock().remove(&self.id);
    }
}

enum Role {
    Leader(watch::Sender<Option<BondResult>>),
    Waiter(watch::Receiver<Option<BondResult>>),
}

impl Table {
    /// Ensure a bond with `id` and admit the node.
    ///
    /// The node is admitted even if the handshake failed, as long as the
    /// database still has a record for it; an unresponsive peer is dropped
    /// again by revalidation. The returned node and error are therefore
    /// independent.
    pub(crate) async fn bond_inner(
        &self,
        pinged: bool,
        id: NodeId,
        addr: SocketAddr,
        tcp: u16,
        node_type: NodeType,
    ) -> (Option<Node>, Result<(), DiscoveryError>) {
        if id == self.self_node.id {
            return (None, Err(DiscoveryError::SelfBond));
        }
        if pinged && !self.is_init_done() {
            return (None, Err(DiscoveryError::StillInitializing));
        }

        let mut node = self.db.node(&id);
        let fails = self.db.find_fails(&id);
        let age = SystemTime::now()
            .duration_since(self.db.bond_time(&id))
            .unwrap_or_default();

        let mut result = Ok(());
        // A boot node admits every unknown peer after a fresh handshake.
        let unknown_to_bn = node.is_none() && self.self_node.node_type == NodeType::Bn;
        if fails > 0 || age > NODE_DB_NODE_EXPIRATION || unknown_to_bn {
            trace!(?id, known = node.is_some(), fails, ?age, "Starting bonding ping/pong");
            match self.handshake(pinged, id, addr, tcp, node_type).await {
                Ok(n) => node = Some(n),
                Err(e) => {
                    trace!(?id, error = %e, "Bonding failed");
                    result = Err(e);
                }
            }
        }

        if let Some(n) = &node {
            trace!(id = ?n.id, node_type = %n.node_type, "Bond: add");
            self.add(n.clone());
            if let Err(e) = self.db.update_find_fails(&id, 0) {
                debug!(?id, error = %e, "Failed to reset findnode failures");
            }
        }
        (node, result)
    }

    /// Run or join the handshake for `id`.
    async fn handshake(
        &self,
        pinged: bool,
        id: NodeId,
        addr: SocketAddr,
        tcp: u16,
        node_type: NodeType,
    ) -> BondResult {
        let role = {
            let mut bonding = self.bonding.lock();
            match bonding.get(&id) {
                Some(rx) => Role::Waiter(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    bonding.insert(id, rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Leader(tx) => {
                let _guard = BondGuard { tab: self, id };
                let result = self.pingpong(pinged, id, addr, tcp, node_type).await;
                tx.send_replace(Some(result.clone()));
                result
            }
            Role::Waiter(mut rx) => loop {
                let current = rx.borrow_and_update().clone();
                if let Some(result) = current {
                    return result;
                }
                if rx.changed().await.is_err() {
                    // The leader went away without publishing.
                    let last = rx.borrow().clone();
                    return last.unwrap_or(Err(DiscoveryError::Closed));
                }
            },
        }
    }

    async fn pingpong(
        &self,
        pinged: bool,
        id: NodeId,
        addr: SocketAddr,
        tcp: u16,
        node_type: NodeType,
    ) -> BondResult {
        let _slot = self
            .bond_slots
            .acquire()
            .await
            .map_err(|_| DiscoveryError::Closed)?;

        self.ping(id, addr).await?;
        if !pinged {
            // Give the remote side a chance to ping us before we send
            // findnode. A peer that still remembers us will not ping, so a
            // timeout here is expected.
            trace!(?id, "Waiting for ping");
            if let Err(e) = self.net.wait_ping(id).await {
                trace!(?id, error = %e, "No ping from peer");
            }
        }

        let node = Node::new(id, addr.ip(), addr.port(), tcp, node_type);
        if let Err(e) = self.db.update_node(&node) {
            debug!(?id, error = %e, "Failed to store bonded node");
        }
        trace!(%node, "Pingpong succeeded");
        Ok(node)
    }

    /// Bond with every node concurrently and return those admitted.
    pub(crate) async fn bondall(&self, nodes: Vec<Node>) -> Vec<Node> {
        let bonds = nodes
            .iter()
            .map(|n| self.bond_inner(false, n.id, n.udp_addr(), n.tcp, n.node_type));
        join_all(bonds)
            .await
            .into_iter()
            .filter_map(|(node, _)| node)
            .collect()
    }
}
