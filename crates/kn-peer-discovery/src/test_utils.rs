//! Test utilities for peer discovery.
//!
//! In-memory [`Transport`] double so routing tables can be exercised without
//! sockets. Enable with the `test-utils` feature flag.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use kn_peer_discovery::test_utils::MockTransport;
//!
//! let net = Arc::new(MockTransport::new());
//! net.fail_ping(dead_peer.id);
//! net.set_neighbors(boot.id, vec![peer_a, peer_b]);
//! ```

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::{DiscoveryError, Node, NodeId, NodeType};
use crate::ports::outbound::Transport;

#[derive(Debug, Default)]
struct Script {
    neighbors: HashMap<NodeId, Vec<Node>>,
    default_neighbors: Vec<Node>,
    dead_ping: HashSet<NodeId>,
    dead_find_node: HashSet<NodeId>,
    ping_delay: Duration,
    pings: Vec<NodeId>,
    wait_pings: Vec<NodeId>,
    find_nodes: Vec<(NodeId, NodeType)>,
}

/// Scripted transport.
///
/// Every peer answers PING unless marked with [`MockTransport::fail_ping`].
/// FINDNODE returns the list registered for the peer, or the default list,
/// filtered to the requested role plus boot nodes and truncated to `max`.
#[derive(Debug, Default)]
pub struct MockTransport {
    script: Mutex<Script>,
    closed: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Neighbors returned by `from`.
    pub fn set_neighbors(&self, from: NodeId, nodes: Vec<Node>) {
        self.script.lock().neighbors.insert(from, nodes);
    }

    /// Neighbors returned by peers without their own list.
    pub fn set_default_neighbors(&self, nodes: Vec<Node>) {
        self.script.lock().default_neighbors = nodes;
    }

    /// Make pings to `id` time out.
    pub fn fail_ping(&self, id: NodeId) {
        self.script.lock().dead_ping.insert(id);
    }

    /// Make FINDNODE to `id` time out.
    pub fn fail_find_node(&self, id: NodeId) {
        self.script.lock().dead_find_node.insert(id);
    }

    /// Delay every PONG by `delay`.
    pub fn set_ping_delay(&self, delay: Duration) {
        self.script.lock().ping_delay = delay;
    }

    /// Number of pings sent to `id`.
    pub fn ping_count(&self, id: &NodeId) -> usize {
        self.script.lock().pings.iter().filter(|p| *p == id).count()
    }

    /// Number of times we waited for a ping from `id`.
    pub fn wait_ping_count(&self, id: &NodeId) -> usize {
        self.script.lock().wait_pings.iter().filter(|p| *p == id).count()
    }

    /// Every FINDNODE sent, in order.
    pub fn find_node_calls(&self) -> Vec<(NodeId, NodeType)> {
        self.script.lock().find_nodes.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn ping(&self, to: NodeId, _addr: SocketAddr) -> Result<(), DiscoveryError> {
        if self.is_closed() {
            return Err(DiscoveryError::Closed);
        }
        let (delay, dead) = {
            let mut s = self.script.lock();
            s.pings.push(to);
            (s.ping_delay, s.dead_ping.contains(&to))
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if dead {
            Err(DiscoveryError::Timeout)
        } else {
            Ok(())
        }
    }

    async fn wait_ping(&self, from: NodeId) -> Result<(), DiscoveryError> {
        self.script.lock().wait_pings.push(from);
        Ok(())
    }

    async fn find_node(
        &self,
        to: NodeId,
        _addr: SocketAddr,
        _target: NodeId,
        target_type: NodeType,
        max: usize,
    ) -> Result<Vec<Node>, DiscoveryError> {
        if self.is_closed() {
            return Err(DiscoveryError::Closed);
        }
        let mut s = self.script.lock();
        s.find_nodes.push((to, target_type));
        if s.dead_find_node.contains(&to) {
            return Err(DiscoveryError::Timeout);
        }
        let nodes = s.neighbors.get(&to).unwrap_or(&s.default_neighbors);
        Ok(nodes
            .iter()
            .filter(|n| n.node_type == target_type || n.node_type == NodeType::Bn)
            .take(max)
            .cloned()
            .collect())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
