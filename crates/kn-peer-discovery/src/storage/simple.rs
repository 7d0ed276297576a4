//! Flat peer store.
//!
//! A bounded list ordered by last activity, front first. Distance plays no
//! role: queries return the list in random order. An optional allow-list
//! restricts which peers of the store's role may join or ping us.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use shared_crypto::Hash;
use tracing::{debug, info, trace, warn};

use super::{bump_node, delete_node, push_node, DiscoverStorage};
use crate::domain::{is_lan, DistinctNetSet, Node, NodeId, NodeType, NodesByDistance, REVALIDATE_HOLD};
use crate::nodedb::NodeDb;
use crate::table::Table;

#[derive(Debug)]
struct Entries {
    nodes: Vec<Node>,
    /// Address accounting only; flat stores impose no subnet quota.
    ips: DistinctNetSet,
    rng: StdRng,
}

impl Entries {
    fn shuffled(&mut self) -> Vec<Node> {
        let mut nodes = self.nodes.clone();
        nodes.shuffle(&mut self.rng);
        nodes
    }

    fn release(&mut self, node: &Node) {
        if !is_lan(node.ip) {
            self.ips.remove(node.ip);
        }
    }
}

#[derive(Debug, Default)]
struct AllowList {
    /// True iff `nodes` is non-empty.
    has_authorized_nodes: bool,
    nodes: HashMap<NodeId, Node>,
}

/// Flat peer store bounded by `max`.
#[derive(Debug)]
pub struct SimpleStorage {
    target_type: NodeType,
    no_discover: bool,
    max: usize,
    self_id: NodeId,
    db: Arc<NodeDb>,
    entries: Mutex<Entries>,
    allow: RwLock<AllowList>,
}

impl SimpleStorage {
    /// Create an empty store for `target_type` peers.
    ///
    /// `authorized` seeds the allow-list; records of other roles are ignored.
    pub fn new(
        target_type: NodeType,
        no_discover: bool,
        max: usize,
        self_id: NodeId,
        db: Arc<NodeDb>,
        authorized: &[Node],
    ) -> Self {
        let storage = Self {
            target_type,
            no_discover,
            max,
            self_id,
            db,
            entries: Mutex::new(Entries {
                nodes: Vec::new(),
                ips: DistinctNetSet::new(24, u32::MAX),
                rng: StdRng::from_entropy(),
            }),
            allow: RwLock::new(AllowList::default()),
        };
        for n in authorized {
            storage.put_authorized_node(n);
        }
        storage
    }

    /// Capacity of the store.
    pub fn max(&self) -> usize {
        self.max
    }

    /// Number of addresses currently counted.
    pub fn counted_ips(&self) -> usize {
        self.entries.lock().ips.len()
    }

    fn forget(&self, id: &NodeId) {
        if let Err(e) = self.db.delete_node(id) {
            warn!(storage = %self.name(), ?id, error = %e, "Failed to delete node record");
        }
    }
}

#[async_trait]
impl DiscoverStorage for SimpleStorage {
    fn name(&self) -> String {
        format!("{} simple", self.target_type)
    }

    fn target_type(&self) -> NodeType {
        self.target_type
    }

    fn add(&self, node: Node) {
        if node.id == self.self_id {
            return;
        }
        if node.node_type == self.target_type && !self.is_authorized(&node.id) {
            debug!(storage = %self.name(), id = ?node.id, "Rejected unauthorized node");
            return;
        }

        let mut e = self.entries.lock();
        if bump_node(&mut e.nodes, &node) {
            trace!(storage = %self.name(), %node, "Bumped");
            return;
        }
        if !is_lan(node.ip) {
            e.ips.add(node.ip);
        }
        let mut node = node;
        node.set_added_at(SystemTime::now());
        trace!(storage = %self.name(), %node, "Added");
        if let Some(evicted) = push_node(&mut e.nodes, node, self.max) {
            e.release(&evicted);
        }
    }

    fn delete(&self, node: &Node) {
        {
            let mut e = self.entries.lock();
            if let Some(removed) = delete_node(&mut e.nodes, &node.id) {
                e.release(&removed);
            }
        }
        self.forget(&node.id);
    }

    fn len(&self) -> usize {
        self.entries.lock().nodes.len()
    }

    fn node_all(&self) -> Vec<Node> {
        self.entries.lock().nodes.clone()
    }

    fn stuff(&self, nodes: Vec<Node>) {
        for n in nodes {
            if self.len() >= self.max {
                return;
            }
            self.add(n);
        }
    }

    fn closest(&self, target: &Hash, max: usize) -> NodesByDistance {
        let mut nodes = self.entries.lock().shuffled();
        nodes.truncate(max.min(self.max));
        NodesByDistance::with_entries(*target, nodes)
    }

    fn read_random_nodes(&self, _tab: &Table, max: usize) -> Vec<Node> {
        let mut nodes = self.entries.lock().shuffled();
        nodes.truncate(max);
        nodes
    }

    async fn lookup(
        &self,
        tab: &Table,
        target: NodeId,
        _refresh_if_empty: bool,
        target_type: NodeType,
    ) -> Vec<Node> {
        let mut seeds: Vec<Node> = self
            .entries
            .lock()
            .nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Bn)
            .cloned()
            .collect();

        if seeds.is_empty() {
            seeds = tab.bondall(tab.nursery().to_vec()).await;
            for n in &seeds {
                self.add(n.clone());
            }
        }
        debug!(storage = %self.name(), %target, %target_type, seeds = seeds.len(), "Lookup");

        let seeds = NodesByDistance::with_entries([0u8; 32], seeds);
        tab.find_new_node(seeds, target, target_type, false, self.max)
            .await
    }

    async fn get_nodes(&self, tab: &Table, max: usize) -> Vec<Node> {
        let mut ret: Vec<Node> = self
            .entries
            .lock()
            .shuffled()
            .into_iter()
            .filter(|n| n.node_type == self.target_type)
            .take(max)
            .collect();

        if ret.len() < max {
            ret = self
                .lookup(tab, NodeId::zero(), true, self.target_type)
                .await;
        }
        ret.truncate(max);
        ret
    }

    async fn do_revalidate(&self, tab: &Table) {
        let Some(oldest) = self.entries.lock().nodes.last().cloned() else {
            return;
        };

        let hold_until = self.db.bond_time(&oldest.id) + REVALIDATE_HOLD;
        if SystemTime::now() < hold_until {
            return;
        }

        match tab.ping(oldest.id, oldest.udp_addr()).await {
            Ok(()) => {
                bump_node(&mut self.entries.lock().nodes, &oldest);
            }
            Err(e) => {
                info!(
                    storage = %self.name(), id = ?oldest.id, node_type = %oldest.node_type,
                    error = %e, "Removed unresponsive node"
                );
                self.delete(&oldest);
            }
        }
    }

    async fn do_refresh(&self, tab: &Table) {
        if self.no_discover {
            return;
        }
        self.lookup(tab, self.self_id, false, self.target_type)
            .await;
    }

    fn copy_bonded_nodes(&self) {
        for n in self.node_all() {
            if let Err(e) = self.db.update_node(&n) {
                warn!(storage = %self.name(), id = ?n.id, error = %e, "Failed to persist node");
            }
        }
    }

    fn bucket_entries(&self) -> Vec<Node> {
        self.node_all()
    }

    fn replacements(&self) -> Vec<Node> {
        Vec::new()
    }

    fn is_authorized(&self, id: &NodeId) -> bool {
        let allow = self.allow.read();
        !allow.has_authorized_nodes || allow.nodes.contains_key(id)
    }

    fn authorized_nodes(&self) -> Vec<Node> {
        self.allow.read().nodes.values().cloned().collect()
    }

    fn put_authorized_node(&self, node: &Node) {
        if node.node_type != self.target_type {
            return;
        }
        let mut allow = self.allow.write();
        allow.nodes.insert(node.id, node.clone());
        allow.has_authorized_nodes = true;
    }

    fn delete_authorized_node(&self, node: &Node) {
        let mut allow = self.allow.write();
        if allow.nodes.remove(&node.id).is_some() {
            allow.has_authorized_nodes = !allow.nodes.is_empty();
        } else {
            debug!(storage = %self.name(), id = ?node.id, "No authorized node to remove");
        }
    }
}
