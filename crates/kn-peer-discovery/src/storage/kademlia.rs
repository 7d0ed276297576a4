//! Kademlia-style bucketed store.
//!
//! Peers are grouped by log distance from the local coordinate into
//! [`N_BUCKETS`] buckets of [`BUCKET_SIZE`] live entries. Full buckets park
//! newcomers as replacements, promoted when a live entry stops answering.
//! Non-LAN addresses are limited per /24 both per bucket and store-wide.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;
use shared_crypto::Hash;
use tracing::{debug, trace, warn};

use super::{bucket::Bucket, delete_node, push_node, DiscoverStorage};
use crate::domain::{
    bucket_index, is_lan, DistinctNetSet, Node, NodeId, NodeType, NodesByDistance, BUCKET_SIZE,
    MAX_REPLACEMENTS, N_BUCKETS, REVALIDATE_HOLD, SEED_MIN_TABLE_TIME, TABLE_IP_LIMIT,
    TABLE_SUBNET,
};
use crate::nodedb::NodeDb;
use crate::table::Table;

/// Random lookups per refresh, after the self lookup.
const RANDOM_LOOKUPS: usize = 3;

#[derive(Debug)]
struct State {
    buckets: Vec<Bucket>,
    ips: DistinctNetSet,
}

impl State {
    fn new() -> Self {
        Self {
            buckets: (0..N_BUCKETS).map(|_| Bucket::new()).collect(),
            ips: DistinctNetSet::new(TABLE_SUBNET, TABLE_IP_LIMIT),
        }
    }

    fn add_ip(&mut self, bi: usize, node: &Node) -> bool {
        if is_lan(node.ip) {
            return true;
        }
        if !self.ips.add(node.ip) {
            debug!(ip = %node.ip, "IP exceeds table limit");
            return false;
        }
        if !self.buckets[bi].ips.add(node.ip) {
            debug!(ip = %node.ip, bucket = bi, "IP exceeds bucket limit");
            self.ips.remove(node.ip);
            return false;
        }
        true
    }

    fn remove_ip(&mut self, bi: usize, node: &Node) {
        if is_lan(node.ip) {
            return;
        }
        self.ips.remove(node.ip);
        self.buckets[bi].ips.remove(node.ip);
    }

    /// Bump `node` or admit it as a live entry. False if the bucket is full
    /// or the IP quotas refuse it.
    fn bump_or_add(&mut self, bi: usize, node: Node) -> bool {
        if self.buckets[bi].bump(&node) {
            trace!(%node, "Bumped");
            return true;
        }
        if self.buckets[bi].entries.len() >= BUCKET_SIZE {
            return false;
        }

        // A promoted replacement already holds an IP slot; release it first
        // so the address is counted once.
        let parked = delete_node(&mut self.buckets[bi].replacements, &node.id);
        if let Some(p) = &parked {
            self.remove_ip(bi, p);
        }
        if !self.add_ip(bi, &node) {
            if let Some(p) = parked {
                if self.add_ip(bi, &p) {
                    self.buckets[bi].replacements.insert(0, p);
                }
            }
            return false;
        }

        let mut node = node;
        node.set_added_at(SystemTime::now());
        trace!(%node, bucket = bi, "Added");
        push_node(&mut self.buckets[bi].entries, node, BUCKET_SIZE);
        true
    }

    fn add_replacement(&mut self, bi: usize, node: Node) {
        if self.buckets[bi].replacements.iter().any(|r| r.id == node.id) {
            return;
        }
        if !self.add_ip(bi, &node) {
            return;
        }
        if let Some(evicted) = push_node(&mut self.buckets[bi].replacements, node, MAX_REPLACEMENTS)
        {
            self.remove_ip(bi, &evicted);
        }
    }

    fn delete_in_bucket(&mut self, bi: usize, id: &NodeId) {
        if let Some(removed) = delete_node(&mut self.buckets[bi].entries, id) {
            self.remove_ip(bi, &removed);
        }
    }
}

/// Bucketed peer store.
#[derive(Debug)]
pub struct KademliaStorage {
    target_type: NodeType,
    no_discover: bool,
    self_id: NodeId,
    self_sha: Hash,
    db: Arc<NodeDb>,
    state: Mutex<State>,
}

impl KademliaStorage {
    /// Create an empty store for `target_type` peers.
    ///
    /// With `no_discover` set the store never issues FINDNODE on refresh.
    pub fn new(target_type: NodeType, no_discover: bool, self_id: NodeId, db: Arc<NodeDb>) -> Self {
        Self {
            target_type,
            no_discover,
            self_id,
            self_sha: self_id.sha(),
            db,
            state: Mutex::new(State::new()),
        }
    }

    fn bucket_of(&self, sha: &Hash) -> usize {
        bucket_index(&self.self_sha, sha)
    }

    /// Snapshot of one bucket.
    pub fn bucket(&self, bi: usize) -> Option<Bucket> {
        self.state.lock().buckets.get(bi).cloned()
    }

    /// Number of addresses counted against the store-wide /24 quota.
    pub fn counted_ips(&self) -> usize {
        self.state.lock().ips.len()
    }

    /// Last entry of the first non-empty bucket in random order.
    fn node_to_revalidate(&self, tab: &Table) -> Option<(Node, usize)> {
        let mut order: Vec<usize> = (0..N_BUCKETS).collect();
        tab.with_rand(|rng| order.shuffle(rng));

        let st = self.state.lock();
        order
            .into_iter()
            .find_map(|bi| st.buckets[bi].last().map(|n| (n.clone(), bi)))
    }

    /// Swap `last` for a random replacement if it is still the last entry,
    /// or drop it when there are no replacements.
    fn replace(&self, tab: &Table, bi: usize, last: &Node) -> Option<Node> {
        let mut st = self.state.lock();
        if st.buckets[bi].last().map(|n| n.id) != Some(last.id) {
            return None;
        }
        let count = st.buckets[bi].replacements.len();
        if count == 0 {
            st.delete_in_bucket(bi, &last.id);
            return None;
        }

        let pick = tab.with_rand(|rng| rng.gen_range(0..count));
        let mut r = st.buckets[bi].replacements.remove(pick);
        r.set_added_at(SystemTime::now());
        if let Some(slot) = st.buckets[bi].entries.last_mut() {
            *slot = r.clone();
        }
        st.remove_ip(bi, last);
        Some(r)
    }
}

#[async_trait]
impl DiscoverStorage for KademliaStorage {
    fn name(&self) -> String {
        format!("{} kademlia", self.target_type)
    }

    fn target_type(&self) -> NodeType {
        self.target_type
    }

    fn add(&self, node: Node) {
        if node.id == self.self_id {
            return;
        }
        let bi = self.bucket_of(node.sha());
        let mut st = self.state.lock();
        if !st.bump_or_add(bi, node.clone()) {
            st.add_replacement(bi, node);
        }
    }

    fn delete(&self, node: &Node) {
        let bi = self.bucket_of(node.sha());
        self.state.lock().delete_in_bucket(bi, &node.id);
    }

    fn len(&self) -> usize {
        self.state.lock().buckets.iter().map(|b| b.entries.len()).sum()
    }

    fn node_all(&self) -> Vec<Node> {
        self.bucket_entries()
    }

    fn stuff(&self, nodes: Vec<Node>) {
        let mut st = self.state.lock();
        for n in nodes {
            if n.id == self.self_id {
                continue;
            }
            let bi = self.bucket_of(n.sha());
            if st.buckets[bi].entries.len() < BUCKET_SIZE {
                st.bump_or_add(bi, n);
            }
        }
    }

    fn closest(&self, target: &Hash, max: usize) -> NodesByDistance {
        let st = self.state.lock();
        NodesByDistance::from_entries(
            *target,
            st.buckets.iter().flat_map(|b| b.entries.iter().cloned()),
            max,
        )
    }

    fn read_random_nodes(&self, tab: &Table, max: usize) -> Vec<Node> {
        let mut buckets: Vec<Vec<Node>> = {
            let st = self.state.lock();
            st.buckets
                .iter()
                .filter(|b| !b.entries.is_empty())
                .map(|b| b.entries.clone())
                .collect()
        };
        tab.with_rand(|rng| buckets.shuffle(rng));

        // Take bucket heads round robin, dropping buckets as they drain.
        let mut out = Vec::with_capacity(max);
        let mut j = 0;
        while out.len() < max && !buckets.is_empty() {
            let b = &mut buckets[j];
            out.push(b.remove(0));
            if b.is_empty() {
                buckets.remove(j);
            } else {
                j += 1;
            }
            if !buckets.is_empty() {
                j %= buckets.len();
            }
        }
        out
    }

    async fn lookup(
        &self,
        tab: &Table,
        target: NodeId,
        refresh_if_empty: bool,
        target_type: NodeType,
    ) -> Vec<Node> {
        debug!(storage = %self.name(), %target, %target_type, refresh_if_empty, "Lookup start");
        let target_sha = target.sha();
        let mut refresh_if_empty = refresh_if_empty;
        let seeds = loop {
            let seeds = self.closest(&target_sha, BUCKET_SIZE);
            if !seeds.is_empty() || !refresh_if_empty {
                break seeds;
            }
            // Every entry was dropped; wait for the bootstrap logic once.
            tab.refresh().await;
            refresh_if_empty = false;
        };
        tab.find_new_node(seeds, target, target_type, true, BUCKET_SIZE)
            .await
    }

    async fn get_nodes(&self, _tab: &Table, max: usize) -> Vec<Node> {
        self.closest(&self.self_sha, max)
            .into_entries()
            .into_iter()
            .filter(|n| n.node_type == self.target_type)
            .collect()
    }

    async fn do_revalidate(&self, tab: &Table) {
        let Some((last, bi)) = self.node_to_revalidate(tab) else {
            return;
        };

        let hold_until = self.db.bond_time(&last.id) + REVALIDATE_HOLD;
        if SystemTime::now() < hold_until {
            trace!(storage = %self.name(), id = %last.id, "Skip revalidate");
            return;
        }

        match tab.ping(last.id, last.udp_addr()).await {
            Ok(()) => {
                debug!(storage = %self.name(), bucket = bi, id = ?last.id, "Revalidated node");
                self.state.lock().buckets[bi].bump(&last);
            }
            Err(e) => match self.replace(tab, bi, &last) {
                Some(r) => debug!(
                    storage = %self.name(), bucket = bi, id = ?last.id, ip = %last.ip,
                    replacement = ?r.id, error = %e, "Replaced unresponsive node"
                ),
                None => debug!(
                    storage = %self.name(), bucket = bi, id = ?last.id, ip = %last.ip,
                    error = %e, "Removed unresponsive node"
                ),
            },
        }
    }

    async fn do_refresh(&self, tab: &Table) {
        if self.no_discover {
            return;
        }
        self.lookup(tab, self.self_id, false, self.target_type)
            .await;

        // Findnode targets are ids, not hashes, so a bucket cannot be aimed
        // at directly; random targets spread the queries instead.
        for _ in 0..RANDOM_LOOKUPS {
            self.lookup(tab, NodeId::random(), false, self.target_type)
                .await;
        }
    }

    fn copy_bonded_nodes(&self) {
        let now = SystemTime::now();
        let seasoned: Vec<Node> = {
            let st = self.state.lock();
            st.buckets
                .iter()
                .flat_map(|b| b.entries.iter())
                .filter(|n| {
                    n.added_at()
                        .and_then(|at| now.duration_since(at).ok())
                        .is_some_and(|age| age >= SEED_MIN_TABLE_TIME)
                })
                .cloned()
                .collect()
        };
        for n in &seasoned {
            if let Err(e) = self.db.update_node(n) {
                warn!(storage = %self.name(), id = ?n.id, error = %e, "Failed to persist node");
            }
        }
    }

    fn bucket_entries(&self) -> Vec<Node> {
        let st = self.state.lock();
        st.buckets.iter().flat_map(|b| b.entries.iter().cloned()).collect()
    }

    fn replacements(&self) -> Vec<Node> {
        let st = self.state.lock();
        st.buckets
            .iter()
            .flat_map(|b| b.replacements.iter().cloned())
            .collect()
    }

    fn is_authorized(&self, _id: &NodeId) -> bool {
        true
    }

    fn authorized_nodes(&self) -> Vec<Node> {
        Vec::new()
    }

    fn put_authorized_node(&self, _node: &Node) {}

    fn delete_authorized_node(&self, _node: &Node) {}
}
