//! # Routing Table
//!
//! Owns one [`DiscoverStorage`] per peer role, the bonding machinery and the
//! maintenance scheduler. The table is the [`Discovery`] façade the node
//! talks to.
//!
//! ## Store layout
//!
//! | Own role | Stores |
//! |----------|--------|
//! | CN | CN flat/100, BN flat/3 |
//! | PN | PN flat/1, EN bucketed, BN flat/3 |
//! | EN | PN flat/2, EN bucketed (discovering), BN flat/3 |
//! | BN | CN flat/100 + allow-list, PN flat/100 + allow-list, EN bucketed, BN flat/3 (discovering) |
//!
//! ## Lifecycle
//!
//! [`Table::new`] loads seeds, starts the node database expirer and spawns
//! the scheduler task, which holds a strong reference until
//! [`Discovery::close`] is called.
//!
//! [`Discovery`]: crate::ports::Discovery
//! [`Discovery::close`]: crate::ports::Discovery::close

mod api;
mod bond;
mod lookup;
mod scheduler;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use shared_crypto::Hash;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tracing::{debug, trace, warn};

use crate::domain::{
    DiscoveryError, Node, NodeId, NodeType, NodesByDistance, MAX_BONDING_PING_PONGS, SEED_COUNT,
    SEED_MAX_AGE,
};
use crate::nodedb::NodeDb;
use crate::ports::outbound::Transport;
use crate::storage::{DiscoverStorage, KademliaStorage, SimpleStorage};

use bond::BondResult;

/// Capacity of the consensus-node store.
pub const CN_STORE_MAX: usize = 100;
/// Capacity of a boot node's proxy-node store.
pub const BN_PN_STORE_MAX: usize = 100;
/// Capacity of the boot-node store.
pub const BN_STORE_MAX: usize = 3;
/// Capacity of a proxy node's own-role store.
pub const PN_PN_STORE_MAX: usize = 1;
/// Capacity of an endpoint node's proxy-node store.
pub const EN_PN_STORE_MAX: usize = 2;

/// Role-aware routing table.
pub struct Table {
    self_node: Node,
    db: Arc<NodeDb>,
    net: Arc<dyn Transport>,
    /// Bootstrap nodes.
    nursery: Vec<Node>,
    storages: RwLock<HashMap<NodeType, Arc<dyn DiscoverStorage>>>,
    /// Shared PRNG, reseeded on every refresh tick.
    rand: Mutex<StdRng>,

    /// Handshakes in flight; later callers wait on the leader's result.
    bonding: Mutex<HashMap<NodeId, watch::Receiver<Option<BondResult>>>>,
    bond_slots: Semaphore,

    init_done: watch::Sender<bool>,
    refresh_req: mpsc::Sender<oneshot::Sender<()>>,
    close_req: mpsc::Sender<()>,
    closed: watch::Sender<bool>,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("self_node", &self.self_node)
            .field("nursery", &self.nursery.len())
            .finish_non_exhaustive()
    }
}

impl Table {
    /// Build the table for `self_node.node_type`, load seeds and start the
    /// scheduler.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails if a bootstrap node is incomplete or has an invalid id.
    pub fn new(
        net: Arc<dyn Transport>,
        self_node: Node,
        db: Arc<NodeDb>,
        bootnodes: &[Node],
        authorized_nodes: &[Node],
    ) -> Result<Arc<Self>, DiscoveryError> {
        for n in bootnodes {
            if let Err(e) = n.validate_complete() {
                return Err(DiscoveryError::InvalidNode(format!(
                    "bad bootstrap/fallback node {:?} ({})",
                    n, e
                )));
            }
        }

        let storages = Self::layout(&self_node, &db, authorized_nodes);
        let (refresh_tx, refresh_rx) = mpsc::channel(16);
        let (close_tx, close_rx) = mpsc::channel(1);

        let tab = Arc::new(Self {
            db,
            net,
            nursery: bootnodes.to_vec(),
            storages: RwLock::new(storages),
            rand: Mutex::new(StdRng::from_entropy()),
            bonding: Mutex::new(HashMap::new()),
            bond_slots: Semaphore::new(MAX_BONDING_PING_PONGS),
            init_done: watch::Sender::new(false),
            refresh_req: refresh_tx,
            close_req: close_tx,
            closed: watch::Sender::new(false),
            self_node,
        });

        tab.load_seed_nodes_unbonded();
        // Seeds are read before the expirer starts so that older records
        // still count.
        tab.db.ensure_expirer();
        debug!(table = %tab.table_name(), "Created");

        tokio::spawn(Arc::clone(&tab).run(refresh_rx, close_rx));
        Ok(tab)
    }

    fn layout(
        self_node: &Node,
        db: &Arc<NodeDb>,
        authorized: &[Node],
    ) -> HashMap<NodeType, Arc<dyn DiscoverStorage>> {
        let id = self_node.id;
        let flat = |t: NodeType, no_discover: bool, max: usize, allow: &[Node]| {
            Arc::new(SimpleStorage::new(t, no_discover, max, id, Arc::clone(db), allow))
                as Arc<dyn DiscoverStorage>
        };
        let kademlia = |no_discover: bool| {
            Arc::new(KademliaStorage::new(NodeType::En, no_discover, id, Arc::clone(db)))
                as Arc<dyn DiscoverStorage>
        };

        let mut map = HashMap::new();
        match self_node.node_type {
            NodeType::Cn => {
                map.insert(NodeType::Cn, flat(NodeType::Cn, true, CN_STORE_MAX, &[]));
                map.insert(NodeType::Bn, flat(NodeType::Bn, true, BN_STORE_MAX, &[]));
            }
            NodeType::Pn => {
                map.insert(NodeType::Pn, flat(NodeType::Pn, true, PN_PN_STORE_MAX, &[]));
                map.insert(NodeType::En, kademlia(true));
                map.insert(NodeType::Bn, flat(NodeType::Bn, true, BN_STORE_MAX, &[]));
            }
            NodeType::En => {
                map.insert(NodeType::Pn, flat(NodeType::Pn, true, EN_PN_STORE_MAX, &[]));
                map.insert(NodeType::En, kademlia(false));
                map.insert(NodeType::Bn, flat(NodeType::Bn, true, BN_STORE_MAX, &[]));
            }
            NodeType::Bn => {
                map.insert(NodeType::Cn, flat(NodeType::Cn, true, CN_STORE_MAX, authorized));
                map.insert(NodeType::Pn, flat(NodeType::Pn, true, BN_PN_STORE_MAX, authorized));
                map.insert(NodeType::En, kademlia(true));
                map.insert(NodeType::Bn, flat(NodeType::Bn, false, BN_STORE_MAX, &[]));
            }
            NodeType::Unknown => {
                warn!("No routing stores for a node of unknown type");
            }
        }
        map
    }

    // =========================================================================
    // Accessors used by the stores
    // =========================================================================

    pub fn self_node(&self) -> &Node {
        &self.self_node
    }

    /// Bootstrap nodes.
    pub fn nursery(&self) -> &[Node] {
        &self.nursery
    }

    pub fn db(&self) -> &Arc<NodeDb> {
        &self.db
    }

    /// Run `f` with the table PRNG.
    pub(crate) fn with_rand<R>(&self, f: impl FnOnce(&mut StdRng) -> R) -> R {
        f(&mut self.rand.lock())
    }

    fn seed_rand(&self) {
        *self.rand.lock() = StdRng::from_entropy();
    }

    /// The store for `node_type`, if this table keeps one.
    pub fn storage(&self, node_type: NodeType) -> Option<Arc<dyn DiscoverStorage>> {
        self.storages.read().get(&node_type).cloned()
    }

    pub(crate) fn all_storages(&self) -> Vec<Arc<dyn DiscoverStorage>> {
        self.storages.read().values().cloned().collect()
    }

    /// True once the first refresh has completed.
    pub fn is_init_done(&self) -> bool {
        *self.init_done.borrow()
    }

    pub(crate) fn table_name(&self) -> String {
        format!("{} discovery table", self.self_node.node_type)
    }

    // =========================================================================
    // Store fan-out
    // =========================================================================

    /// Insert `node` into its role's store. Boot nodes go to every store.
    pub(crate) fn add(&self, node: Node) {
        if node.id == self.self_node.id || node.node_type == NodeType::Unknown {
            trace!(%node, "Not admitting");
            return;
        }
        let storages = self.storages.read();
        if node.node_type == NodeType::Bn {
            for s in storages.values() {
                s.add(node.clone());
            }
            return;
        }
        match storages.get(&node.node_type) {
            Some(s) => s.add(node),
            None => warn!(node_type = %node.node_type, "Add: unsupported node type"),
        }
    }

    /// Remove `node` from every store.
    pub(crate) fn delete(&self, node: &Node) {
        for s in self.all_storages() {
            s.delete(node);
        }
    }

    pub(crate) fn closest(&self, target: &Hash, node_type: NodeType, max: usize) -> NodesByDistance {
        match self.storage(node_type) {
            Some(s) => s.closest(target, max),
            None => {
                warn!(%node_type, "Closest: unsupported node type");
                NodesByDistance::new(*target)
            }
        }
    }

    /// Total live entries across stores.
    pub fn len(&self) -> usize {
        self.all_storages().iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // =========================================================================
    // Network helpers
    // =========================================================================

    /// Ping a peer, recording the attempt and, on success, the bond time.
    pub(crate) async fn ping(&self, id: NodeId, addr: std::net::SocketAddr) -> Result<(), DiscoveryError> {
        trace!(?id, %addr, "Ping");
        if let Err(e) = self.db.update_last_ping(&id, SystemTime::now()) {
            debug!(?id, error = %e, "Failed to record ping");
        }
        self.net.ping(id, addr).await?;
        if let Err(e) = self.db.update_bond_time(&id, SystemTime::now()) {
            debug!(?id, error = %e, "Failed to record bond time");
        }
        Ok(())
    }

    /// Admit database seeds and bootstrap nodes without bonding.
    fn load_seed_nodes_unbonded(&self) {
        for seed in self.seed_candidates() {
            self.log_seed(&seed);
            self.add(seed);
        }
    }

    /// Bond with database seeds and bootstrap nodes, admitting the live ones.
    pub(crate) async fn load_seed_nodes(&self) {
        for seed in self.bondall(self.seed_candidates()).await {
            self.log_seed(&seed);
            self.add(seed);
        }
    }

    fn seed_candidates(&self) -> Vec<Node> {
        let mut seeds = remove_bn(self.db.query_seeds(SEED_COUNT, SEED_MAX_AGE));
        seeds.extend(self.nursery.iter().cloned());
        seeds
    }

    fn log_seed(&self, seed: &Node) {
        let age = SystemTime::now()
            .duration_since(self.db.bond_time(&seed.id))
            .unwrap_or_default();
        debug!(id = ?seed.id, addr = %seed.udp_addr(), ?age, "Found seed node");
    }
}

/// Drop boot nodes from `nodes`.
pub(crate) fn remove_bn(mut nodes: Vec<Node>) -> Vec<Node> {
    nodes.retain(|n| n.node_type != NodeType::Bn);
    nodes
}

#[cfg(test)]
mod tests;
