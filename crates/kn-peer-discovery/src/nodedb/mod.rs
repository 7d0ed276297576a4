//! # Node Database
//!
//! Remembers peers across restarts and tracks their liveness:
//!
//! | Key | Value |
//! |-----|-------|
//! | `n:<id>:discover` | RLP node record |
//! | `n:<id>:lastping` | last PING sent, unix nanoseconds |
//! | `n:<id>:lastpong` | last PONG received (bond time), unix nanoseconds |
//! | `n:<id>:findfail` | consecutive FINDNODE failures |
//! | `version` | RLP `[schema version, local id]` |
//!
//! A database written by another schema version or another local id is
//! wiped on open.

mod memory;
#[cfg(feature = "rocksdb")]
mod rocks;

pub use memory::MemoryStore;
#[cfg(feature = "rocksdb")]
pub use rocks::RocksDbStore;

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::seq::SliceRandom;
use rlp::RlpStream;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::domain::{
    DiscoveryError, Node, NodeId, NODE_DB_CLEANUP_CYCLE, NODE_DB_NODE_EXPIRATION,
    NODE_DB_VERSION,
};
use crate::ports::outbound::{BatchOperation, KeyValueStore};
use crate::wire::RpcNode;

const ITEM_PREFIX: &[u8] = b"n:";
const VERSION_KEY: &[u8] = b"version";

const FIELD_DISCOVER: &[u8] = b":discover";
const FIELD_LAST_PING: &[u8] = b":lastping";
const FIELD_LAST_PONG: &[u8] = b":lastpong";
const FIELD_FIND_FAIL: &[u8] = b":findfail";

fn make_key(id: &NodeId, field: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(ITEM_PREFIX.len() + NodeId::LENGTH + field.len());
    key.extend_from_slice(ITEM_PREFIX);
    key.extend_from_slice(id.as_bytes());
    key.extend_from_slice(field);
    key
}

fn split_key(key: &[u8]) -> Option<(NodeId, &[u8])> {
    let rest = key.strip_prefix(ITEM_PREFIX)?;
    if rest.len() < NodeId::LENGTH {
        return None;
    }
    let (id, field) = rest.split_at(NodeId::LENGTH);
    NodeId::from_slice(id).ok().map(|id| (id, field))
}

fn to_unix(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

fn from_unix(nanos: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(nanos)
}

fn encode_u64(v: u64) -> [u8; 8] {
    v.to_be_bytes()
}

fn decode_u64(bytes: &[u8]) -> Option<u64> {
    bytes.try_into().ok().map(u64::from_be_bytes)
}

/// Peer database over a [`KeyValueStore`].
pub struct NodeDb {
    store: Arc<dyn KeyValueStore>,
    self_id: NodeId,
    expirer_started: AtomicBool,
    quit: watch::Sender<bool>,
}

impl std::fmt::Debug for NodeDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeDb")
            .field("self_id", &self.self_id)
            .finish_non_exhaustive()
    }
}

impl NodeDb {
    /// Open the database at `path`, or an in-memory one when `path` is `None`.
    pub fn open(path: Option<&Path>, self_id: NodeId) -> Result<Self, DiscoveryError> {
        match path {
            None => Self::new_memory(self_id),
            Some(path) => Self::open_persistent(path, self_id),
        }
    }

    /// An empty in-memory database.
    pub fn new_memory(self_id: NodeId) -> Result<Self, DiscoveryError> {
        Self::with_store(Arc::new(MemoryStore::new()), NODE_DB_VERSION, self_id)
    }

    #[cfg(feature = "rocksdb")]
    fn open_persistent(path: &Path, self_id: NodeId) -> Result<Self, DiscoveryError> {
        let store = RocksDbStore::open(path)?;
        info!(path = %path.display(), "Opened persistent node database");
        Self::with_store(Arc::new(store), NODE_DB_VERSION, self_id)
    }

    #[cfg(not(feature = "rocksdb"))]
    fn open_persistent(path: &Path, _self_id: NodeId) -> Result<Self, DiscoveryError> {
        Err(DiscoveryError::Database(format!(
            "cannot open {}: persistent node database requires the `rocksdb` feature",
            path.display()
        )))
    }

    /// Wrap an existing backend, wiping it if its schema version or local
    /// id differ.
    pub fn with_store(
        store: Arc<dyn KeyValueStore>,
        version: u64,
        self_id: NodeId,
    ) -> Result<Self, DiscoveryError> {
        let mut s = RlpStream::new_list(2);
        s.append(&version);
        s.append(&self_id.as_bytes().to_vec());
        let want = s.out().to_vec();

        match store.get(VERSION_KEY)? {
            Some(have) if have == want => {}
            Some(_) => {
                info!("Node database version or identity changed, wiping");
                let ops = store
                    .prefix_scan(b"")?
                    .into_iter()
                    .map(|(k, _)| BatchOperation::delete(k))
                    .collect();
                store.atomic_batch_write(ops)?;
                store.put(VERSION_KEY, &want)?;
            }
            None => store.put(VERSION_KEY, &want)?,
        }

        let (quit, _) = watch::channel(false);
        Ok(Self {
            store,
            self_id,
            expirer_started: AtomicBool::new(false),
            quit,
        })
    }

    // =========================================================================
    // Node records
    // =========================================================================

    /// The stored record of `id`, if any.
    pub fn node(&self, id: &NodeId) -> Option<Node> {
        let blob = self.store.get(&make_key(id, FIELD_DISCOVER)).ok()??;
        match rlp::decode::<RpcNode>(&blob) {
            Ok(rn) if rn.id == *id => Some(Node::new(rn.id, rn.ip, rn.udp, rn.tcp, rn.node_type)),
            Ok(_) => None,
            Err(e) => {
                debug!(%id, error = %e, "Failed to decode node record");
                None
            }
        }
    }

    /// Insert or replace the record of `node`.
    pub fn update_node(&self, node: &Node) -> Result<(), DiscoveryError> {
        let blob = rlp::encode(&RpcNode::from(node));
        self.store.put(&make_key(&node.id, FIELD_DISCOVER), &blob)?;
        Ok(())
    }

    /// Remove every key of `id`.
    pub fn delete_node(&self, id: &NodeId) -> Result<(), DiscoveryError> {
        let ops = self
            .store
            .prefix_scan(&make_key(id, b""))?
            .into_iter()
            .map(|(k, _)| BatchOperation::delete(k))
            .collect();
        self.store.atomic_batch_write(ops)?;
        Ok(())
    }

    // =========================================================================
    // Liveness
    // =========================================================================

    fn fetch_u64(&self, id: &NodeId, field: &[u8]) -> u64 {
        self.store
            .get(&make_key(id, field))
            .ok()
            .flatten()
            .and_then(|b| decode_u64(&b))
            .unwrap_or(0)
    }

    fn store_u64(&self, id: &NodeId, field: &[u8], v: u64) -> Result<(), DiscoveryError> {
        self.store.put(&make_key(id, field), &encode_u64(v))?;
        Ok(())
    }

    /// Time of the last PING sent to `id`.
    pub fn last_ping(&self, id: &NodeId) -> SystemTime {
        from_unix(self.fetch_u64(id, FIELD_LAST_PING))
    }

    pub fn update_last_ping(&self, id: &NodeId, t: SystemTime) -> Result<(), DiscoveryError> {
        self.store_u64(id, FIELD_LAST_PING, to_unix(t))
    }

    /// Time of the last PONG received from `id`; the epoch if never.
    pub fn bond_time(&self, id: &NodeId) -> SystemTime {
        from_unix(self.fetch_u64(id, FIELD_LAST_PONG))
    }

    pub fn update_bond_time(&self, id: &NodeId, t: SystemTime) -> Result<(), DiscoveryError> {
        self.store_u64(id, FIELD_LAST_PONG, to_unix(t))
    }

    /// Consecutive FINDNODE failures of `id`.
    pub fn find_fails(&self, id: &NodeId) -> u32 {
        u32::try_from(self.fetch_u64(id, FIELD_FIND_FAIL)).unwrap_or(u32::MAX)
    }

    pub fn update_find_fails(&self, id: &NodeId, fails: u32) -> Result<(), DiscoveryError> {
        self.store_u64(id, FIELD_FIND_FAIL, u64::from(fails))
    }

    /// True if `id` answered a PING within the bond lifetime.
    pub fn has_bond(&self, id: &NodeId) -> bool {
        match SystemTime::now().duration_since(self.bond_time(id)) {
            Ok(age) => age <= NODE_DB_NODE_EXPIRATION,
            // Bond time in the future; trust it.
            Err(_) => true,
        }
    }

    // =========================================================================
    // Seeding and expiry
    // =========================================================================

    fn stored_ids(&self) -> Result<Vec<NodeId>, DiscoveryError> {
        Ok(self
            .store
            .prefix_scan(ITEM_PREFIX)?
            .into_iter()
            .filter_map(|(k, _)| match split_key(&k) {
                Some((id, FIELD_DISCOVER)) => Some(id),
                _ => None,
            })
            .collect())
    }

    /// Up to `n` random stored nodes that bonded within `max_age`.
    ///
    /// The local node is never returned.
    pub fn query_seeds(&self, n: usize, max_age: Duration) -> Vec<Node> {
        let ids = match self.stored_ids() {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, "Failed to scan node database");
                return Vec::new();
            }
        };
        let now = SystemTime::now();
        let mut seeds: Vec<Node> = ids
            .into_iter()
            .filter(|id| *id != self.self_id)
            .filter(|id| {
                now.duration_since(self.bond_time(id))
                    .map(|age| age <= max_age)
                    .unwrap_or(true)
            })
            .filter_map(|id| self.node(&id))
            .collect();
        seeds.shuffle(&mut rand::thread_rng());
        seeds.truncate(n);
        seeds
    }

    /// Drop every stored peer whose bond time is older than the bond lifetime.
    ///
    /// Records that never answered a PING count as bonded at the epoch.
    pub(crate) fn expire_nodes(&self) -> Result<usize, DiscoveryError> {
        let threshold = SystemTime::now()
            .checked_sub(NODE_DB_NODE_EXPIRATION)
            .unwrap_or(UNIX_EPOCH);
        let ids: HashSet<NodeId> = self
            .store
            .prefix_scan(ITEM_PREFIX)?
            .iter()
            .filter_map(|(key, _)| split_key(key).map(|(id, _)| id))
            .collect();
        let mut expired = 0;
        for id in ids {
            if id == self.self_id || self.bond_time(&id) > threshold {
                continue;
            }
            self.delete_node(&id)?;
            expired += 1;
        }
        if expired > 0 {
            debug!(count = expired, "Expired stale node database entries");
        }
        Ok(expired)
    }

    /// Start the periodic expirer unless it already runs.
    ///
    /// Must be called from within a tokio runtime.
    pub fn ensure_expirer(self: &Arc<Self>) {
        if self
            .expirer_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let db = Arc::clone(self);
        let mut quit = self.quit.subscribe();
        if *quit.borrow() {
            return;
        }
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + NODE_DB_CLEANUP_CYCLE;
            let mut tick = tokio::time::interval_at(start, NODE_DB_CLEANUP_CYCLE);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = db.expire_nodes() {
                            error!(error = %e, "Failed to expire nodes");
                        }
                    }
                    _ = quit.changed() => return,
                }
            }
        });
    }

    /// Stop the expirer and release the backend.
    pub fn close(&self) {
        self.quit.send_replace(true);
        self.store.close();
    }
}
