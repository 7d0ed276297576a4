//! # Routing Stores
//!
//! One store per peer role. The table owns a `NodeType -> store` map and
//! dispatches through [`DiscoverStorage`]:
//!
//! - [`KademliaStorage`]: XOR-bucketed store used for endpoint nodes.
//! - [`SimpleStorage`]: bounded, shuffled flat list with an optional
//!   allow-list, used for consensus, proxy and boot nodes.
//!
//! Stores never own the table. Operations that need the network or the
//! shared PRNG receive it as `tab`.

pub mod bucket;
pub mod kademlia;
pub mod simple;

use async_trait::async_trait;
use shared_crypto::Hash;

use crate::domain::{Node, NodeId, NodeType, NodesByDistance};
use crate::table::Table;

pub use bucket::Bucket;
pub use kademlia::KademliaStorage;
pub use simple::SimpleStorage;

/// Role-specific peer store.
///
/// Implementations guard their state with their own locks and never hold a
/// lock across an `.await`.
#[async_trait]
pub trait DiscoverStorage: Send + Sync {
    /// Short name used in logs, e.g. `"EN kademlia"`.
    fn name(&self) -> String;

    /// Role of the peers this store holds.
    fn target_type(&self) -> NodeType;

    /// Admit or refresh `node`.
    fn add(&self, node: Node);

    fn delete(&self, node: &Node);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every live entry.
    fn node_all(&self) -> Vec<Node>;

    /// Admit `nodes` where there is room, without evicting anything.
    fn stuff(&self, nodes: Vec<Node>);

    /// Up to `max` entries ordered for `target`.
    fn closest(&self, target: &Hash, max: usize) -> NodesByDistance;

    /// Up to `max` distinct random entries.
    fn read_random_nodes(&self, tab: &Table, max: usize) -> Vec<Node>;

    /// Query the network for peers near `target`.
    async fn lookup(
        &self,
        tab: &Table,
        target: NodeId,
        refresh_if_empty: bool,
        target_type: NodeType,
    ) -> Vec<Node>;

    /// Up to `max` peers of this store's role.
    async fn get_nodes(&self, tab: &Table, max: usize) -> Vec<Node>;

    /// Ping one stale entry and act on the outcome.
    async fn do_revalidate(&self, tab: &Table);

    /// Periodic discovery; a no-op for stores that do not discover.
    async fn do_refresh(&self, tab: &Table);

    /// Persist long-lived entries to the node database.
    fn copy_bonded_nodes(&self);

    /// Live entries, for the admin API.
    fn bucket_entries(&self) -> Vec<Node>;

    /// Replacement candidates, for the admin API.
    fn replacements(&self) -> Vec<Node>;

    /// True if `id` may talk to us as a peer of this role.
    fn is_authorized(&self, id: &NodeId) -> bool;

    fn authorized_nodes(&self) -> Vec<Node>;

    fn put_authorized_node(&self, node: &Node);

    fn delete_authorized_node(&self, node: &Node);
}

// =============================================================================
// List helpers
// =============================================================================

/// Insert `node` at the front of `list`, returning the entry pushed out the
/// back if the list grew beyond `max`.
pub(crate) fn push_node(list: &mut Vec<Node>, node: Node, max: usize) -> Option<Node> {
    list.insert(0, node);
    if list.len() > max {
        list.pop()
    } else {
        None
    }
}

/// Remove the entry with `id` from `list`.
pub(crate) fn delete_node(list: &mut Vec<Node>, id: &NodeId) -> Option<Node> {
    let pos = list.iter().position(|n| n.id == *id)?;
    Some(list.remove(pos))
}

/// Move the entry with `node.id` to the front, taking the new endpoint but
/// keeping the original admission time.
pub(crate) fn bump_node(list: &mut [Node], node: &Node) -> bool {
    let Some(pos) = list.iter().position(|n| n.id == node.id) else {
        return false;
    };
    let added_at = list[pos].added_at();
    let mut fresh = node.clone();
    if let Some(at) = added_at {
        fresh.set_added_at(at);
    }
    list[pos] = fresh;
    list[..=pos].rotate_right(1);
    true
}
