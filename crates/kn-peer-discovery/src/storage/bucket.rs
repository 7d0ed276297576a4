//! A single Kademlia bucket.

use crate::domain::{DistinctNetSet, Node, BUCKET_IP_LIMIT, BUCKET_SUBNET};

use super::bump_node;

/// Live entries ordered by last activity, most recent first, plus
/// replacement candidates.
///
/// A node is never in `entries` and `replacements` at once.
#[derive(Debug, Clone)]
pub struct Bucket {
    pub(crate) entries: Vec<Node>,
    pub(crate) replacements: Vec<Node>,
    pub(crate) ips: DistinctNetSet,
}

impl Default for Bucket {
    fn default() -> Self {
        Self::new()
    }
}

impl Bucket {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            replacements: Vec::new(),
            ips: DistinctNetSet::new(BUCKET_SUBNET, BUCKET_IP_LIMIT),
        }
    }

    pub fn entries(&self) -> &[Node] {
        &self.entries
    }

    pub fn replacements(&self) -> &[Node] {
        &self.replacements
    }

    /// Addresses of live entries counted against the subnet limit.
    pub fn counted_ips(&self) -> usize {
        self.ips.len()
    }

    /// Move `node` to the front if it is a live entry.
    pub fn bump(&mut self, node: &Node) -> bool {
        bump_node(&mut self.entries, node)
    }

    pub(crate) fn last(&self) -> Option<&Node> {
        self.entries.last()
    }
}
