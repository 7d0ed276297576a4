//! XOR metric over keccak-256 node coordinates.

use std::cmp::Ordering;

use shared_crypto::Hash;

use super::constants::{BUCKET_MIN_DISTANCE, N_BUCKETS};
use super::node::Node;

/// Logarithmic XOR distance: the index of the highest differing bit plus
/// one, or 0 for equal hashes.
pub fn log_distance(a: &Hash, b: &Hash) -> usize {
    let mut lz = 0usize;
    for (x, y) in a.iter().zip(b.iter()) {
        let d = x ^ y;
        if d == 0 {
            lz += 8;
        } else {
            lz += d.leading_zeros() as usize;
            break;
        }
    }
    a.len() * 8 - lz
}

/// Compares `a` and `b` by their XOR distance to `target`.
pub fn dist_cmp(target: &Hash, a: &Hash, b: &Hash) -> Ordering {
    for i in 0..target.len() {
        let da = a[i] ^ target[i];
        let db = b[i] ^ target[i];
        match da.cmp(&db) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Bucket index of `sha` relative to the local coordinate `own`.
///
/// All peers within [`BUCKET_MIN_DISTANCE`] share bucket 0.
pub fn bucket_index(own: &Hash, sha: &Hash) -> usize {
    let d = log_distance(own, sha);
    if d <= BUCKET_MIN_DISTANCE {
        0
    } else {
        (d - BUCKET_MIN_DISTANCE - 1).min(N_BUCKETS - 1)
    }
}

/// Nodes ordered by ascending distance to a target.
#[derive(Debug, Clone)]
pub struct NodesByDistance {
    target: Hash,
    entries: Vec<Node>,
}

impl NodesByDistance {
    pub fn new(target: Hash) -> Self {
        Self {
            target,
            entries: Vec::new(),
        }
    }

    /// Build a sorted list from arbitrary nodes, keeping the closest `max`.
    pub fn from_entries(target: Hash, nodes: impl IntoIterator<Item = Node>, max: usize) -> Self {
        let mut list = Self::new(target);
        for n in nodes {
            list.push(n, max);
        }
        list
    }

    /// Wrap `entries` as given, without sorting. Used for seed sets that
    /// have no meaningful target.
    pub fn with_entries(target: Hash, entries: Vec<Node>) -> Self {
        Self { target, entries }
    }

    /// Insert `n` at its sorted position; the list never grows beyond `max`.
    pub fn push(&mut self, n: Node, max: usize) {
        let pos = self
            .entries
            .partition_point(|e| dist_cmp(&self.target, e.sha(), n.sha()) != Ordering::Greater);
        if self.entries.len() < max {
            self.entries.insert(pos, n);
        } else if pos < self.entries.len() {
            self.entries.insert(pos, n);
            self.entries.pop();
        }
    }

    pub fn target(&self) -> &Hash {
        &self.target
    }

    pub fn entries(&self) -> &[Node] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<Node> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
