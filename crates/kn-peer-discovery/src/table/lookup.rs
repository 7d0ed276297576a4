//! Iterative FINDNODE.

use std::collections::HashSet;

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, trace};

use super::{remove_bn, Table};
use crate::domain::{Node, NodeId, NodeType, NodesByDistance, ALPHA, MAX_FINDNODE_FAILURES};

impl Table {
    /// Query up to [`ALPHA`] unasked peers from `seeds` at a time and merge
    /// the bonded results, closest first, capped at `max`.
    ///
    /// A recursive search keeps going until every known peer was asked. A
    /// non-recursive one asks a single round.
    pub(crate) async fn find_new_node(
        &self,
        mut seeds: NodesByDistance,
        target: NodeId,
        target_type: NodeType,
        recursive: bool,
        max: usize,
    ) -> Vec<Node> {
        let mut asked: HashSet<NodeId> = HashSet::new();
        let mut seen: HashSet<NodeId> = seeds.entries().iter().map(|n| n.id).collect();
        // Never query ourselves.
        asked.insert(self.self_node.id);

        let mut pending = FuturesUnordered::new();
        loop {
            for n in seeds.entries() {
                if pending.len() >= ALPHA {
                    break;
                }
                if asked.insert(n.id) {
                    pending.push(self.query(n.clone(), target, target_type, max));
                }
            }
            if pending.is_empty() {
                break;
            }

            if recursive {
                if let Some(found) = pending.next().await {
                    merge(&mut seeds, &mut seen, found, max);
                }
            } else {
                while let Some(found) = pending.next().await {
                    merge(&mut seeds, &mut seen, found, max);
                }
                break;
            }
        }

        let mut result = seeds.into_entries();
        if target_type != NodeType::Bn {
            result = remove_bn(result);
        }
        debug!(found = result.len(), %target_type, "Find new node done");
        result
    }

    /// One FINDNODE followed by bonding with every returned peer.
    async fn query(&self, n: Node, target: NodeId, target_type: NodeType, max: usize) -> Vec<Node> {
        let found = match self
            .net
            .find_node(n.id, n.udp_addr(), target, target_type, max)
            .await
        {
            Ok(found) => found,
            Err(e) => {
                // Unanswered findnode means a missing bond or a dead peer.
                let fails = self.db.find_fails(&n.id) + 1;
                if let Err(e) = self.db.update_find_fails(&n.id, fails) {
                    debug!(id = ?n.id, error = %e, "Failed to record findnode failure");
                }
                trace!(id = ?n.id, fails, error = %e, "Bumping findnode failure counter");
                if fails >= MAX_FINDNODE_FAILURES {
                    trace!(id = ?n.id, fails, "Too many findnode failures, dropping");
                    self.delete(&n);
                }
                Vec::new()
            }
        };

        let found = if target_type == NodeType::Bn {
            found
        } else {
            remove_bn(found)
        };
        self.bondall(found).await
    }
}

fn merge(seeds: &mut NodesByDistance, seen: &mut HashSet<NodeId>, found: Vec<Node>, max: usize) {
    for n in found {
        if seen.insert(n.id) {
            seeds.push(n, max);
        }
    }
}
