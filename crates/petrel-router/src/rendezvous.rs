// Rendezvous (highest-random-weight) hashing: score every node against the
// key and take the top `num_copies`. Scores depend on the stable node id so a
// host swap behind a node keeps the node's assignments.
use std::collections::BTreeMap;

use petrel_common::hash::{hash_combine, murmur2_64};
use petrel_common::HostId;

use crate::{HostSelector, NodeId};

pub struct RendezvousHashRouter {
    nodes: Vec<(NodeId, u64)>,
    hosts: BTreeMap<NodeId, HostId>,
    num_copies: usize,
}

impl RendezvousHashRouter {
    pub fn new(hosts: BTreeMap<NodeId, HostId>, num_copies: usize) -> Self {
        let nodes = hosts
            .keys()
            .map(|node| (*node, murmur2_64(&node.to_le_bytes(), 0x0dd5)))
            .collect();
        RendezvousHashRouter {
            nodes,
            hosts,
            num_copies: num_copies.max(1),
        }
    }
}

impl HostSelector for RendezvousHashRouter {
    fn hosts_for(&self, key: u64) -> Vec<HostId> {
        let key_hash = murmur2_64(&key.to_le_bytes(), 0x10c5);
        let mut scored: Vec<(u64, NodeId)> = self
            .nodes
            .iter()
            .map(|(node, node_hash)| (hash_combine(*node_hash, key_hash), *node))
            .collect();
        // Highest score wins; node id breaks ties deterministically.
        scored.sort_unstable_by(|a, b| b.cmp(a));
        scored
            .into_iter()
            .take(self.num_copies)
            .filter_map(|(_, node)| self.hosts.get(&node).cloned())
            .collect()
    }
}
