// Consistent-hash ring over routing nodes. Ring points are derived from the
// stable node id, not the bound host, so swapping the host behind a node
// moves exactly that node's keys and nothing else.
use std::collections::BTreeMap;

use petrel_common::hash::{hash_combine, murmur2_64};
use petrel_common::HostId;

use crate::{HostSelector, NodeId};

pub struct ConsistentHashRouter {
    // (ring position, node) sorted by position.
    ring: Vec<(u64, NodeId)>,
    hosts: BTreeMap<NodeId, HostId>,
    num_copies: usize,
}

impl ConsistentHashRouter {
    /// Place each node at `replicas` points on the ring; a key is served by
    /// the next `num_copies` distinct nodes clockwise.
    pub fn new(hosts: BTreeMap<NodeId, HostId>, replicas: usize, num_copies: usize) -> Self {
        let mut ring = Vec::with_capacity(hosts.len() * replicas);
        for node in hosts.keys() {
            let base = murmur2_64(&node.to_le_bytes(), 0x5eed);
            for replica in 0..replicas {
                ring.push((hash_combine(base, replica as u64), *node));
            }
        }
        ring.sort_unstable();
        ConsistentHashRouter {
            ring,
            hosts,
            num_copies: num_copies.max(1),
        }
    }
}

impl HostSelector for ConsistentHashRouter {
    fn hosts_for(&self, key: u64) -> Vec<HostId> {
        if self.ring.is_empty() {
            return Vec::new();
        }
        let point = murmur2_64(&key.to_le_bytes(), 0x10c5);
        let start = self.ring.partition_point(|(pos, _)| *pos < point);
        let mut picked: Vec<NodeId> = Vec::with_capacity(self.num_copies);
        for offset in 0..self.ring.len() {
            let (_, node) = self.ring[(start + offset) % self.ring.len()];
            if !picked.contains(&node) {
                picked.push(node);
                if picked.len() == self.num_copies {
                    break;
                }
            }
        }
        picked
            .into_iter()
            .filter_map(|node| self.hosts.get(&node).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_hosts(count: u64) -> BTreeMap<NodeId, HostId> {
        (0..count).map(|i| (i, HostId::local(i as u16))).collect()
    }

    #[test]
    fn returns_distinct_copies() {
        let router = ConsistentHashRouter::new(make_hosts(5), 50, 3);
        for key in 0..100 {
            let hosts = router.hosts_for(key);
            assert_eq!(hosts.len(), 3);
            let mut dedup = hosts.clone();
            dedup.sort();
            dedup.dedup();
            assert_eq!(dedup.len(), 3, "duplicate hosts for key {key}");
        }
    }

    #[test]
    fn stable_across_calls() {
        let router = ConsistentHashRouter::new(make_hosts(10), 100, 2);
        for key in 0..50 {
            assert_eq!(router.hosts_for(key), router.hosts_for(key));
        }
    }

    #[test]
    fn copies_capped_by_fleet_size() {
        let router = ConsistentHashRouter::new(make_hosts(2), 10, 5);
        assert_eq!(router.hosts_for(7).len(), 2);
    }
}
