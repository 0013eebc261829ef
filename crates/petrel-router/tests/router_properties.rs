// Placement properties shared by both routers: assignments move minimally
// when the fleet grows, spread evenly, and follow a host swap exactly.
use std::collections::{BTreeMap, HashMap, HashSet};

use petrel_common::HostId;
use petrel_router::{ConsistentHashRouter, HostSelector, NodeId, RendezvousHashRouter};

fn make_hosts(count: u64) -> BTreeMap<NodeId, HostId> {
    (0..count)
        .map(|i| (i, HostId::new(format!("host-{i}"), 4450)))
        .collect()
}

fn consistency_test(make_router: impl Fn(BTreeMap<NodeId, HostId>, usize) -> Box<dyn HostSelector>) {
    // Growing the fleet by 5% should move roughly 5% of assignments.
    let num_hosts = 1000;
    let num_copies = 3;
    let router1 = make_router(make_hosts(num_hosts), num_copies);
    let router2 = make_router(make_hosts(num_hosts * 105 / 100), num_copies);

    let num_logs = 100_000u64;
    let mut relocations = 0usize;
    for log in 0..num_logs {
        let before: HashSet<HostId> = router1.hosts_for(log).into_iter().collect();
        let after: HashSet<HostId> = router2.hosts_for(log).into_iter().collect();
        assert_eq!(before.len(), num_copies);
        assert_eq!(after.len(), num_copies);
        relocations += before.difference(&after).count();
    }

    // Ideally ~5% move; allow a 2-8% band.
    let total = (num_logs as usize) * num_copies;
    assert!(relocations < total * 8 / 100, "too many moves: {relocations}");
    assert!(relocations > total * 2 / 100, "too few moves: {relocations}");
}

#[test]
fn consistency_consistent_hash() {
    consistency_test(|hosts, copies| Box::new(ConsistentHashRouter::new(hosts, 100, copies)));
}

#[test]
fn consistency_rendezvous_hash() {
    consistency_test(|hosts, copies| Box::new(RendezvousHashRouter::new(hosts, copies)));
}

fn distribution_test(make_router: impl Fn(BTreeMap<NodeId, HostId>) -> Box<dyn HostSelector>) {
    // Logs should spread evenly across hosts.
    let num_hosts = 1000u64;
    let hosts = make_hosts(num_hosts);
    let mut log_count: HashMap<HostId, usize> =
        hosts.values().map(|host| (host.clone(), 0)).collect();
    let router = make_router(hosts);

    let num_logs = 100_000u64;
    for log in 0..num_logs {
        let picked = router.hosts_for(log);
        *log_count.get_mut(&picked[0]).expect("known host") += 1;
    }

    let expected = (num_logs / num_hosts) as usize;
    let min = log_count.values().min().expect("counts");
    let max = log_count.values().max().expect("counts");
    assert!(*min > expected / 2, "underloaded host: {min} vs {expected}");
    assert!(*max < expected * 16 / 10, "overloaded host: {max} vs {expected}");
}

#[test]
fn distribution_consistent_hash() {
    distribution_test(|hosts| Box::new(ConsistentHashRouter::new(hosts, 100, 1)));
}

#[test]
fn distribution_rendezvous_hash() {
    distribution_test(|hosts| Box::new(RendezvousHashRouter::new(hosts, 1)));
}

fn change_host_test(make_router: impl Fn(BTreeMap<NodeId, HostId>) -> Box<dyn HostSelector>) {
    // Swapping the host bound to one node moves exactly that node's logs.
    let mut hosts: BTreeMap<NodeId, HostId> = (0..3).map(|i| (i, HostId::local(i as u16))).collect();
    let num_logs = 10_000u64;

    let mut logs_before: HashMap<HostId, HashSet<u64>> = HashMap::new();
    {
        let router = make_router(hosts.clone());
        for log in 0..num_logs {
            let picked = router.hosts_for(log);
            logs_before.entry(picked[0].clone()).or_default().insert(log);
        }
    }

    // Swap out node 1 with a brand-new host.
    hosts.insert(1, HostId::local(3));

    let mut logs_after: HashMap<HostId, HashSet<u64>> = HashMap::new();
    {
        let router = make_router(hosts);
        for log in 0..num_logs {
            let picked = router.hosts_for(log);
            logs_after.entry(picked[0].clone()).or_default().insert(log);
        }
    }

    assert_eq!(
        logs_before.get(&HostId::local(1)),
        logs_after.get(&HostId::local(3)),
        "replacement host must serve exactly the swapped node's logs"
    );
    assert_eq!(
        logs_before.get(&HostId::local(0)),
        logs_after.get(&HostId::local(0))
    );
    assert_eq!(
        logs_before.get(&HostId::local(2)),
        logs_after.get(&HostId::local(2))
    );
}

#[test]
fn change_host_consistent_hash() {
    change_host_test(|hosts| Box::new(ConsistentHashRouter::new(hosts, 100, 1)));
}

#[test]
fn change_host_rendezvous_hash() {
    change_host_test(|hosts| Box::new(RendezvousHashRouter::new(hosts, 1)));
}
