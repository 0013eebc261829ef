// End-to-end subscription pipeline: client workers, wire protocol, rooms,
// topic tailer, and in-memory log storage.
mod common;

use std::collections::HashSet;
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use petrel_common::{MsgId, SubscriptionParameters};
use petrel_router::{FixedShardingStrategy, PublisherRouter};
use petrel_storage::MemoryLogStorage;

#[test]
fn publish_then_subscribe_receives_exactly_that_record() {
    let storage = MemoryLogStorage::new();
    let tower = start_tower(&storage, (1, 4));
    let client = start_client(client_config(tower.local_host()));

    let seqno = publish_ok(&client, "t1", b"hi");
    subscribe(&client, "t1", seqno);

    let received = next_data(&client);
    assert_eq!(received.seqno, seqno);
    assert_eq!(received.contents.as_ref(), b"hi");
    assert_eq!(received.topic, "t1");
    expect_no_data(&client, Duration::from_millis(300));
}

#[test]
fn subscribe_from_next_waits_for_a_publish() {
    let storage = MemoryLogStorage::new();
    let tower = start_tower(&storage, (1, 4));
    let client = start_client(client_config(tower.local_host()));

    subscribe(&client, "fresh-topic", 0);
    // Nothing exists yet, so nothing may arrive.
    expect_no_data(&client, Duration::from_millis(500));

    publish_ok(&client, "fresh-topic", b"first");
    let received = next_data(&client);
    assert_eq!(received.contents.as_ref(), b"first");
    expect_no_data(&client, Duration::from_millis(300));
}

#[test]
fn subscription_skips_foreign_records_in_the_shared_log() {
    // One log for everything: records of other topics occupy seqnos around
    // ours, and the subscription sees only its own, in order.
    let storage = MemoryLogStorage::new();
    let tower = start_tower(&storage, (7, 7));
    let client = start_client(client_config(tower.local_host()));

    // Lay out the log: t1 lands at seqnos 3, 7, and 9.
    for (topic, payload) in [
        ("noise", b"n1" as &[u8]),
        ("noise", b"n2"),
        ("t1", b"a"),
        ("noise", b"n3"),
        ("noise", b"n4"),
        ("noise", b"n5"),
        ("t1", b"b"),
        ("noise", b"n6"),
        ("t1", b"c"),
    ] {
        publish_ok(&client, topic, payload);
    }

    subscribe(&client, "t1", 5);
    let first = next_data(&client);
    assert_eq!(first.seqno, 7, "the record at 3 predates the subscription");
    assert_eq!(first.contents.as_ref(), b"b");
    let second = next_data(&client);
    assert_eq!(second.seqno, 9);
    assert_eq!(second.contents.as_ref(), b"c");
    expect_no_data(&client, Duration::from_millis(300));
}

#[test]
fn overlapping_subscriptions_intersect_on_the_later_start() {
    let storage = MemoryLogStorage::new();
    let tower = start_tower(&storage, (1, 4));
    let client = start_client(client_config(tower.local_host()));

    let mut seqnos = Vec::new();
    for payload in [b"r1" as &[u8], b"r2", b"r3", b"r4", b"r5"] {
        seqnos.push(publish_ok(&client, "shared", payload));
    }

    let early = subscribe(&client, "shared", seqnos[0]);
    let late = subscribe(&client, "shared", seqnos[2]);

    let mut early_seen = Vec::new();
    let mut late_seen = Vec::new();
    for _ in 0..8 {
        let received = next_data(&client);
        if received.handle == early {
            early_seen.push(received.seqno);
        } else if received.handle == late {
            late_seen.push(received.seqno);
        } else {
            panic!("delivery for unknown handle {}", received.handle);
        }
    }
    assert_eq!(early_seen, seqnos);
    assert_eq!(late_seen, seqnos[2..].to_vec());

    // The intersection of the two delivery sets is exactly the range from
    // the later start onward.
    let early_set: HashSet<u64> = early_seen.into_iter().collect();
    let late_set: HashSet<u64> = late_seen.into_iter().collect();
    let intersection: HashSet<u64> = early_set.intersection(&late_set).copied().collect();
    assert_eq!(intersection, seqnos[2..].iter().copied().collect());
}

#[test]
fn unsubscribe_stops_deliveries_and_cleans_tables() {
    let storage = MemoryLogStorage::new();
    let tower = start_tower(&storage, (1, 4));
    let client = start_client(client_config(tower.local_host()));

    subscribe(&client, "t1", 1);
    publish_ok(&client, "t1", b"one");
    assert_eq!(next_data(&client).contents.as_ref(), b"one");

    let status = client.client.unsubscribe("guest".into(), "t1".into());
    assert!(status.is_ok());
    std::thread::sleep(Duration::from_millis(200));

    publish_ok(&client, "t1", b"two");
    expect_no_data(&client, Duration::from_millis(400));
}

#[test]
fn duplicate_message_id_never_acks_twice() {
    let storage = MemoryLogStorage::new();
    let tower = start_tower(&storage, (1, 4));
    let client = start_client(client_config(tower.local_host()));

    let msg_id = MsgId::generate();
    let first = publish(&client, "t1", b"payload", Some(msg_id));
    assert!(first.status.is_ok());
    assert!(first.seqno > 0);

    let second = publish(&client, "t1", b"payload", Some(msg_id));
    assert!(
        !second.status.is_ok(),
        "duplicate id acked twice: {:?}",
        second.status
    );
}

#[test]
fn find_tail_seqno_reports_the_latest_record() {
    let storage = MemoryLogStorage::new();
    let tower = start_tower(&storage, (1, 4));
    let client = start_client(client_config(tower.local_host()));

    let mut last = 0;
    for payload in [b"a" as &[u8], b"b", b"c"] {
        last = publish_ok(&client, "t1", payload);
    }

    let (tx, rx) = channel();
    let status = client.client.find_tail_seqno(
        TENANT,
        "guest".into(),
        "t1".into(),
        Box::new(move |status, seqno| {
            let _ = tx.send((status, seqno));
        }),
    );
    assert!(status.is_ok());
    let (status, seqno) = rx.recv_timeout(DEADLINE).expect("tail reply");
    assert!(status.is_ok(), "tail lookup failed: {status}");
    assert_eq!(seqno, last);
}

#[test]
fn save_then_restore_resumes_after_the_last_ack() {
    let storage = MemoryLogStorage::new();
    let tower = start_tower(&storage, (1, 4));
    let snapshot_dir = tempfile_dir();
    let mut config = client_config(tower.local_host());
    config.subscription_storage = Some(snapshot_dir.join("subscriptions"));
    let client = start_client(config);

    subscribe(&client, "t1", 1);
    publish_ok(&client, "t1", b"a");
    publish_ok(&client, "t1", b"b");
    let first = next_data(&client);
    let second = next_data(&client);
    assert!(client.client.acknowledge(&first).is_ok());
    assert!(client.client.acknowledge(&second).is_ok());

    let (tx, rx) = channel();
    client.client.save_subscriptions(Box::new(move |status| {
        let _ = tx.send(status);
    }));
    let status = rx.recv_timeout(DEADLINE).expect("save callback");
    assert!(status.is_ok(), "save failed: {status}");

    let restored = client.client.restore_subscriptions().expect("restore");
    assert_eq!(restored.len(), 1);
    assert_eq!(
        restored[0],
        SubscriptionParameters {
            tenant_id: TENANT,
            namespace_id: "guest".into(),
            topic_name: "t1".into(),
            start_seqno: second.seqno + 1,
        }
    );
}

#[test]
fn host_swap_reissues_subscriptions_without_duplicates() {
    // Two towers over one shared log; the router swings the shard from one
    // to the other mid-subscription.
    let storage = MemoryLogStorage::new();
    let tower_a = start_tower(&storage, (1, 4));
    let tower_b = start_tower(&storage, (1, 4));

    let sharding = Arc::new(FixedShardingStrategy::new(tower_a.local_host().clone(), 16));
    let publisher = Arc::new(
        PublisherRouter::create(&format!("pilot={}", tower_a.local_host()))
            .expect("publisher router"),
    );
    let mut config = petrel_client::ClientConfig::new(sharding.clone(), publisher);
    config.num_workers = 2;
    let client = start_client(config);

    subscribe(&client, "moving", 1);
    let mut seen = Vec::new();
    for payload in [b"r1" as &[u8], b"r2", b"r3"] {
        publish_ok(&client, "moving", payload);
    }
    for _ in 0..3 {
        let received = next_data(&client);
        assert!(client.client.acknowledge(&received).is_ok());
        seen.push(received.seqno);
    }

    // Swap the shard's host; the router version bump drives a rewind and
    // replay against the new tower.
    sharding.set_host(tower_b.local_host().clone());
    std::thread::sleep(Duration::from_millis(500));

    for payload in [b"r4" as &[u8], b"r5", b"r6"] {
        publish_ok(&client, "moving", payload);
    }
    for _ in 0..3 {
        seen.push(next_data(&client).seqno);
    }

    // Every record exactly once; nothing at or below the last ack repeats.
    let unique: HashSet<u64> = seen.iter().copied().collect();
    assert_eq!(unique.len(), seen.len(), "duplicate delivery in {seen:?}");
    assert_eq!(seen.len(), 6);
    let mut sorted = seen.clone();
    sorted.sort_unstable();
    assert_eq!(seen, sorted, "deliveries out of order: {seen:?}");
    expect_no_data(&client, Duration::from_millis(300));
    drop(tower_a);
}

#[test]
fn soak_every_message_acked_and_received_once() {
    let storage = MemoryLogStorage::new();
    let tower = start_tower(&storage, (1, 4));
    let client = start_client(client_config(tower.local_host()));

    subscribe(&client, "soak", 1);
    std::thread::sleep(Duration::from_millis(200));

    let total = 100usize;
    let (ack_tx, ack_rx) = channel();
    for index in 0..total {
        let ack_tx = ack_tx.clone();
        let payload = format!("payload-{index}");
        let status = client.client.publish(
            TENANT,
            "guest".into(),
            "soak".into(),
            petrel_client::PublishOptions,
            bytes::Bytes::from(payload),
            Box::new(move |result| {
                let _ = ack_tx.send(result);
            }),
            None,
        );
        assert!(status.status.is_ok());
    }
    for _ in 0..total {
        let result = ack_rx.recv_timeout(DEADLINE).expect("ack");
        assert!(result.status.is_ok(), "publish failed: {}", result.status);
        assert!(result.seqno > 0);
    }

    let mut received = Vec::with_capacity(total);
    let mut seen = HashSet::new();
    for _ in 0..total {
        let message = next_data(&client);
        assert!(
            seen.insert(message.seqno),
            "duplicate delivery of {}",
            message.seqno
        );
        received.push((message.seqno, message.contents.clone()));
    }
    assert_eq!(received.len(), total);

    // Publish order must survive into sequence-number order: the pilot
    // assigns seqnos in receive order, so sorting by seqno must recover
    // payload-0..payload-99 exactly.
    received.sort_by_key(|(seqno, _)| *seqno);
    for (index, (_, contents)) in received.iter().enumerate() {
        assert_eq!(
            contents.as_ref(),
            format!("payload-{index}").as_bytes(),
            "payload out of publish order at rank {index}"
        );
    }
    expect_no_data(&client, Duration::from_millis(300));
}

#[test]
fn admin_interface_answers_cache_and_log_queries() {
    let storage = MemoryLogStorage::new();
    let tower = start_tower(&storage, (1, 4));
    let client = start_client(client_config(tower.local_host()));

    subscribe(&client, "t1", 1);
    publish_ok(&client, "t1", b"abc");
    assert_eq!(next_data(&client).contents.as_ref(), b"abc");

    let logs = tower.run_admin_command("logs").expect("logs");
    assert!(logs.contains("room"), "unexpected dump: {logs}");
    let usage = tower.run_admin_command("cache usage").expect("usage");
    assert!(usage.lines().count() >= 1);
    tower.run_admin_command("cache clear").expect("clear");
    tower
        .run_admin_command("cache set 1048576")
        .expect("set capacity");
    assert!(tower.run_admin_command("cache set 9999999999999999").is_err());
    assert!(tower.run_admin_command("bogus").is_err());
}

fn tempfile_dir() -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("petrel-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}
