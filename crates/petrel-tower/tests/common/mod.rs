// Shared plumbing for the end-to-end pipeline tests: a tower over in-memory
// storage and clients whose observers drain into plain channels.
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use petrel_client::{
    Client, ClientConfig, ClientObservers, DataLossInfo, MessageReceived, PublishOptions,
    ResultStatus, SubscriptionStatusEvent,
};
use petrel_common::{HostId, SubscriptionParameters, TenantId};
use petrel_router::{FixedShardingStrategy, LogRouter, PublisherRouter};
use petrel_storage::MemoryLogStorage;
use petrel_tower::{ControlTower, TowerOptions};

pub const TENANT: TenantId = TenantId(200);
pub const DEADLINE: Duration = Duration::from_secs(5);

pub struct TestClient {
    pub client: Client,
    pub data_rx: Receiver<MessageReceived>,
    pub status_rx: Receiver<SubscriptionStatusEvent>,
    pub loss_rx: Receiver<DataLossInfo>,
}

pub fn start_tower(storage: &MemoryLogStorage, log_range: (u64, u64)) -> ControlTower {
    petrel_common::logging::init();
    let mut options = TowerOptions::new(Arc::new(storage.clone()));
    options.log_router = LogRouter::new(log_range.0, log_range.1);
    ControlTower::start(options, 0).expect("start tower")
}

pub fn client_config(host: &HostId) -> ClientConfig {
    let sharding = Arc::new(FixedShardingStrategy::new(host.clone(), 16));
    let publisher =
        Arc::new(PublisherRouter::create(&format!("pilot={host}")).expect("publisher router"));
    let mut config = ClientConfig::new(sharding, publisher);
    config.num_workers = 2;
    config
}

pub fn start_client(config: ClientConfig) -> TestClient {
    let (data_tx, data_rx) = channel();
    let (status_tx, status_rx) = channel();
    let (loss_tx, loss_rx) = channel();
    let data_tx = Mutex::new(data_tx);
    let status_tx = Mutex::new(status_tx);
    let loss_tx = Mutex::new(loss_tx);
    let observers = ClientObservers::new(
        move |message| {
            let _ = data_tx.lock().expect("data tx").send(message);
        },
        move |status| {
            let _ = status_tx.lock().expect("status tx").send(status);
        },
    )
    .with_data_loss(move |info| {
        let _ = loss_tx.lock().expect("loss tx").send(info);
    });
    let client = Client::start(config, observers).expect("start client");
    TestClient {
        client,
        data_rx,
        status_rx,
        loss_rx,
    }
}

pub fn subscribe(client: &TestClient, topic: &str, start: u64) -> u64 {
    client
        .client
        .subscribe(SubscriptionParameters {
            tenant_id: TENANT,
            namespace_id: "guest".into(),
            topic_name: topic.into(),
            start_seqno: start,
        })
        .expect("subscribe")
}

/// Publish and wait for the broker's acknowledgement.
pub fn publish_ok(client: &TestClient, topic: &str, payload: &[u8]) -> u64 {
    let result = publish(client, topic, payload, None);
    assert!(result.status.is_ok(), "publish failed: {}", result.status);
    result.seqno
}

pub fn publish(
    client: &TestClient,
    topic: &str,
    payload: &[u8],
    msg_id: Option<petrel_common::MsgId>,
) -> ResultStatus {
    let (tx, rx) = channel();
    let status = client.client.publish(
        TENANT,
        "guest".into(),
        topic.into(),
        PublishOptions,
        Bytes::copy_from_slice(payload),
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
        msg_id,
    );
    assert!(status.status.is_ok(), "publish rejected: {}", status.status);
    rx.recv_timeout(DEADLINE).expect("publish acknowledgement")
}

pub fn next_data(client: &TestClient) -> MessageReceived {
    client
        .data_rx
        .recv_timeout(DEADLINE)
        .expect("delivery within deadline")
}

pub fn expect_no_data(client: &TestClient, wait: Duration) {
    match client.data_rx.recv_timeout(wait) {
        Err(RecvTimeoutError::Timeout) => {}
        Ok(message) => panic!("unexpected delivery: {message:?}"),
        Err(other) => panic!("data channel broken: {other:?}"),
    }
}
