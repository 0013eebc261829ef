// Public client. Validates on the caller's thread, then routes every
// operation to the worker owning the topic.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use petrel_common::{
    is_reserved_namespace, MsgId, NamespaceId, Status, StatusCode, SubscriptionHandle,
    SubscriptionParameters, TenantId, Topic,
};
use petrel_io::MsgLoop;
use petrel_storage::FileSubscriptionStorage;
use tokio::sync::mpsc;

use crate::config::ClientConfig;
use crate::worker::{install_worker, SaveAggregator, WorkerCmd, WorkerEnv};
use crate::{
    ClientObservers, MessageReceived, PublishCallback, PublishOptions, PublishStatus,
    SaveCallback, SubscriptionObserver, TailCallback,
};

/// A handle to the client; cheap to clone, safe to share across threads.
///
/// ```no_run
/// use std::sync::Arc;
/// use petrel_client::{Client, ClientConfig, ClientObservers};
/// use petrel_router::{FixedShardingStrategy, PublisherRouter};
///
/// let sharding = Arc::new(FixedShardingStrategy::new("broker:4450".parse().unwrap(), 16));
/// let publisher = Arc::new(PublisherRouter::create("pilot=broker:4450").unwrap());
/// let observers = ClientObservers::new(
///     |message| println!("got {:?} at {}", message.contents, message.seqno),
///     |status| println!("status {:?}", status.status),
/// );
/// let client = Client::start(ClientConfig::new(sharding, publisher), observers).unwrap();
/// let _handle = client
///     .subscribe(petrel_common::SubscriptionParameters {
///         tenant_id: petrel_common::TenantId(200),
///         namespace_id: "guest".into(),
///         topic_name: "orders".into(),
///         start_seqno: 0,
///     })
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    msg_loop: MsgLoop,
    worker_txs: Vec<mpsc::Sender<WorkerCmd>>,
    next_sub_seq: AtomicU64,
    storage: Option<FileSubscriptionStorage>,
}

impl Client {
    /// Start the worker loops. Everything observable by the application
    /// flows through `observers` unless a subscription overrides them.
    pub fn start(config: ClientConfig, observers: ClientObservers) -> Result<Client, Status> {
        let msg_loop = MsgLoop::spawn("petrel-client", config.num_workers, config.io.clone())
            .map_err(|err| Status::io_error(format!("spawn client workers: {err}")))?;
        let env = Arc::new(WorkerEnv {
            observers,
            sharding: Arc::clone(&config.sharding),
            publisher: Arc::clone(&config.publisher),
            router_poll_period: config.router_poll_period,
        });
        let mut worker_txs = Vec::with_capacity(msg_loop.num_workers());
        for index in 0..msg_loop.num_workers() {
            let (tx, rx) = mpsc::channel(config.worker_queue_depth.max(1));
            let env = Arc::clone(&env);
            msg_loop.submit_to(index, move |ctx| {
                install_worker(ctx, index, env, rx);
            })?;
            worker_txs.push(tx);
        }
        Ok(Client {
            inner: Arc::new(ClientInner {
                msg_loop,
                worker_txs,
                next_sub_seq: AtomicU64::new(1),
                storage: config
                    .subscription_storage
                    .map(FileSubscriptionStorage::new),
            }),
        })
    }

    pub fn num_workers(&self) -> usize {
        self.inner.msg_loop.num_workers()
    }

    /// Publish a payload to `(namespace, topic)`. Validation failures are
    /// returned immediately; everything else arrives via `callback`.
    pub fn publish(
        &self,
        tenant: TenantId,
        namespace: NamespaceId,
        topic: Topic,
        _options: PublishOptions,
        payload: Bytes,
        callback: PublishCallback,
        msg_id: Option<MsgId>,
    ) -> PublishStatus {
        let msg_id = msg_id.unwrap_or_else(MsgId::generate);
        if !tenant.is_valid_for_publish() {
            return PublishStatus {
                status: Status::invalid_argument("tenant id must be greater than 100"),
                msg_id,
            };
        }
        if namespace.is_empty() || is_reserved_namespace(&namespace) {
            return PublishStatus {
                status: Status::invalid_argument("namespace is reserved for internal usage"),
                msg_id,
            };
        }
        let status = self.send_to_topic_worker(
            &topic.clone(),
            WorkerCmd::Publish {
                tenant,
                namespace,
                topic,
                msg_id,
                payload,
                callback,
            },
        );
        PublishStatus { status, msg_id }
    }

    /// Create a subscription. The returned handle is unique for the
    /// lifetime of this client process.
    pub fn subscribe(&self, params: SubscriptionParameters) -> Result<SubscriptionHandle, Status> {
        self.subscribe_with(params, SubscriptionObserver::default())
    }

    /// Like `subscribe`, with per-subscription observer overrides.
    pub fn subscribe_with(
        &self,
        params: SubscriptionParameters,
        observer: SubscriptionObserver,
    ) -> Result<SubscriptionHandle, Status> {
        let num_workers = self.num_workers() as u64;
        let worker = self.inner.msg_loop.worker_for_topic(&params.topic_name);
        let seq = self.inner.next_sub_seq.fetch_add(1, Ordering::Relaxed);
        // Handles encode their worker so later calls route without hashing.
        let handle = seq * num_workers + worker as u64;
        self.try_send(
            worker,
            WorkerCmd::Subscribe {
                handle,
                params,
                observer,
            },
        )?;
        Ok(handle)
    }

    /// Terminate the subscription on `(namespace, topic)`. A missing
    /// subscription is a warning on the worker, not an error here.
    pub fn unsubscribe(&self, namespace: NamespaceId, topic: Topic) -> Status {
        self.send_to_topic_worker(
            &topic.clone(),
            WorkerCmd::UnsubscribeTopic { namespace, topic },
        )
    }

    /// Record that the application consumed `message`; a later
    /// `save_subscriptions` persists the next seqno to resume from.
    pub fn acknowledge(&self, message: &MessageReceived) -> Status {
        let worker = (message.handle % self.num_workers() as u64) as usize;
        match self.try_send(
            worker,
            WorkerCmd::Acknowledge {
                handle: message.handle,
                seqno: message.seqno,
            },
        ) {
            Ok(()) => Status::ok(),
            Err(status) => status,
        }
    }

    /// Ask the shard's broker for the topic's tail sequence number.
    pub fn find_tail_seqno(
        &self,
        tenant: TenantId,
        namespace: NamespaceId,
        topic: Topic,
        callback: TailCallback,
    ) -> Status {
        self.send_to_topic_worker(
            &topic.clone(),
            WorkerCmd::FindTailSeqno {
                tenant,
                namespace,
                topic,
                callback,
            },
        )
    }

    /// Persist every live subscription: one snapshot part per worker, an
    /// atomic commit, then `callback` with the overall status.
    pub fn save_subscriptions(&self, callback: SaveCallback) {
        let Some(storage) = &self.inner.storage else {
            callback(Status::not_initialized("no subscription storage configured"));
            return;
        };
        let num_workers = self.num_workers();
        let snapshot = Arc::new(storage.create_snapshot(num_workers));
        let aggregator = Arc::new(SaveAggregator::new(
            num_workers,
            Arc::clone(&snapshot),
            callback,
        ));
        for worker in 0..num_workers {
            let command = WorkerCmd::SaveSnapshot {
                snapshot: Arc::clone(&snapshot),
                worker_index: worker,
                aggregator: Arc::clone(&aggregator),
            };
            if let Err(status) = self.try_send(worker, command) {
                aggregator.worker_done(status);
            }
        }
    }

    /// Synchronously read back the last committed snapshot.
    pub fn restore_subscriptions(&self) -> Result<Vec<SubscriptionParameters>, Status> {
        let Some(storage) = &self.inner.storage else {
            return Err(Status::not_initialized("no subscription storage configured"));
        };
        storage
            .restore_subscriptions()
            .map_err(|err| Status::io_error(format!("restore subscriptions: {err}")))
    }

    fn send_to_topic_worker(&self, topic: &str, command: WorkerCmd) -> Status {
        let worker = self.inner.msg_loop.worker_for_topic(topic);
        match self.try_send(worker, command) {
            Ok(()) => Status::ok(),
            Err(status) => status,
        }
    }

    fn try_send(&self, worker: usize, command: WorkerCmd) -> Result<(), Status> {
        let tx = self
            .inner
            .worker_txs
            .get(worker)
            .ok_or_else(|| Status::internal_error("worker index out of range"))?;
        tx.try_send(command).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => {
                Status::new(StatusCode::QueueFull, "client worker queue at capacity")
            }
            mpsc::error::TrySendError::Closed(_) => {
                Status::new(StatusCode::NotInitialized, "client worker stopped")
            }
        })
    }
}
