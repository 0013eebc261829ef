// Per-worker state. Every subscription handled by this worker lives in the
// shard map owning its route; the worker reacts to router version bumps by
// rewinding and replaying affected subscriptions.
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use petrel_common::{
    MsgId, NamespaceId, SequenceNumber, Status, SubscriptionHandle, SubscriptionParameters,
    TenantId, Topic,
};
use petrel_io::{LoopCtx, StreamEvent};
use petrel_router::{PublisherRouter, ShardId, ShardingStrategy};
use petrel_storage::SubscriptionSnapshot;
use petrel_wire::{GapType, Message, UnsubscribeReason};
use tokio::sync::mpsc;

use crate::id_allocator::IdAllocator;
use crate::publisher::Publisher;
use crate::subscriptions_map::{
    MapCallbacks, SubscriptionData, SubscriptionEntry, SubscriptionsMap,
};
use crate::{
    ClientObservers, DataLossInfo, MessageReceived, PublishCallback, SaveCallback,
    SubscriptionObserver, SubscriptionStatusEvent, TailCallback,
};

/// Commands crossing from the API surface onto a worker loop.
pub(crate) enum WorkerCmd {
    Subscribe {
        handle: SubscriptionHandle,
        params: SubscriptionParameters,
        observer: SubscriptionObserver,
    },
    UnsubscribeTopic {
        namespace: NamespaceId,
        topic: Topic,
    },
    Acknowledge {
        handle: SubscriptionHandle,
        seqno: SequenceNumber,
    },
    Publish {
        tenant: TenantId,
        namespace: NamespaceId,
        topic: Topic,
        msg_id: MsgId,
        payload: Bytes,
        callback: PublishCallback,
    },
    FindTailSeqno {
        tenant: TenantId,
        namespace: NamespaceId,
        topic: Topic,
        callback: TailCallback,
    },
    SaveSnapshot {
        snapshot: Arc<SubscriptionSnapshot>,
        worker_index: usize,
        aggregator: Arc<SaveAggregator>,
    },
}

/// Counts worker snapshot parts down and commits once on the last one.
pub(crate) struct SaveAggregator {
    remaining: AtomicUsize,
    snapshot: Arc<SubscriptionSnapshot>,
    first_error: Mutex<Option<Status>>,
    callback: Mutex<Option<SaveCallback>>,
}

impl SaveAggregator {
    pub(crate) fn new(
        num_workers: usize,
        snapshot: Arc<SubscriptionSnapshot>,
        callback: SaveCallback,
    ) -> Self {
        SaveAggregator {
            remaining: AtomicUsize::new(num_workers),
            snapshot,
            first_error: Mutex::new(None),
            callback: Mutex::new(Some(callback)),
        }
    }

    pub(crate) fn worker_done(&self, status: Status) {
        if !status.is_ok() {
            let mut first_error = self.first_error.lock().expect("error slot");
            first_error.get_or_insert(status);
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let status = match self.first_error.lock().expect("error slot").take() {
            Some(status) => status,
            None => match self.snapshot.commit() {
                Ok(()) => Status::ok(),
                Err(err) => Status::io_error(format!("commit snapshot: {err}")),
            },
        };
        if let Some(callback) = self.callback.lock().expect("save callback").take() {
            callback(status);
        }
    }
}

/// Environment shared by all workers; everything here is `Send + Sync`.
pub(crate) struct WorkerEnv {
    pub(crate) observers: ClientObservers,
    pub(crate) sharding: Arc<dyn ShardingStrategy>,
    pub(crate) publisher: Arc<PublisherRouter>,
    pub(crate) router_poll_period: std::time::Duration,
}

/// State stored per subscription in the shard maps.
pub(crate) struct ClientSub {
    data: SubscriptionData,
    handle: SubscriptionHandle,
    last_acked: SequenceNumber,
    observer: SubscriptionObserver,
}

impl SubscriptionEntry for ClientSub {
    fn data(&self) -> &SubscriptionData {
        &self.data
    }
    fn data_mut(&mut self) -> &mut SubscriptionData {
        &mut self.data
    }
}

struct ShardSubs {
    map: SubscriptionsMap<ClientSub>,
}

struct SubRef {
    shard: ShardId,
    sub_id: u64,
}

struct WorkerState {
    shards: HashMap<ShardId, ShardSubs>,
    by_handle: HashMap<SubscriptionHandle, SubRef>,
    topic_index: HashMap<(NamespaceId, Topic), SubscriptionHandle>,
    allocator: IdAllocator,
    router_version: u64,
    pending_tails: HashMap<(NamespaceId, Topic), Vec<TailCallback>>,
}

pub(crate) struct WorkerCore {
    ctx: LoopCtx,
    index: usize,
    env: Arc<WorkerEnv>,
    publisher: Publisher,
    state: RefCell<WorkerState>,
}

/// Install a worker on its loop: build the core, start the command pump and
/// the router poll timer.
pub(crate) fn install_worker(
    ctx: &LoopCtx,
    index: usize,
    env: Arc<WorkerEnv>,
    mut commands: mpsc::Receiver<WorkerCmd>,
) {
    let pilot = env.publisher.pilot().clone();
    let core = Rc::new(WorkerCore {
        ctx: ctx.clone(),
        index,
        env,
        publisher: Publisher::new(ctx, pilot),
        state: RefCell::new(WorkerState {
            shards: HashMap::new(),
            by_handle: HashMap::new(),
            topic_index: HashMap::new(),
            allocator: IdAllocator::new(),
            router_version: 0,
            pending_tails: HashMap::new(),
        }),
    });

    let pump_core = Rc::clone(&core);
    ctx.spawn(async move {
        while let Some(command) = commands.recv().await {
            pump_core.handle(command);
        }
    });

    let poll_core = Rc::downgrade(&core);
    let timer = ctx.register_timer(core.env.router_poll_period, move |_ctx| {
        if let Some(core) = poll_core.upgrade() {
            core.poll_router();
        }
    });
    timer.detach();
}

impl WorkerCore {
    fn handle(self: &Rc<Self>, command: WorkerCmd) {
        match command {
            WorkerCmd::Subscribe {
                handle,
                params,
                observer,
            } => self.start_subscription(handle, params, observer),
            WorkerCmd::UnsubscribeTopic { namespace, topic } => {
                self.unsubscribe_topic(namespace, topic)
            }
            WorkerCmd::Acknowledge { handle, seqno } => self.acknowledge(handle, seqno),
            WorkerCmd::Publish {
                tenant,
                namespace,
                topic,
                msg_id,
                payload,
                callback,
            } => self
                .publisher
                .publish(tenant, namespace, topic, msg_id, payload, callback),
            WorkerCmd::FindTailSeqno {
                tenant,
                namespace,
                topic,
                callback,
            } => self.find_tail_seqno(tenant, namespace, topic, callback),
            WorkerCmd::SaveSnapshot {
                snapshot,
                worker_index,
                aggregator,
            } => {
                let status = self.append_snapshot(&snapshot, worker_index);
                aggregator.worker_done(status);
            }
        }
    }

    fn start_subscription(
        self: &Rc<Self>,
        handle: SubscriptionHandle,
        params: SubscriptionParameters,
        observer: SubscriptionObserver,
    ) {
        let shard = self
            .env
            .sharding
            .get_shard(&params.namespace_id, &params.topic_name);
        self.ensure_shard(shard);

        let sub_id = {
            let mut state = self.state.borrow_mut();
            let WorkerState {
                allocator, shards, ..
            } = &mut *state;
            let map = &shards.get(&shard).expect("shard just ensured").map;
            allocator.allocate(|id| map.contains(id))
        };
        let Some(sub_id) = sub_id else {
            tracing::error!(
                worker = self.index,
                "subscription id space exhausted; refusing subscription"
            );
            self.emit_status(
                handle,
                &params.tenant_id,
                &params.namespace_id,
                &params.topic_name,
                params.start_seqno,
                Status::internal_error("subscription id space exhausted"),
                &observer,
            );
            return;
        };
        let mut state = self.state.borrow_mut();
        state.by_handle.insert(handle, SubRef { shard, sub_id });
        state.topic_index.insert(
            (params.namespace_id.clone(), params.topic_name.clone()),
            handle,
        );
        let entry = ClientSub {
            data: SubscriptionData::new(
                params.tenant_id,
                params.namespace_id,
                params.topic_name,
                sub_id,
                params.start_seqno,
            ),
            handle,
            last_acked: 0,
            observer,
        };
        state
            .shards
            .get(&shard)
            .expect("shard just ensured")
            .map
            .subscribe(entry);
    }

    fn unsubscribe_topic(self: &Rc<Self>, namespace: NamespaceId, topic: Topic) {
        let mut state = self.state.borrow_mut();
        let Some(handle) = state.topic_index.remove(&(namespace.clone(), topic.clone())) else {
            // Missing is a warning, not an error.
            tracing::warn!(namespace, topic, "unsubscribe for unknown topic");
            return;
        };
        let Some(sub_ref) = state.by_handle.remove(&handle) else {
            return;
        };
        if let Some(shard) = state.shards.get(&sub_ref.shard) {
            shard.map.unsubscribe(sub_ref.sub_id);
        }
    }

    fn acknowledge(self: &Rc<Self>, handle: SubscriptionHandle, seqno: SequenceNumber) {
        let state = self.state.borrow();
        let Some(sub_ref) = state.by_handle.get(&handle) else {
            tracing::debug!(handle, "acknowledge for unknown subscription");
            return;
        };
        if let Some(shard) = state.shards.get(&sub_ref.shard) {
            shard.map.with_entry(sub_ref.sub_id, |entry| {
                if entry.last_acked < seqno {
                    entry.last_acked = seqno;
                }
            });
        }
    }

    fn append_snapshot(
        self: &Rc<Self>,
        snapshot: &SubscriptionSnapshot,
        worker_index: usize,
    ) -> Status {
        let state = self.state.borrow();
        let mut status = Status::ok();
        for shard in state.shards.values() {
            shard.map.for_each(|entry| {
                if !status.is_ok() {
                    return;
                }
                let start_seqno = if entry.last_acked == 0 {
                    0
                } else {
                    entry.last_acked + 1
                };
                let params = SubscriptionParameters {
                    tenant_id: entry.data.tenant(),
                    namespace_id: entry.data.namespace().to_string(),
                    topic_name: entry.data.topic().to_string(),
                    start_seqno,
                };
                if let Err(err) = snapshot.append(worker_index, params) {
                    status = Status::io_error(format!("snapshot append: {err}"));
                }
            });
        }
        status
    }

    fn find_tail_seqno(
        self: &Rc<Self>,
        tenant: TenantId,
        namespace: NamespaceId,
        topic: Topic,
        callback: TailCallback,
    ) {
        let shard = self.env.sharding.get_shard(&namespace, &topic);
        let Some(host) = self.env.sharding.get_host(shard) else {
            callback(Status::io_error("no host for shard"), 0);
            return;
        };
        let key = (namespace.clone(), topic.clone());
        {
            let mut state = self.state.borrow_mut();
            let waiters = state.pending_tails.entry(key.clone()).or_default();
            waiters.push(callback);
            if waiters.len() > 1 {
                // A lookup for this topic is already in flight.
                return;
            }
        }
        // Dedicated short-lived stream; the reply resolves every waiter.
        let core = Rc::downgrade(self);
        let ctx = self.ctx.clone();
        self.ctx.spawn(async move {
            let stream = match ctx.open_stream(&host).await {
                Ok(stream) => stream,
                Err(status) => {
                    if let Some(core) = core.upgrade() {
                        core.resolve_tails(&key, status, 0);
                    }
                    return;
                }
            };
            let receiver_core = core.clone();
            let receiver_key = key.clone();
            let receiver_stream = stream.clone();
            stream.set_receiver(Box::new(move |_flow, event| {
                let Some(core) = receiver_core.upgrade() else {
                    return;
                };
                match event {
                    StreamEvent::Message(Message::TailSeqno { seqno, .. }) => {
                        core.resolve_tails(&receiver_key, Status::ok(), seqno);
                        receiver_stream.close(true);
                    }
                    StreamEvent::Message(Message::Goodbye { .. }) => {
                        core.resolve_tails(
                            &receiver_key,
                            Status::io_error("connection lost during tail lookup"),
                            0,
                        );
                    }
                    _ => {}
                }
            }));
            stream.send(&Message::FindTailSeqno {
                tenant,
                namespace,
                topic,
            });
        });
    }

    fn resolve_tails(&self, key: &(NamespaceId, Topic), status: Status, seqno: SequenceNumber) {
        let waiters = self.state.borrow_mut().pending_tails.remove(key);
        for callback in waiters.into_iter().flatten() {
            callback(status.clone(), seqno);
        }
    }

    /// Create the shard's subscription map on first use and point it at the
    /// shard's current host.
    fn ensure_shard(self: &Rc<Self>, shard: ShardId) {
        if self.state.borrow().shards.contains_key(&shard) {
            return;
        }
        let core = Rc::downgrade(self);
        let deliver_core = core.clone();
        let terminate_core = core.clone();
        let goodbye_core = core.clone();
        let control_core = core.clone();
        let health_core = core.clone();
        let callbacks = MapCallbacks::new(
            move |_flow, entry: &mut ClientSub, message| {
                if let Some(core) = deliver_core.upgrade() {
                    core.on_deliver(entry, message);
                }
            },
            move |_flow, entry: ClientSub, reason| {
                if let Some(core) = terminate_core.upgrade() {
                    core.on_terminate(entry, reason);
                }
            },
        )
        .on_goodbye(move |_code| {
            if let Some(core) = goodbye_core.upgrade() {
                core.on_shard_goodbye(shard);
            }
        })
        .on_control(move |_flow, message| {
            if let Some(core) = control_core.upgrade() {
                core.on_control(message);
            }
        })
        .on_health(move |healthy| {
            if let Some(core) = health_core.upgrade() {
                core.on_shard_health(shard, healthy);
            }
        });
        let map = SubscriptionsMap::new(&self.ctx, callbacks);
        if let Some(host) = self.env.sharding.get_host(shard) {
            map.reconnect_to(host);
        } else {
            tracing::warn!(shard, "no host for shard; subscriptions stay pending");
        }
        let mut state = self.state.borrow_mut();
        state.router_version = state.router_version.max(self.env.sharding.version());
        state.shards.insert(shard, ShardSubs { map });
    }

    fn on_deliver(self: &Rc<Self>, entry: &mut ClientSub, message: Message) {
        match message {
            Message::DeliverData {
                seqno, payload, ..
            } => {
                let received = MessageReceived {
                    handle: entry.handle,
                    namespace: entry.data.namespace().to_string(),
                    topic: entry.data.topic().to_string(),
                    seqno,
                    contents: payload,
                };
                match &entry.observer.on_data {
                    Some(on_data) => on_data(received),
                    None => (self.env.observers.on_data)(received),
                }
            }
            Message::DeliverGap {
                prev_seqno,
                seqno,
                gap_type,
                ..
            } => {
                if gap_type != GapType::Benign {
                    (self.env.observers.on_data_loss)(DataLossInfo {
                        handle: entry.handle,
                        kind: gap_type,
                        first_seqno: prev_seqno + 1,
                        last_seqno: seqno,
                    });
                }
            }
            message => {
                tracing::debug!(kind = ?message.message_type(), "unexpected delivery kind");
            }
        }
    }

    fn on_terminate(self: &Rc<Self>, entry: ClientSub, reason: UnsubscribeReason) {
        {
            let mut state = self.state.borrow_mut();
            state.by_handle.remove(&entry.handle);
            let key = (
                entry.data.namespace().to_string(),
                entry.data.topic().to_string(),
            );
            if state.topic_index.get(&key) == Some(&entry.handle) {
                state.topic_index.remove(&key);
            }
        }
        let status = match reason {
            UnsubscribeReason::Requested => Status::ok(),
            UnsubscribeReason::BackOff => Status::io_error("server requested back-off"),
            UnsubscribeReason::Invalid => Status::invalid_argument("subscription rejected"),
        };
        self.emit_status(
            entry.handle,
            &entry.data.tenant(),
            entry.data.namespace(),
            entry.data.topic(),
            entry.data.expected_seqno(),
            status,
            &entry.observer,
        );
    }

    /// The shard's stream died. Re-resolve the host (the router may have
    /// moved the shard) and replay every subscription; duplicate deliveries
    /// across the gap are suppressed by the sequence-number check.
    fn on_shard_goodbye(self: &Rc<Self>, shard: ShardId) {
        let host = self.env.sharding.get_host(shard);
        let state = self.state.borrow();
        let Some(shard_subs) = state.shards.get(&shard) else {
            return;
        };
        match host {
            Some(host) => shard_subs.map.reconnect_to(host),
            None => {
                tracing::warn!(shard, "shard has no host after goodbye; waiting for router");
            }
        }
    }

    fn on_shard_health(self: &Rc<Self>, shard: ShardId, healthy: bool) {
        let mut events = Vec::new();
        {
            let state = self.state.borrow();
            let Some(shard_subs) = state.shards.get(&shard) else {
                return;
            };
            shard_subs.map.for_each(|entry| {
                events.push((
                    entry.handle,
                    entry.data.tenant(),
                    entry.data.namespace().to_string(),
                    entry.data.topic().to_string(),
                    entry.data.expected_seqno(),
                    entry.observer.clone(),
                ));
            });
        }
        let status = if healthy {
            Status::ok()
        } else {
            Status::io_error("stream unhealthy")
        };
        for (handle, tenant, namespace, topic, seqno, observer) in events {
            self.emit_status(
                handle,
                &tenant,
                &namespace,
                &topic,
                seqno,
                status.clone(),
                &observer,
            );
        }
    }

    fn on_control(self: &Rc<Self>, message: Message) {
        if let Message::TailSeqno {
            namespace,
            topic,
            seqno,
            ..
        } = message
        {
            self.resolve_tails(&(namespace, topic), Status::ok(), seqno);
        }
    }

    /// React to router version bumps: any shard whose host changed gets all
    /// of its subscriptions rewound to fresh ids and replayed at their
    /// current expected seqnos against the new host.
    fn poll_router(self: &Rc<Self>) {
        let version = self.env.sharding.version();
        {
            let state = self.state.borrow();
            if version == state.router_version {
                return;
            }
        }
        let shard_ids: Vec<ShardId> = self.state.borrow().shards.keys().copied().collect();
        for shard in shard_ids {
            let new_host = self.env.sharding.get_host(shard);
            let (current_host, ids) = {
                let state = self.state.borrow();
                let Some(shard_subs) = state.shards.get(&shard) else {
                    continue;
                };
                (shard_subs.map.last_host(), shard_subs.map.ids())
            };
            if new_host == current_host {
                continue;
            }
            tracing::info!(
                shard,
                old = ?current_host,
                new = ?new_host,
                "shard route changed; rewinding subscriptions"
            );
            for old_id in ids {
                self.rewind_subscription(shard, old_id);
            }
            let state = self.state.borrow();
            if let (Some(shard_subs), Some(host)) = (state.shards.get(&shard), new_host) {
                shard_subs.map.reconnect_to(host);
            }
        }
        self.state.borrow_mut().router_version = version;
    }

    fn rewind_subscription(self: &Rc<Self>, shard: ShardId, old_id: u64) {
        let fetched = {
            let state = self.state.borrow();
            state.shards.get(&shard).and_then(|shard_subs| {
                shard_subs
                    .map
                    .with_entry(old_id, |entry| (entry.handle, entry.data.expected_seqno()))
            })
        };
        let Some((handle, expected)) = fetched else {
            return;
        };
        let mut state = self.state.borrow_mut();
        let WorkerState {
            allocator,
            shards,
            by_handle,
            ..
        } = &mut *state;
        let Some(shard_subs) = shards.get(&shard) else {
            return;
        };
        let Some(new_id) = allocator.allocate(|id| shard_subs.map.contains(id)) else {
            tracing::error!(worker = self.index, "id space exhausted during rewind");
            return;
        };
        if shard_subs.map.rewind(old_id, new_id, expected) {
            by_handle.insert(
                handle,
                SubRef {
                    shard,
                    sub_id: new_id,
                },
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_status(
        &self,
        handle: SubscriptionHandle,
        tenant: &TenantId,
        namespace: &str,
        topic: &str,
        seqno: SequenceNumber,
        status: Status,
        observer: &SubscriptionObserver,
    ) {
        let event = SubscriptionStatusEvent {
            handle,
            tenant: *tenant,
            namespace: namespace.to_string(),
            topic: topic.to_string(),
            seqno,
            status,
        };
        match &observer.on_status {
            Some(on_status) => on_status(event),
            None => (self.env.observers.on_status)(event),
        }
    }
}
