// Per-stream book of subscriptions that replicates itself to the remote end
// over a stream sink and dispatches messages delivered on it.
//
// Three containers drive the sync protocol: `pending` holds subscriptions
// not yet on the wire, `synced` holds those the remote end knows about, and
// `pending_unsubscribes` holds ids to terminate. A dedicated drain task
// moves pending entries onto the sink; reconnecting promotes every synced
// subscription back to pending so the whole book replays.
//
// Not thread-safe; lives on one loop. The proxy reuses it with its own entry
// type for upstream aggregation.
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Duration;

use petrel_common::{HostId, NamespaceId, SequenceNumber, TenantId, Topic};
use petrel_io::{Flow, LoopCtx, Stream, StreamEvent};
use petrel_wire::{GoodbyeCode, Message, UnsubscribeReason};
use rand::Rng;
use tokio::sync::Notify;

/// State every subscription entry must carry.
#[derive(Debug, Clone)]
pub struct SubscriptionData {
    tenant: TenantId,
    namespace: NamespaceId,
    topic: Topic,
    /// Id the remote end knows this subscription by. Changes on rewind;
    /// never rely on it outside logging while the entry sits in a map.
    sub_id: u64,
    /// Next expected sequence number.
    expected_seqno: SequenceNumber,
}

impl SubscriptionData {
    pub fn new(
        tenant: TenantId,
        namespace: NamespaceId,
        topic: Topic,
        sub_id: u64,
        initial_seqno: SequenceNumber,
    ) -> Self {
        SubscriptionData {
            tenant,
            namespace,
            topic,
            sub_id,
            expected_seqno: initial_seqno,
        }
    }

    pub fn tenant(&self) -> TenantId {
        self.tenant
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn sub_id(&self) -> u64 {
        self.sub_id
    }

    pub fn expected_seqno(&self) -> SequenceNumber {
        self.expected_seqno
    }

    /// Record the state transition carried by a delivery. Returns false when
    /// the update is a duplicate (`current` below what we already expect)
    /// and must not be surfaced.
    pub fn process_update(&mut self, previous: SequenceNumber, current: SequenceNumber) -> bool {
        if current < self.expected_seqno {
            return false;
        }
        let _ = previous;
        self.expected_seqno = current + 1;
        true
    }

    fn rewind(&mut self, sub_id: u64, expected_seqno: SequenceNumber) {
        debug_assert_ne!(self.sub_id, sub_id);
        self.sub_id = sub_id;
        self.expected_seqno = expected_seqno;
    }
}

/// Implemented by the state types stored in a `SubscriptionsMap`.
pub trait SubscriptionEntry: 'static {
    fn data(&self) -> &SubscriptionData;
    fn data_mut(&mut self) -> &mut SubscriptionData;
}

/// How the owner observes map activity. `deliver` and `terminate` carry the
/// affected entry; the rest are stream-level signals.
pub struct MapCallbacks<S> {
    deliver: Box<dyn Fn(&mut Flow, &mut S, Message)>,
    terminate: Box<dyn Fn(&mut Flow, S, UnsubscribeReason)>,
    goodbye: Box<dyn Fn(GoodbyeCode)>,
    control: Box<dyn Fn(&mut Flow, Message)>,
    health: Box<dyn Fn(bool)>,
}

impl<S> MapCallbacks<S> {
    pub fn new(
        deliver: impl Fn(&mut Flow, &mut S, Message) + 'static,
        terminate: impl Fn(&mut Flow, S, UnsubscribeReason) + 'static,
    ) -> Self {
        MapCallbacks {
            deliver: Box::new(deliver),
            terminate: Box::new(terminate),
            goodbye: Box::new(|_| {}),
            control: Box::new(|_, message| {
                tracing::debug!(kind = ?message.message_type(), "unhandled control message");
            }),
            health: Box::new(|_| {}),
        }
    }

    pub fn on_goodbye(mut self, callback: impl Fn(GoodbyeCode) + 'static) -> Self {
        self.goodbye = Box::new(callback);
        self
    }

    pub fn on_control(mut self, callback: impl Fn(&mut Flow, Message) + 'static) -> Self {
        self.control = Box::new(callback);
        self
    }

    pub fn on_health(mut self, callback: impl Fn(bool) + 'static) -> Self {
        self.health = Box::new(callback);
        self
    }
}

struct MapState<S> {
    pending: HashMap<u64, S>,
    synced: HashMap<u64, S>,
    pending_unsubscribes: HashMap<u64, TenantId>,
    last_host: Option<HostId>,
    sink: Option<Stream>,
    /// Bumped on every reconnect so receivers of stale streams go inert.
    epoch: u64,
    /// Id currently pulled out of `synced` for a delivery callback.
    delivering: Option<u64>,
    closed: bool,
}

struct MapShared<S> {
    ctx: LoopCtx,
    state: RefCell<MapState<S>>,
    callbacks: MapCallbacks<S>,
    dirty: Notify,
}

pub struct SubscriptionsMap<S: SubscriptionEntry> {
    shared: Rc<MapShared<S>>,
}

impl<S: SubscriptionEntry> SubscriptionsMap<S> {
    pub fn new(ctx: &LoopCtx, callbacks: MapCallbacks<S>) -> Self {
        let shared = Rc::new(MapShared {
            ctx: ctx.clone(),
            state: RefCell::new(MapState {
                pending: HashMap::new(),
                synced: HashMap::new(),
                pending_unsubscribes: HashMap::new(),
                last_host: None,
                sink: None,
                epoch: 0,
                delivering: None,
                closed: false,
            }),
            callbacks,
            dirty: Notify::new(),
        });
        let drain_shared = Rc::clone(&shared);
        ctx.spawn(async move {
            drain_task(drain_shared).await;
        });
        SubscriptionsMap { shared }
    }

    /// Add a subscription; it is written to the wire by the drain task. The
    /// caller guarantees the entry's sub id is not in use.
    pub fn subscribe(&self, entry: S) {
        let sub_id = entry.data().sub_id();
        debug_assert!(!self.contains(sub_id), "sub id {sub_id} already mapped");
        self.shared.state.borrow_mut().pending.insert(sub_id, entry);
        self.shared.dirty.notify_one();
    }

    pub fn contains(&self, sub_id: u64) -> bool {
        let state = self.shared.state.borrow();
        state.pending.contains_key(&sub_id)
            || state.synced.contains_key(&sub_id)
            || state.pending_unsubscribes.contains_key(&sub_id)
            || state.delivering == Some(sub_id)
    }

    /// Look at a live entry. Returns `None` for unknown ids.
    pub fn with_entry<R>(&self, sub_id: u64, f: impl FnOnce(&mut S) -> R) -> Option<R> {
        let mut state = self.shared.state.borrow_mut();
        if let Some(entry) = state.synced.get_mut(&sub_id) {
            return Some(f(entry));
        }
        let entry = state.pending.get_mut(&sub_id)?;
        Some(f(entry))
    }

    pub fn for_each(&self, mut f: impl FnMut(&S)) {
        let state = self.shared.state.borrow();
        for entry in state.synced.values().chain(state.pending.values()) {
            f(entry);
        }
    }

    pub fn ids(&self) -> Vec<u64> {
        let state = self.shared.state.borrow();
        state
            .synced
            .keys()
            .chain(state.pending.keys())
            .copied()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        let state = self.shared.state.borrow();
        state.synced.is_empty() && state.pending.is_empty()
    }

    /// Terminate a subscription. Returns false if the id was unknown. An
    /// entry that never reached the wire is dropped silently; a synced one
    /// gets an unsubscribe queued.
    pub fn unsubscribe(&self, sub_id: u64) -> bool {
        let mut state = self.shared.state.borrow_mut();
        if state.pending.remove(&sub_id).is_some() {
            return true;
        }
        let tenant = if let Some(entry) = state.synced.remove(&sub_id) {
            entry.data().tenant()
        } else if state.delivering == Some(sub_id) {
            // Unsubscribed from inside its own delivery callback; the entry
            // is parked outside the map and must not come back.
            TenantId::GUEST
        } else {
            return false;
        };
        state.pending_unsubscribes.insert(sub_id, tenant);
        drop(state);
        self.shared.dirty.notify_one();
        true
    }

    /// Move a subscription back to pending under a fresh id and sequence
    /// number. This is how route changes re-issue subscriptions; no stream
    /// state retains the old id afterwards.
    pub fn rewind(&self, old_sub_id: u64, new_sub_id: u64, new_seqno: SequenceNumber) -> bool {
        let mut state = self.shared.state.borrow_mut();
        let (mut entry, was_synced) = match state.synced.remove(&old_sub_id) {
            Some(entry) => (entry, true),
            None => match state.pending.remove(&old_sub_id) {
                Some(entry) => (entry, false),
                None => return false,
            },
        };
        if was_synced {
            let tenant = entry.data().tenant();
            state.pending_unsubscribes.insert(old_sub_id, tenant);
        }
        entry.data_mut().rewind(new_sub_id, new_seqno);
        state.pending.insert(new_sub_id, entry);
        drop(state);
        self.shared.dirty.notify_one();
        true
    }

    /// Force the map to re-establish communication to `host`. Every synced
    /// subscription is promoted back to pending and replayed.
    pub fn reconnect_to(&self, host: HostId) {
        {
            let mut state = self.shared.state.borrow_mut();
            state.last_host = Some(host);
            state.epoch += 1;
            if let Some(sink) = state.sink.take() {
                sink.close(false);
            }
            promote_synced(&mut state);
        }
        self.shared.dirty.notify_one();
    }

    pub fn last_host(&self) -> Option<HostId> {
        self.shared.state.borrow().last_host.clone()
    }

    /// Write a non-subscription message on the current sink, if any.
    pub fn send_control(&self, message: Message) -> bool {
        let sink = self.shared.state.borrow().sink.clone();
        match sink {
            Some(sink) => {
                sink.send(&message);
                true
            }
            None => false,
        }
    }

    pub fn close(&self) {
        {
            let mut state = self.shared.state.borrow_mut();
            if state.closed {
                return;
            }
            state.closed = true;
            if let Some(sink) = state.sink.take() {
                sink.close(true);
            }
        }
        self.shared.dirty.notify_one();
    }
}

impl<S: SubscriptionEntry> Drop for SubscriptionsMap<S> {
    fn drop(&mut self) {
        self.close();
    }
}

fn promote_synced<S>(state: &mut MapState<S>) {
    let synced: Vec<(u64, S)> = state.synced.drain().collect();
    for (sub_id, entry) in synced {
        state.pending.insert(sub_id, entry);
    }
}

async fn drain_task<S: SubscriptionEntry>(shared: Rc<MapShared<S>>) {
    loop {
        let notified = shared.dirty.notified();
        if shared.state.borrow().closed {
            return;
        }
        if sync_to_wire(&shared).await {
            return;
        }
        notified.await;
    }
}

/// Push queued work onto the sink, reconnecting as needed. Returns true
/// when the map is closed.
async fn sync_to_wire<S: SubscriptionEntry>(shared: &Rc<MapShared<S>>) -> bool {
    loop {
        let (has_work, has_sink, host) = {
            let state = shared.state.borrow();
            if state.closed {
                return true;
            }
            (
                !state.pending.is_empty() || !state.pending_unsubscribes.is_empty(),
                state.sink.is_some(),
                state.last_host.clone(),
            )
        };
        if !has_work {
            return false;
        }
        if !has_sink {
            let Some(host) = host else {
                // No route yet; stay pending until reconnect_to is called.
                return false;
            };
            match shared.ctx.open_stream(&host).await {
                Ok(stream) => {
                    let epoch = {
                        let mut state = shared.state.borrow_mut();
                        if state.closed {
                            stream.close(false);
                            return true;
                        }
                        state.epoch += 1;
                        state.sink = Some(stream.clone());
                        state.epoch
                    };
                    install_receiver(shared, &stream, epoch);
                }
                Err(status) => {
                    tracing::warn!(host = %host, error = %status, "subscription stream connect failed");
                    let backoff = rand::thread_rng().gen_range(50..250);
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    continue;
                }
            }
        }
        let mut flow = Flow::new();
        drain_some(shared, &mut flow);
        flow.wait_ready().await;
    }
}

/// Write queued unsubscribes and pending subscriptions until the sink
/// reports no room.
fn drain_some<S: SubscriptionEntry>(shared: &Rc<MapShared<S>>, flow: &mut Flow) {
    let mut state = shared.state.borrow_mut();
    let Some(sink) = state.sink.clone() else {
        return;
    };
    while !flow.is_blocked() {
        let Some((&sub_id, &tenant)) = state.pending_unsubscribes.iter().next() else {
            break;
        };
        state.pending_unsubscribes.remove(&sub_id);
        flow.write(
            &sink,
            Message::Unsubscribe {
                tenant,
                sub_id,
                reason: UnsubscribeReason::Requested,
            },
        );
    }
    while !flow.is_blocked() {
        let Some(&sub_id) = state.pending.keys().next() else {
            break;
        };
        let entry = state.pending.remove(&sub_id).expect("pending entry");
        {
            let data = entry.data();
            flow.write(
                &sink,
                Message::Subscribe {
                    tenant: data.tenant(),
                    namespace: data.namespace().to_string(),
                    topic: data.topic().to_string(),
                    start_seqno: data.expected_seqno(),
                    sub_id,
                },
            );
        }
        state.synced.insert(sub_id, entry);
    }
}

fn install_receiver<S: SubscriptionEntry>(shared: &Rc<MapShared<S>>, stream: &Stream, epoch: u64) {
    let weak: Weak<MapShared<S>> = Rc::downgrade(shared);
    stream.set_receiver(Box::new(move |flow, event| {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        {
            let state = shared.state.borrow();
            if state.closed || state.epoch != epoch {
                return;
            }
        }
        dispatch(&shared, flow, event);
    }));
}

fn dispatch<S: SubscriptionEntry>(shared: &Rc<MapShared<S>>, flow: &mut Flow, event: StreamEvent) {
    match event {
        StreamEvent::Message(message @ Message::DeliverData { .. })
        | StreamEvent::Message(message @ Message::DeliverGap { .. }) => {
            handle_deliver(shared, flow, message);
        }
        StreamEvent::Message(Message::DeliverBatch { tenant, deliveries }) => {
            for delivery in deliveries {
                handle_deliver(
                    shared,
                    flow,
                    Message::DeliverData {
                        tenant,
                        sub_id: delivery.sub_id,
                        prev_seqno: delivery.prev_seqno,
                        seqno: delivery.seqno,
                        msg_id: delivery.msg_id,
                        payload: delivery.payload,
                    },
                );
            }
        }
        StreamEvent::Message(Message::Unsubscribe { sub_id, reason, .. }) => {
            let entry = {
                let mut state = shared.state.borrow_mut();
                state
                    .synced
                    .remove(&sub_id)
                    .or_else(|| state.pending.remove(&sub_id))
            };
            match entry {
                Some(entry) => (shared.callbacks.terminate)(flow, entry, reason),
                // Idempotent denial of an id we no longer know.
                None => tracing::debug!(sub_id, "unsubscribe for unknown subscription"),
            }
        }
        StreamEvent::Message(Message::Goodbye { code, .. }) => {
            {
                let mut state = shared.state.borrow_mut();
                state.sink = None;
                state.epoch += 1;
                promote_synced(&mut state);
            }
            (shared.callbacks.goodbye)(code);
            shared.dirty.notify_one();
        }
        StreamEvent::Message(message) => {
            (shared.callbacks.control)(flow, message);
        }
        StreamEvent::Health(healthy) => {
            (shared.callbacks.health)(healthy);
        }
    }
}

fn handle_deliver<S: SubscriptionEntry>(shared: &Rc<MapShared<S>>, flow: &mut Flow, message: Message) {
    let (sub_id, prev_seqno, seqno) = match &message {
        Message::DeliverData {
            sub_id,
            prev_seqno,
            seqno,
            ..
        }
        | Message::DeliverGap {
            sub_id,
            prev_seqno,
            seqno,
            ..
        } => (*sub_id, *prev_seqno, *seqno),
        _ => return,
    };
    let entry = {
        let mut state = shared.state.borrow_mut();
        match state.synced.remove(&sub_id) {
            Some(entry) => {
                state.delivering = Some(sub_id);
                Some(entry)
            }
            None => None,
        }
    };
    let Some(mut entry) = entry else {
        // Every message must belong to a known subscription; deny unknown
        // ids politely instead of crashing or going silent.
        let sink = shared.state.borrow().sink.clone();
        if let Some(sink) = sink {
            flow.write(
                &sink,
                Message::Unsubscribe {
                    tenant: message.tenant(),
                    sub_id,
                    reason: UnsubscribeReason::Requested,
                },
            );
        }
        return;
    };
    if entry.data_mut().process_update(prev_seqno, seqno) {
        (shared.callbacks.deliver)(flow, &mut entry, message);
    } else {
        tracing::debug!(
            sub_id,
            seqno,
            expected = entry.data().expected_seqno(),
            "dropped duplicate delivery"
        );
    }
    let mut state = shared.state.borrow_mut();
    state.delivering = None;
    if !state.pending_unsubscribes.contains_key(&sub_id)
        && !state.synced.contains_key(&sub_id)
        && !state.pending.contains_key(&sub_id)
        && !state.closed
    {
        state.synced.insert(sub_id, entry);
    }
}
