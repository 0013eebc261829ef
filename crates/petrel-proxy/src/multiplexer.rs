// Subscription-level aggregation: overlapping downstream subscriptions to
// one topic collapse into a single upstream subscription. Late joiners are
// served out of the updates accumulator; everyone else rides the live feed.
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use petrel_client::{MapCallbacks, SubscriptionData, SubscriptionEntry, SubscriptionsMap};
use petrel_common::{HostId, NamespaceId, SequenceNumber, TenantId, Topic};
use petrel_io::{Flow, LoopCtx, Stream};
use petrel_wire::{GapType, Message, UnsubscribeReason};

use crate::accumulator::UpdatesAccumulator;

/// One downstream subscription attached to an upstream aggregate, named
/// broker-style by `(stream id, sub id)`.
struct Downstream {
    stream: Stream,
    sub_id: u64,
    tenant: TenantId,
    /// Last seqno this downstream saw (or `start - 1` before the first).
    prev_seqno: SequenceNumber,
    /// Deliveries below this are filtered out for this downstream.
    expected_seqno: SequenceNumber,
}

/// Aggregated upstream subscription: the shared wire subscription plus the
/// set of downstream subscriptions it fans out to.
pub(crate) struct UpstreamSubscription {
    data: SubscriptionData,
    accumulator: UpdatesAccumulator,
    downstreams: Vec<Downstream>,
}

impl SubscriptionEntry for UpstreamSubscription {
    fn data(&self) -> &SubscriptionData {
        &self.data
    }
    fn data_mut(&mut self) -> &mut SubscriptionData {
        &mut self.data
    }
}

struct MuxState {
    topic_index: HashMap<(NamespaceId, Topic), u64>,
    next_upstream_id: u64,
}

pub(crate) struct Multiplexer {
    map: SubscriptionsMap<UpstreamSubscription>,
    state: Rc<RefCell<MuxState>>,
    accumulator_budget: usize,
}

impl Multiplexer {
    pub(crate) fn new(ctx: &LoopCtx, host: Option<HostId>, accumulator_budget: usize) -> Self {
        let state = Rc::new(RefCell::new(MuxState {
            topic_index: HashMap::new(),
            next_upstream_id: 1,
        }));
        let terminate_state = Rc::clone(&state);
        let callbacks = MapCallbacks::new(
            |flow, entry: &mut UpstreamSubscription, message| {
                fan_out(flow, entry, message);
            },
            move |flow, entry: UpstreamSubscription, reason| {
                terminate_state.borrow_mut().topic_index.remove(&(
                    entry.data().namespace().to_string(),
                    entry.data().topic().to_string(),
                ));
                for downstream in &entry.downstreams {
                    flow.write(
                        &downstream.stream,
                        Message::Unsubscribe {
                            tenant: downstream.tenant,
                            sub_id: downstream.sub_id,
                            reason,
                        },
                    );
                }
            },
        );
        let map = SubscriptionsMap::new(ctx, callbacks);
        if let Some(host) = host {
            map.reconnect_to(host);
        }
        Multiplexer {
            map,
            state,
            accumulator_budget,
        }
    }

    /// Attach a downstream subscription, creating the upstream aggregate if
    /// this topic has none. Returns the upstream sub id for later
    /// unsubscribes.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn subscribe(
        &self,
        flow: &mut Flow,
        tenant: TenantId,
        namespace: &str,
        topic: &str,
        initial_seqno: SequenceNumber,
        downstream_stream: Stream,
        downstream_sub_id: u64,
    ) -> u64 {
        let key = (namespace.to_string(), topic.to_string());
        let existing = self.state.borrow().topic_index.get(&key).copied();
        if let Some(upstream_id) = existing {
            let attached = self.map.with_entry(upstream_id, |entry| {
                attach_downstream(
                    flow,
                    entry,
                    tenant,
                    initial_seqno,
                    downstream_stream.clone(),
                    downstream_sub_id,
                );
            });
            if attached.is_some() {
                return upstream_id;
            }
            // Index pointed at a dying entry; fall through and recreate.
            self.state.borrow_mut().topic_index.remove(&key);
        }

        let upstream_id = {
            let mut state = self.state.borrow_mut();
            let mut candidate = state.next_upstream_id;
            while self.map.contains(candidate) {
                candidate = candidate.wrapping_add(1).max(1);
            }
            state.next_upstream_id = candidate.wrapping_add(1).max(1);
            state.topic_index.insert(key, candidate);
            candidate
        };
        let entry = UpstreamSubscription {
            data: SubscriptionData::new(
                tenant,
                namespace.to_string(),
                topic.to_string(),
                upstream_id,
                initial_seqno,
            ),
            accumulator: UpdatesAccumulator::new(initial_seqno, self.accumulator_budget),
            downstreams: vec![Downstream {
                stream: downstream_stream,
                sub_id: downstream_sub_id,
                tenant,
                prev_seqno: initial_seqno,
                expected_seqno: initial_seqno,
            }],
        };
        self.map.subscribe(entry);
        upstream_id
    }

    /// Detach a downstream subscription; the last one out unsubscribes the
    /// upstream aggregate.
    pub(crate) fn unsubscribe(&self, upstream_id: u64, downstream_stream_id: u64, sub_id: u64) {
        let now_empty = self.map.with_entry(upstream_id, |entry| {
            entry
                .downstreams
                .retain(|d| !(d.stream.id() == downstream_stream_id && d.sub_id == sub_id));
            entry.downstreams.is_empty()
        });
        if now_empty == Some(true) {
            self.drop_upstream(upstream_id);
        }
    }

    /// Remove every downstream belonging to one session, collapsing any
    /// upstream aggregates it was the last subscriber of.
    pub(crate) fn remove_session(&self, downstream_stream_id: u64) {
        for upstream_id in self.map.ids() {
            let now_empty = self.map.with_entry(upstream_id, |entry| {
                entry
                    .downstreams
                    .retain(|d| d.stream.id() != downstream_stream_id);
                entry.downstreams.is_empty()
            });
            if now_empty == Some(true) {
                self.drop_upstream(upstream_id);
            }
        }
    }

    /// The shard moved: replay every upstream subscription against the new
    /// host. Downstream attachments survive; the seqno filters suppress any
    /// duplicate deliveries across the switch.
    pub(crate) fn change_route(&self, host: HostId) {
        self.map.reconnect_to(host);
    }

    pub(crate) fn close(&self) {
        self.map.close();
    }

    fn drop_upstream(&self, upstream_id: u64) {
        let key = self.map.with_entry(upstream_id, |entry| {
            (
                entry.data().namespace().to_string(),
                entry.data().topic().to_string(),
            )
        });
        self.map.unsubscribe(upstream_id);
        if let Some(key) = key {
            self.state.borrow_mut().topic_index.remove(&key);
        }
    }
}

/// Serve a late subscriber from the accumulator, then attach it for live
/// deliveries. A requested position older than the cache gets a retention
/// gap before any data.
fn attach_downstream(
    flow: &mut Flow,
    entry: &mut UpstreamSubscription,
    tenant: TenantId,
    initial_seqno: SequenceNumber,
    stream: Stream,
    sub_id: u64,
) {
    let replay = entry.accumulator.replay_from(initial_seqno);
    let mut prev = initial_seqno;
    let mut expected = initial_seqno;
    if let Some((from, to)) = replay.retention_gap {
        flow.write(
            &stream,
            Message::DeliverGap {
                tenant,
                sub_id,
                prev_seqno: from,
                seqno: to,
                gap_type: GapType::Retention,
            },
        );
        prev = to;
        expected = to + 1;
    }
    for update in &replay.updates {
        flow.write(
            &stream,
            Message::DeliverData {
                tenant,
                sub_id,
                prev_seqno: prev,
                seqno: update.seqno,
                msg_id: update.msg_id,
                payload: update.payload.clone(),
            },
        );
        prev = update.seqno;
        expected = update.seqno + 1;
    }
    entry.downstreams.push(Downstream {
        stream,
        sub_id,
        tenant,
        prev_seqno: prev,
        expected_seqno: expected,
    });
}

/// Feed the accumulator and forward a live delivery to every downstream
/// whose position admits it.
fn fan_out(flow: &mut Flow, entry: &mut UpstreamSubscription, message: Message) {
    match message {
        Message::DeliverData {
            seqno,
            msg_id,
            payload,
            ..
        } => {
            entry.accumulator.push(seqno, msg_id, payload.clone());
            for downstream in entry.downstreams.iter_mut() {
                if downstream.expected_seqno > seqno {
                    continue;
                }
                flow.write(
                    &downstream.stream,
                    Message::DeliverData {
                        tenant: downstream.tenant,
                        sub_id: downstream.sub_id,
                        prev_seqno: downstream.prev_seqno,
                        seqno,
                        msg_id,
                        payload: payload.clone(),
                    },
                );
                downstream.prev_seqno = seqno;
                downstream.expected_seqno = seqno + 1;
            }
        }
        Message::DeliverGap {
            seqno, gap_type, ..
        } => {
            for downstream in entry.downstreams.iter_mut() {
                if downstream.expected_seqno > seqno {
                    continue;
                }
                flow.write(
                    &downstream.stream,
                    Message::DeliverGap {
                        tenant: downstream.tenant,
                        sub_id: downstream.sub_id,
                        prev_seqno: downstream.prev_seqno,
                        seqno,
                        gap_type,
                    },
                );
                downstream.prev_seqno = seqno;
                downstream.expected_seqno = seqno + 1;
            }
        }
        message => {
            tracing::debug!(kind = ?message.message_type(), "unexpected upstream delivery");
        }
    }
}
