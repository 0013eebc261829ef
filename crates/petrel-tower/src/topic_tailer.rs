// Per-room subscription tables and record fan-out. The tailer decides who
// gets what; the room owns the queues and the storage reader and executes
// the decisions.
use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use petrel_common::{is_reserved_namespace, MsgId, SequenceNumber, TenantId};
use petrel_storage::{GapKind, LogId};
use petrel_wire::{Delivery, GapType, Message};

use crate::cache::RecordCache;
use crate::Origin;

/// Outbound message bound for one downstream subscription.
pub(crate) type Reply = (Origin, Message);

/// What the room must do to the log reader after a table change.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReaderAction {
    None,
    /// Make sure the log is being read at or before this position.
    Ensure { log_id: LogId, seqno: SequenceNumber },
    /// Last subscriber left; the reader slot can go.
    Close { log_id: LogId },
}

struct Subscriber {
    origin: Origin,
    sub_id: u64,
    tenant: TenantId,
    /// Last seqno delivered (or `start - 1`).
    prev_seqno: SequenceNumber,
    /// Deliveries below this are duplicates and are not sent.
    expected_seqno: SequenceNumber,
}

struct TopicState {
    log_id: LogId,
    subscribers: Vec<Subscriber>,
}

#[derive(Default)]
struct LogState {
    topics: HashSet<(String, String)>,
}

pub(crate) struct TopicTailer {
    topics: HashMap<(String, String), TopicState>,
    logs: HashMap<LogId, LogState>,
    tail_estimates: HashMap<LogId, SequenceNumber>,
    cache: RecordCache,
    cache_reserved_bypass: bool,
}

impl TopicTailer {
    pub(crate) fn new(cache_bytes: usize, bloom_bits: usize, cache_reserved_bypass: bool) -> Self {
        TopicTailer {
            topics: HashMap::new(),
            logs: HashMap::new(),
            tail_estimates: HashMap::new(),
            cache: RecordCache::new(cache_bytes, bloom_bits),
            cache_reserved_bypass,
        }
    }

    /// Register a subscriber at `start`. Catch-up served from the cache
    /// comes back as one batch reply; the reader action tells the room how
    /// far back the log must be read for the rest.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn add_subscriber(
        &mut self,
        namespace: &str,
        topic: &str,
        log_id: LogId,
        origin: Origin,
        sub_id: u64,
        tenant: TenantId,
        start: SequenceNumber,
    ) -> (Vec<Reply>, ReaderAction) {
        let mut replies = Vec::new();
        let mut subscriber = Subscriber {
            origin,
            sub_id,
            tenant,
            // The first delivery carries the start position as its
            // "previous", so the gap it implies begins after the start.
            prev_seqno: start,
            expected_seqno: start,
        };

        if !(self.cache_reserved_bypass && is_reserved_namespace(namespace)) {
            let cached = self.cache.lookup(namespace, topic, start);
            if !cached.is_empty() {
                let mut deliveries = Vec::with_capacity(cached.len());
                for record in cached {
                    deliveries.push(Delivery {
                        sub_id,
                        prev_seqno: subscriber.prev_seqno,
                        seqno: record.seqno,
                        msg_id: record.msg_id,
                        payload: record.payload,
                    });
                    subscriber.prev_seqno = record.seqno;
                    subscriber.expected_seqno = record.seqno + 1;
                }
                replies.push((
                    origin,
                    Message::DeliverBatch {
                        tenant,
                        deliveries,
                    },
                ));
            }
        }

        let resume_at = subscriber.expected_seqno;
        self.topics
            .entry((namespace.to_string(), topic.to_string()))
            .or_insert_with(|| TopicState {
                log_id,
                subscribers: Vec::new(),
            })
            .subscribers
            .push(subscriber);
        self.logs
            .entry(log_id)
            .or_default()
            .topics
            .insert((namespace.to_string(), topic.to_string()));

        (
            replies,
            ReaderAction::Ensure {
                log_id,
                seqno: resume_at,
            },
        )
    }

    /// Drop one subscription; the table entry and reader go with it when
    /// they become unused.
    pub(crate) fn remove_subscriber(&mut self, origin: Origin, sub_id: u64) -> ReaderAction {
        let mut emptied: Option<LogId> = None;
        let logs = &mut self.logs;
        self.topics.retain(|key, state| {
            state
                .subscribers
                .retain(|s| !(s.origin == origin && s.sub_id == sub_id));
            if state.subscribers.is_empty() {
                if let Some(log) = logs.get_mut(&state.log_id) {
                    log.topics.remove(key);
                    if log.topics.is_empty() {
                        emptied = Some(state.log_id);
                    }
                }
                false
            } else {
                true
            }
        });
        match emptied {
            Some(log_id) => {
                self.logs.remove(&log_id);
                ReaderAction::Close { log_id }
            }
            None => ReaderAction::None,
        }
    }

    /// Drop everything a departed stream had subscribed.
    pub(crate) fn remove_origin(&mut self, origin: Origin) -> Vec<LogId> {
        let mut emptied = Vec::new();
        let logs = &mut self.logs;
        self.topics.retain(|key, state| {
            state.subscribers.retain(|s| s.origin != origin);
            if state.subscribers.is_empty() {
                if let Some(log) = logs.get_mut(&state.log_id) {
                    log.topics.remove(key);
                    if log.topics.is_empty() {
                        emptied.push(state.log_id);
                    }
                }
                false
            } else {
                true
            }
        });
        for log_id in &emptied {
            self.logs.remove(log_id);
        }
        emptied
    }

    /// A record arrived from the log reader: remember the tail, feed the
    /// cache, and fan out to every subscriber the seqno admits.
    pub(crate) fn on_record(
        &mut self,
        log_id: LogId,
        seqno: SequenceNumber,
        namespace: &str,
        topic: &str,
        msg_id: MsgId,
        payload: Bytes,
    ) -> Vec<Reply> {
        let estimate = self.tail_estimates.entry(log_id).or_insert(0);
        *estimate = (*estimate).max(seqno);

        if !(self.cache_reserved_bypass && is_reserved_namespace(namespace)) {
            self.cache
                .insert(namespace, topic, seqno, msg_id, payload.clone());
        }

        let Some(state) = self
            .topics
            .get_mut(&(namespace.to_string(), topic.to_string()))
        else {
            return Vec::new();
        };
        let mut replies = Vec::new();
        for subscriber in state.subscribers.iter_mut() {
            if subscriber.expected_seqno > seqno {
                continue;
            }
            replies.push((
                subscriber.origin,
                Message::DeliverData {
                    tenant: subscriber.tenant,
                    sub_id: subscriber.sub_id,
                    prev_seqno: subscriber.prev_seqno,
                    seqno,
                    msg_id,
                    payload: payload.clone(),
                },
            ));
            subscriber.prev_seqno = seqno;
            subscriber.expected_seqno = seqno + 1;
        }
        replies
    }

    /// A gap arrived: every subscriber on the log hears about the range it
    /// has not already passed.
    pub(crate) fn on_gap(
        &mut self,
        log_id: LogId,
        kind: GapKind,
        from: SequenceNumber,
        to: SequenceNumber,
    ) -> Vec<Reply> {
        let estimate = self.tail_estimates.entry(log_id).or_insert(0);
        *estimate = (*estimate).max(to);
        tracing::debug!(log_id, from, to, ?kind, "gap on log");

        let Some(log) = self.logs.get(&log_id) else {
            return Vec::new();
        };
        let gap_type = match kind {
            GapKind::Benign => GapType::Benign,
            GapKind::DataLoss => GapType::DataLoss,
            GapKind::Retention => GapType::Retention,
        };
        let mut replies = Vec::new();
        for key in log.topics.iter() {
            let Some(state) = self.topics.get_mut(key) else {
                continue;
            };
            for subscriber in state.subscribers.iter_mut() {
                if subscriber.expected_seqno > to {
                    continue;
                }
                replies.push((
                    subscriber.origin,
                    Message::DeliverGap {
                        tenant: subscriber.tenant,
                        sub_id: subscriber.sub_id,
                        prev_seqno: subscriber.prev_seqno,
                        seqno: to,
                        gap_type,
                    },
                ));
                subscriber.prev_seqno = to;
                subscriber.expected_seqno = to + 1;
            }
        }
        replies
    }

    pub(crate) fn tail_estimate(&self, log_id: LogId) -> Option<SequenceNumber> {
        self.tail_estimates.get(&log_id).copied()
    }

    pub(crate) fn set_tail_estimate(&mut self, log_id: LogId, seqno: SequenceNumber) {
        let estimate = self.tail_estimates.entry(log_id).or_insert(0);
        *estimate = (*estimate).max(seqno);
    }

    pub(crate) fn cache(&mut self) -> &mut RecordCache {
        &mut self.cache
    }

    /// Human-readable dump of one log's reader state, for the admin
    /// interface.
    pub(crate) fn describe_log(&self, log_id: LogId) -> String {
        let Some(log) = self.logs.get(&log_id) else {
            return format!("log {log_id}: no subscribers");
        };
        let mut lines = vec![format!(
            "log {log_id}: {} topics, tail estimate {}",
            log.topics.len(),
            self.tail_estimates.get(&log_id).copied().unwrap_or(0)
        )];
        for key in &log.topics {
            if let Some(state) = self.topics.get(key) {
                lines.push(format!(
                    "  {}/{}: {} subscribers",
                    key.0,
                    key.1,
                    state.subscribers.len()
                ));
            }
        }
        lines.join("\n")
    }

    pub(crate) fn log_ids(&self) -> Vec<LogId> {
        let mut ids: Vec<LogId> = self.logs.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin(key: u64) -> Origin {
        Origin { worker: 0, key }
    }

    fn tailer() -> TopicTailer {
        TopicTailer::new(1024 * 1024, 0, true)
    }

    #[test]
    fn fan_out_respects_start_positions() {
        let mut tailer = tailer();
        tailer.add_subscriber("guest", "t", 1, origin(1), 10, TenantId(200), 1);
        tailer.add_subscriber("guest", "t", 1, origin(2), 20, TenantId(200), 3);

        let replies = tailer.on_record(1, 2, "guest", "t", MsgId::empty(), Bytes::from_static(b"x"));
        assert_eq!(replies.len(), 1, "only the early subscriber gets seqno 2");
        let replies = tailer.on_record(1, 3, "guest", "t", MsgId::empty(), Bytes::from_static(b"y"));
        assert_eq!(replies.len(), 2);
    }

    #[test]
    fn per_subscriber_prev_tracks_delivery_history() {
        let mut tailer = tailer();
        tailer.add_subscriber("guest", "t", 1, origin(1), 10, TenantId(200), 5);

        let replies = tailer.on_record(1, 7, "guest", "t", MsgId::empty(), Bytes::from_static(b"a"));
        match &replies[0].1 {
            Message::DeliverData {
                prev_seqno, seqno, ..
            } => {
                assert_eq!((*prev_seqno, *seqno), (5, 7));
            }
            other => panic!("unexpected {other:?}"),
        }
        let replies = tailer.on_record(1, 9, "guest", "t", MsgId::empty(), Bytes::from_static(b"b"));
        match &replies[0].1 {
            Message::DeliverData {
                prev_seqno, seqno, ..
            } => {
                assert_eq!((*prev_seqno, *seqno), (7, 9));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn duplicate_records_are_not_redelivered() {
        let mut tailer = tailer();
        tailer.add_subscriber("guest", "t", 1, origin(1), 10, TenantId(200), 1);
        assert_eq!(
            tailer
                .on_record(1, 2, "guest", "t", MsgId::empty(), Bytes::from_static(b"x"))
                .len(),
            1
        );
        assert_eq!(
            tailer
                .on_record(1, 2, "guest", "t", MsgId::empty(), Bytes::from_static(b"x"))
                .len(),
            0,
            "redelivery of seqno 2 is suppressed"
        );
    }

    #[test]
    fn unsubscribe_cleans_tables_and_closes_idle_reader() {
        let mut tailer = tailer();
        let (_, action) =
            tailer.add_subscriber("guest", "t", 1, origin(1), 10, TenantId(200), 1);
        assert_eq!(action, ReaderAction::Ensure { log_id: 1, seqno: 1 });

        let action = tailer.remove_subscriber(origin(1), 10);
        assert_eq!(action, ReaderAction::Close { log_id: 1 });
        assert!(tailer.log_ids().is_empty());
        assert!(tailer
            .on_record(1, 2, "guest", "t", MsgId::empty(), Bytes::from_static(b"x"))
            .is_empty());
    }

    #[test]
    fn remove_origin_drops_every_subscription_of_that_stream() {
        let mut tailer = tailer();
        tailer.add_subscriber("guest", "a", 1, origin(1), 10, TenantId(200), 1);
        tailer.add_subscriber("guest", "b", 2, origin(1), 11, TenantId(200), 1);
        tailer.add_subscriber("guest", "b", 2, origin(2), 12, TenantId(200), 1);

        let emptied = tailer.remove_origin(origin(1));
        assert_eq!(emptied, vec![1], "log 2 still has a subscriber");
        assert_eq!(
            tailer
                .on_record(2, 1, "guest", "b", MsgId::empty(), Bytes::from_static(b"x"))
                .len(),
            1
        );
    }

    #[test]
    fn gaps_advance_every_subscriber_on_the_log() {
        let mut tailer = tailer();
        tailer.add_subscriber("guest", "a", 1, origin(1), 10, TenantId(200), 1);
        tailer.add_subscriber("guest", "b", 1, origin(2), 11, TenantId(200), 1);

        let replies = tailer.on_gap(1, GapKind::DataLoss, 1, 4);
        assert_eq!(replies.len(), 2);
        for (_, message) in &replies {
            match message {
                Message::DeliverGap {
                    seqno, gap_type, ..
                } => {
                    assert_eq!(*seqno, 4);
                    assert_eq!(*gap_type, GapType::DataLoss);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        // Deliveries resume after the gap.
        let replies = tailer.on_record(1, 5, "guest", "a", MsgId::empty(), Bytes::from_static(b"x"));
        match &replies[0].1 {
            Message::DeliverData { prev_seqno, .. } => assert_eq!(*prev_seqno, 4),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn cache_serves_catch_up_as_a_batch() {
        let mut tailer = tailer();
        tailer.add_subscriber("guest", "t", 1, origin(1), 10, TenantId(200), 1);
        for seqno in 1..=3 {
            tailer.on_record(1, seqno, "guest", "t", MsgId::empty(), Bytes::from_static(b"x"));
        }

        let (replies, action) =
            tailer.add_subscriber("guest", "t", 1, origin(2), 20, TenantId(200), 2);
        assert_eq!(replies.len(), 1);
        match &replies[0].1 {
            Message::DeliverBatch { deliveries, .. } => {
                let seqnos: Vec<u64> = deliveries.iter().map(|d| d.seqno).collect();
                assert_eq!(seqnos, vec![2, 3]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(action, ReaderAction::Ensure { log_id: 1, seqno: 4 });
    }

    #[test]
    fn tail_estimates_follow_records() {
        let mut tailer = tailer();
        tailer.add_subscriber("guest", "t", 1, origin(1), 10, TenantId(200), 1);
        assert_eq!(tailer.tail_estimate(1), None);
        tailer.on_record(1, 7, "guest", "t", MsgId::empty(), Bytes::from_static(b"x"));
        assert_eq!(tailer.tail_estimate(1), Some(7));
        tailer.set_tail_estimate(1, 3);
        assert_eq!(tailer.tail_estimate(1), Some(7), "estimates never regress");
    }
}
