// Bounded ring of recent deliveries on a multiplexed topic, used to serve
// late subscribers without disturbing the upstream subscription.
use std::collections::VecDeque;

use bytes::Bytes;
use petrel_common::{MsgId, SequenceNumber};

#[derive(Debug, Clone)]
pub struct CachedUpdate {
    pub seqno: SequenceNumber,
    pub msg_id: MsgId,
    pub payload: Bytes,
}

/// What a replay produced: an optional leading retention gap, then cached
/// records in sequence order.
#[derive(Debug)]
pub struct Replay {
    /// `Some((from, to))` when the requested position predates the cache.
    pub retention_gap: Option<(SequenceNumber, SequenceNumber)>,
    pub updates: Vec<CachedUpdate>,
}

/// Ring buffer of `(seqno, payload)` pairs with a byte budget.
///
/// `floor` is the oldest sequence number the accumulator can vouch for:
/// it starts at the upstream subscription's initial seqno and rises as
/// entries are evicted. A replay from below the floor gets a retention gap
/// first, which is exactly what a late subscriber must observe.
pub struct UpdatesAccumulator {
    entries: VecDeque<CachedUpdate>,
    bytes_used: usize,
    byte_budget: usize,
    floor: SequenceNumber,
}

impl UpdatesAccumulator {
    pub fn new(initial_seqno: SequenceNumber, byte_budget: usize) -> Self {
        UpdatesAccumulator {
            entries: VecDeque::new(),
            bytes_used: 0,
            byte_budget: byte_budget.max(1),
            floor: initial_seqno,
        }
    }

    /// Earliest sequence number still served from the cache.
    pub fn earliest_seqno(&self) -> SequenceNumber {
        self.entries.front().map(|e| e.seqno).unwrap_or(self.floor)
    }

    pub fn push(&mut self, seqno: SequenceNumber, msg_id: MsgId, payload: Bytes) {
        self.bytes_used += payload.len();
        self.entries.push_back(CachedUpdate {
            seqno,
            msg_id,
            payload,
        });
        while self.bytes_used > self.byte_budget && self.entries.len() > 1 {
            let evicted = self.entries.pop_front().expect("nonempty");
            self.bytes_used -= evicted.payload.len();
            self.floor = evicted.seqno + 1;
        }
    }

    /// Everything cached at or after `start`, with a retention gap when
    /// `start` predates the cache.
    pub fn replay_from(&self, start: SequenceNumber) -> Replay {
        let earliest = self.earliest_seqno();
        let retention_gap = if start < earliest {
            Some((start, earliest - 1))
        } else {
            None
        };
        let updates = self
            .entries
            .iter()
            .filter(|entry| entry.seqno >= start)
            .cloned()
            .collect();
        Replay {
            retention_gap,
            updates,
        }
    }
}
