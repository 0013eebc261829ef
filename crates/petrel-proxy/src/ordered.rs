// Per-session reorder buffer. Items arrive tagged with a monotonic session
// sequence number and leave strictly in order; anything further ahead than
// the window implies a hole that can never fill, which fails the session.
use std::collections::BTreeMap;

pub type SessionSeqno = u64;

#[derive(Debug, PartialEq, Eq)]
pub enum OrderedError {
    /// The sequence skipped past the reorder window; the session is broken
    /// and must be failed with a forced goodbye.
    SequenceGap {
        expected: SessionSeqno,
        received: SessionSeqno,
    },
    /// Already processed or buffered; caller drops the duplicate.
    Duplicate(SessionSeqno),
}

/// Reorders items by session sequence number within a fixed window.
pub struct OrderedProcessor<T> {
    next: SessionSeqno,
    window: u64,
    buffered: BTreeMap<SessionSeqno, T>,
}

impl<T> OrderedProcessor<T> {
    pub fn new(window: usize) -> Self {
        OrderedProcessor {
            next: 0,
            window: window.max(1) as u64,
            buffered: BTreeMap::new(),
        }
    }

    /// Accept one tagged item. Returns every item that became deliverable,
    /// in order; usually empty (buffered) or exactly one.
    pub fn push(&mut self, seqno: SessionSeqno, item: T) -> Result<Vec<T>, OrderedError> {
        if seqno < self.next || self.buffered.contains_key(&seqno) {
            return Err(OrderedError::Duplicate(seqno));
        }
        if seqno >= self.next + self.window {
            return Err(OrderedError::SequenceGap {
                expected: self.next,
                received: seqno,
            });
        }
        self.buffered.insert(seqno, item);
        let mut released = Vec::new();
        while let Some(item) = self.buffered.remove(&self.next) {
            released.push(item);
            self.next += 1;
        }
        Ok(released)
    }

    pub fn next_expected(&self) -> SessionSeqno {
        self.next
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }
}
