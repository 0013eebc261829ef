// Per-loop counters. Loop-owned, lock-free; cross-loop aggregation goes
// through `MsgLoop::gather` with `snapshot`.
use std::cell::Cell;

#[derive(Default)]
pub struct LoopStats {
    pub commands: Cell<u64>,
    pub messages_received: Cell<u64>,
    pub messages_sent: Cell<u64>,
    pub sockets_opened: Cell<u64>,
    pub sockets_closed: Cell<u64>,
    pub streams_opened: Cell<u64>,
    pub streams_closed: Cell<u64>,
}

impl LoopStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            commands: self.commands.get(),
            messages_received: self.messages_received.get(),
            messages_sent: self.messages_sent.get(),
            sockets_opened: self.sockets_opened.get(),
            sockets_closed: self.sockets_closed.get(),
            streams_opened: self.streams_opened.get(),
            streams_closed: self.streams_closed.get(),
        }
    }

    pub(crate) fn bump(cell: &Cell<u64>) {
        cell.set(cell.get() + 1);
    }
}

/// Owned copy of a loop's counters; safe to move across threads.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub commands: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub sockets_opened: u64,
    pub sockets_closed: u64,
    pub streams_opened: u64,
    pub streams_closed: u64,
}

impl StatsSnapshot {
    /// Pointwise sum, for aggregating across workers.
    pub fn merge(mut self, other: StatsSnapshot) -> StatsSnapshot {
        self.commands += other.commands;
        self.messages_received += other.messages_received;
        self.messages_sent += other.messages_sent;
        self.sockets_opened += other.sockets_opened;
        self.sockets_closed += other.sockets_closed;
        self.streams_opened += other.streams_opened;
        self.streams_closed += other.streams_closed;
        self
    }
}
