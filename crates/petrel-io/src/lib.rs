// Reactor layer: single-threaded event loops, framed streams multiplexed
// over TCP sockets, credit-based flow control, and the worker pool that
// shards work by topic.
//
// Threading model: every `EventLoop` is one OS thread running a
// current-thread tokio runtime. State owned by a loop never leaves its
// thread; other threads talk to a loop only through `submit`, which pushes
// onto a bounded queue and fails with `QueueFull` rather than blocking or
// dropping.
use std::time::Duration;

mod event_loop;
mod flow;
mod msg_loop;
mod socket;
mod stats;
mod stream;

pub use event_loop::{EventLoop, LoopCtx, TimerHandle};
pub use flow::{register_source, EventTrigger, Flow, Sink, SourcelessFlow};
pub use msg_loop::MsgLoop;
pub use socket::CloseReason;
pub use stats::{LoopStats, StatsSnapshot};
pub use stream::{Stream, StreamEvent, StreamReceiver};

/// Tuning knobs for a loop and the sockets it owns.
#[derive(Debug, Clone)]
pub struct IoConfig {
    /// Capacity of the cross-thread command queue.
    pub command_queue_size: usize,
    /// How often an inbound socket sends its aggregated heartbeat.
    pub heartbeat_period: Duration,
    /// How long an outbound stream may go unseen before it is flagged
    /// unhealthy. The timeout list is scanned at a tenth of this.
    pub heartbeat_timeout: Duration,
    /// Send-queue size at which a socket stops reporting room. The write
    /// trigger is raised again once the queue drains to half of this.
    pub send_queue_limit_bytes: usize,
    /// How long to keep an outbound socket alive after its last stream is
    /// gone. Zero closes immediately.
    pub connection_without_streams_keepalive: Duration,
}

impl Default for IoConfig {
    fn default() -> Self {
        IoConfig {
            command_queue_size: 1024,
            heartbeat_period: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(10),
            send_queue_limit_bytes: 4 * 1024 * 1024,
            connection_without_streams_keepalive: Duration::ZERO,
        }
    }
}

/// Reads drain at most this much per socket wakeup so one busy connection
/// cannot starve the rest of the loop.
pub(crate) const READ_BUDGET_BYTES: usize = 1024 * 1024;

/// Upper bound on buffers handed to one vectored write.
pub(crate) const MAX_IOVECS: usize = 64;
