// Shard-aware proxy between many downstream clients and the broker fleet.
//
// Cold topics are proxied at stream level (bytes through, ids remapped by
// the session's upstream stream); hot topics are collapsed by the
// multiplexer into one upstream subscription per topic, with a bounded
// cache replaying recent updates to late subscribers.
use std::sync::Arc;
use std::time::Duration;

use petrel_common::{HostId, Status};
use petrel_io::{IoConfig, MsgLoop};
use petrel_router::ShardingStrategy;

mod accumulator;
mod multiplexer;
mod ordered;
mod per_shard;
mod per_stream;
mod server;

pub use accumulator::{CachedUpdate, Replay, UpdatesAccumulator};
pub use ordered::{OrderedError, OrderedProcessor, SessionSeqno};

/// Decides whether a topic is aggregated by the multiplexer or proxied at
/// stream level.
pub type HotTopicFn = dyn Fn(&str, &str) -> bool + Send + Sync;

pub struct ProxyOptions {
    pub num_workers: usize,
    pub io: IoConfig,
    pub sharding: Arc<dyn ShardingStrategy>,
    /// `IsHotTopic` predicate; hot topics are multiplexed.
    pub hot_topic: Arc<HotTopicFn>,
    pub router_poll_period: Duration,
    /// Reorder window of the per-session ordered processor.
    pub ordering_buffer_size: usize,
    /// Byte budget of each topic's updates accumulator.
    pub accumulator_bytes: usize,
}

impl ProxyOptions {
    pub fn new(sharding: Arc<dyn ShardingStrategy>) -> Self {
        ProxyOptions {
            // Aggregation happens per worker; one worker collapses every
            // overlapping subscription that reaches this proxy.
            num_workers: 1,
            io: IoConfig::default(),
            sharding,
            hot_topic: Arc::new(|_, _| true),
            router_poll_period: Duration::from_millis(100),
            ordering_buffer_size: 16,
            accumulator_bytes: 1024 * 1024,
        }
    }

    pub fn with_hot_topic(mut self, hot: impl Fn(&str, &str) -> bool + Send + Sync + 'static) -> Self {
        self.hot_topic = Arc::new(hot);
        self
    }
}

/// Environment shared by all proxy workers.
pub(crate) struct ProxyEnv {
    pub(crate) sharding: Arc<dyn ShardingStrategy>,
    pub(crate) hot_topic: Arc<HotTopicFn>,
    pub(crate) router_poll_period: Duration,
    pub(crate) ordering_buffer_size: usize,
    pub(crate) accumulator_bytes: usize,
}

/// A running proxy. Dropping it stops the workers and closes every
/// session.
pub struct ProxyServer {
    _msg_loop: MsgLoop,
    local_host: HostId,
}

impl ProxyServer {
    /// Bind on `port` (zero picks a free port) and start serving.
    pub fn start(options: ProxyOptions, port: u16) -> Result<ProxyServer, Status> {
        server::start(options, port)
    }

    /// Where downstream clients should connect.
    pub fn local_host(&self) -> &HostId {
        &self.local_host
    }

    pub(crate) fn assemble(msg_loop: MsgLoop, local_host: HostId) -> ProxyServer {
        ProxyServer {
            _msg_loop: msg_loop,
            local_host,
        }
    }
}
