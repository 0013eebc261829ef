// Client-side defaults and tuning.
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use petrel_io::IoConfig;
use petrel_router::{PublisherRouter, ShardingStrategy};

pub(crate) const WORKER_QUEUE_DEPTH: usize = 1024;

#[derive(Clone)]
pub struct ClientConfig {
    /// Worker loops; topics are pinned to workers by hash.
    pub num_workers: usize,
    pub io: IoConfig,
    /// Shard routing for subscriptions.
    pub sharding: Arc<dyn ShardingStrategy>,
    /// Where publishes go.
    pub publisher: Arc<PublisherRouter>,
    /// Snapshot file for `save_subscriptions`; `None` disables persistence.
    pub subscription_storage: Option<PathBuf>,
    /// How often each worker checks the router version for host changes.
    pub router_poll_period: Duration,
    /// Depth of each worker's command queue; overflow surfaces as
    /// `QueueFull` from the client API.
    pub worker_queue_depth: usize,
}

impl ClientConfig {
    pub fn new(sharding: Arc<dyn ShardingStrategy>, publisher: Arc<PublisherRouter>) -> Self {
        ClientConfig {
            num_workers: 4,
            io: IoConfig::default(),
            sharding,
            publisher,
            subscription_storage: None,
            router_poll_period: Duration::from_millis(100),
            worker_queue_depth: WORKER_QUEUE_DEPTH,
        }
    }
}
