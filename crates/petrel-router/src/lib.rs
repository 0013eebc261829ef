// Shard routing: maps (namespace, topic) to a shard, and shards to broker
// hosts, with a version that bumps whenever host bindings change.
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use petrel_common::hash::murmur2_64;
use petrel_common::HostId;

mod consistent;
mod log_router;
mod rendezvous;

pub use consistent::ConsistentHashRouter;
pub use log_router::{LogId, LogRouter};
pub use rendezvous::RendezvousHashRouter;

pub type ShardId = u64;
/// Stable identifier of a routing slot; host bindings may change underneath it.
pub type NodeId = u64;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("bad config entry {0:?}")]
    BadConfig(String),
    #[error("no hosts configured")]
    NoHosts,
}

/// Encapsulates sharding logic.
///
/// `get_shard` is a pure function of `(namespace, topic)` at a fixed version.
/// `version` must be a cheap atomic load; a change means one or more shards
/// may now resolve to a different host. `get_host` may take a lock but must
/// not perform I/O.
pub trait ShardingStrategy: Send + Sync {
    fn get_shard(&self, namespace: &str, topic: &str) -> ShardId;
    fn version(&self) -> u64;
    fn get_host(&self, shard: ShardId) -> Option<HostId>;
    fn mark_host_down(&self, host: &HostId);
}

/// Selects hosts for a routing key; implemented by both hash routers.
pub trait HostSelector: Send + Sync {
    /// Up to `num_copies` distinct hosts for the key, primary first.
    fn hosts_for(&self, key: u64) -> Vec<HostId>;
}

fn shard_key(namespace: &str, topic: &str) -> u64 {
    // A zero byte separates the parts so ("ab","c") and ("a","bc") differ.
    let mut buf = Vec::with_capacity(namespace.len() + topic.len() + 1);
    buf.extend_from_slice(namespace.as_bytes());
    buf.push(0);
    buf.extend_from_slice(topic.as_bytes());
    murmur2_64(&buf, 0xbaba_b00f)
}

struct StrategyState {
    selector: Box<dyn HostSelector>,
}

/// Sharding strategy backed by a swappable host selector.
///
/// Rebinding hosts (or marking one down) bumps the version; routing itself is
/// stable for a fixed version.
pub struct RouterShardingStrategy {
    num_shards: u64,
    version: AtomicU64,
    state: RwLock<StrategyState>,
}

impl RouterShardingStrategy {
    pub fn new(selector: Box<dyn HostSelector>, num_shards: u64) -> Self {
        RouterShardingStrategy {
            num_shards: num_shards.max(1),
            version: AtomicU64::new(1),
            state: RwLock::new(StrategyState { selector }),
        }
    }

    /// Replace the host selector; affected shards re-resolve on next use.
    pub fn update_hosts(&self, selector: Box<dyn HostSelector>) {
        {
            let mut state = self.state.write().expect("strategy lock");
            state.selector = selector;
        }
        self.version.fetch_add(1, Ordering::Release);
    }
}

impl ShardingStrategy for RouterShardingStrategy {
    fn get_shard(&self, namespace: &str, topic: &str) -> ShardId {
        shard_key(namespace, topic) % self.num_shards
    }

    fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn get_host(&self, shard: ShardId) -> Option<HostId> {
        let state = self.state.read().expect("strategy lock");
        state.selector.hosts_for(shard).into_iter().next()
    }

    fn mark_host_down(&self, host: &HostId) {
        // Advisory only; force re-resolution by bumping the version.
        tracing::warn!(host = %host, "host marked down");
        self.version.fetch_add(1, Ordering::Release);
    }
}

/// Single-host strategy: every shard resolves to one fixed host. Useful for
/// tests and single-broker deployments; the host can still be swapped, which
/// bumps the version like any other rebinding.
pub struct FixedShardingStrategy {
    num_shards: u64,
    version: AtomicU64,
    host: RwLock<HostId>,
}

impl FixedShardingStrategy {
    pub fn new(host: HostId, num_shards: u64) -> Self {
        FixedShardingStrategy {
            num_shards: num_shards.max(1),
            version: AtomicU64::new(1),
            host: RwLock::new(host),
        }
    }

    pub fn set_host(&self, host: HostId) {
        *self.host.write().expect("host lock") = host;
        self.version.fetch_add(1, Ordering::Release);
    }
}

impl ShardingStrategy for FixedShardingStrategy {
    fn get_shard(&self, namespace: &str, topic: &str) -> ShardId {
        shard_key(namespace, topic) % self.num_shards
    }

    fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn get_host(&self, _shard: ShardId) -> Option<HostId> {
        Some(self.host.read().expect("host lock").clone())
    }

    fn mark_host_down(&self, host: &HostId) {
        tracing::warn!(host = %host, "host marked down");
        self.version.fetch_add(1, Ordering::Release);
    }
}

/// Parse a `;`-separated `key=value` configuration string.
fn parse_config(config: &str) -> Result<BTreeMap<&str, &str>> {
    let mut entries = BTreeMap::new();
    for part in config.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| Error::BadConfig(part.to_string()))?;
        entries.insert(key.trim(), value.trim());
    }
    Ok(entries)
}

/// Build a sharding strategy from a configuration string.
///
/// Recognized keys: `hosts` (comma-separated `host:port` list), `strategy`
/// (`consistent`, the default, or `rendezvous`), `shards`, `copies`,
/// `replicas` (ring points per host, consistent hashing only).
///
/// ```
/// use petrel_router::{create_sharding_strategy, ShardingStrategy};
///
/// let strategy =
///     create_sharding_strategy("hosts=a:1,b:2;strategy=rendezvous;shards=64").expect("strategy");
/// assert!(strategy.get_host(0).is_some());
/// assert_eq!(strategy.version(), 1);
/// ```
pub fn create_sharding_strategy(config: &str) -> Result<Box<dyn ShardingStrategy>> {
    let entries = parse_config(config)?;
    let hosts_value = entries.get("hosts").ok_or(Error::NoHosts)?;
    let mut hosts: BTreeMap<NodeId, HostId> = BTreeMap::new();
    for (index, host) in hosts_value.split(',').enumerate() {
        let host: HostId = host
            .trim()
            .parse()
            .map_err(|_| Error::BadConfig(format!("hosts={host}")))?;
        hosts.insert(index as NodeId, host);
    }
    if hosts.is_empty() {
        return Err(Error::NoHosts);
    }
    let parse_number = |key: &str, default: u64| -> Result<u64> {
        match entries.get(key) {
            Some(value) => value
                .parse::<u64>()
                .map_err(|_| Error::BadConfig(format!("{key}={value}"))),
            None => Ok(default),
        }
    };
    let num_shards = parse_number("shards", 1024)?;
    let num_copies = parse_number("copies", 1)? as usize;
    let replicas = parse_number("replicas", 100)? as usize;
    let selector: Box<dyn HostSelector> = match entries.get("strategy").copied() {
        None | Some("consistent") => {
            Box::new(ConsistentHashRouter::new(hosts, replicas, num_copies))
        }
        Some("rendezvous") => Box::new(RendezvousHashRouter::new(hosts, num_copies)),
        Some(other) => return Err(Error::BadConfig(format!("strategy={other}"))),
    };
    Ok(Box::new(RouterShardingStrategy::new(selector, num_shards)))
}

/// Tells publishers where to send data.
pub struct PublisherRouter {
    pilot: HostId,
    copilot: Option<HostId>,
}

impl PublisherRouter {
    /// Build from a configuration string; recognized keys are `pilot=<host>`
    /// and `copilot=<host>`.
    pub fn create(config: &str) -> Result<Self> {
        let entries = parse_config(config)?;
        let pilot = entries
            .get("pilot")
            .ok_or_else(|| Error::BadConfig("missing pilot".into()))?
            .parse::<HostId>()
            .map_err(|_| Error::BadConfig("pilot".into()))?;
        let copilot = match entries.get("copilot") {
            Some(value) => Some(
                value
                    .parse::<HostId>()
                    .map_err(|_| Error::BadConfig("copilot".into()))?,
            ),
            None => None,
        };
        Ok(PublisherRouter { pilot, copilot })
    }

    pub fn pilot(&self) -> &HostId {
        &self.pilot
    }

    pub fn copilot(&self) -> Option<&HostId> {
        self.copilot.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_is_pure_at_fixed_version() {
        let strategy = create_sharding_strategy("hosts=a:1,b:2,c:3").expect("strategy");
        let shard = strategy.get_shard("guest", "orders");
        for _ in 0..100 {
            assert_eq!(strategy.get_shard("guest", "orders"), shard);
        }
    }

    #[test]
    fn namespace_separator_matters() {
        // ("ab","c") and ("a","bc") must be distinct routing keys.
        assert_ne!(shard_key("ab", "c"), shard_key("a", "bc"));
    }

    #[test]
    fn version_bumps_on_update_and_mark_down() {
        let strategy = create_sharding_strategy("hosts=a:1,b:2").expect("strategy");
        let v0 = strategy.version();
        strategy.mark_host_down(&HostId::local(1));
        assert!(strategy.version() > v0);
    }

    #[test]
    fn fixed_strategy_swaps_host() {
        let strategy = FixedShardingStrategy::new(HostId::local(1), 16);
        let v0 = strategy.version();
        assert_eq!(strategy.get_host(3), Some(HostId::local(1)));
        strategy.set_host(HostId::local(2));
        assert!(strategy.version() > v0);
        assert_eq!(strategy.get_host(3), Some(HostId::local(2)));
    }

    #[test]
    fn config_rejects_garbage() {
        assert!(create_sharding_strategy("hosts=a:1;shards=banana").is_err());
        assert!(create_sharding_strategy("no-equals-sign").is_err());
        assert!(create_sharding_strategy("strategy=consistent").is_err());
    }

    #[test]
    fn publisher_router_parses_hosts() {
        let router = PublisherRouter::create("pilot=p:1;copilot=c:2").expect("router");
        assert_eq!(router.pilot(), &"p:1".parse().unwrap());
        assert_eq!(router.copilot(), Some(&"c:2".parse().unwrap()));
        assert!(PublisherRouter::create("copilot=c:2").is_err());
    }
}
