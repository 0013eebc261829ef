// Host identifiers used for shard routing and socket reuse.
use serde::{Deserialize, Serialize};

use crate::{Status, StatusCode};

/// A `host:port` pair identifying a remote endpoint. Sockets are pooled by
/// this value, and sharding strategies bind shards to it.
///
/// ```
/// use petrel_common::HostId;
///
/// let host: HostId = "broker-1:4450".parse().expect("host");
/// assert_eq!(host.to_string(), "broker-1:4450");
/// assert_eq!(HostId::local(4450).hostname(), "127.0.0.1");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HostId {
    hostname: String,
    port: u16,
}

impl HostId {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        HostId {
            hostname: hostname.into(),
            port,
        }
    }

    /// Loopback host, used heavily by tests.
    pub fn local(port: u16) -> Self {
        HostId::new("127.0.0.1", port)
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl std::fmt::Display for HostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

impl std::str::FromStr for HostId {
    type Err = Status;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (hostname, port) = value.rsplit_once(':').ok_or_else(|| {
            Status::new(StatusCode::InvalidArgument, format!("missing port in host {value:?}"))
        })?;
        if hostname.is_empty() {
            return Err(Status::invalid_argument(format!("empty hostname in {value:?}")));
        }
        let port = port.parse::<u16>().map_err(|_| {
            Status::invalid_argument(format!("bad port in host {value:?}"))
        })?;
        Ok(HostId::new(hostname, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trip() {
        let host: HostId = "tower.example.com:9000".parse().expect("host");
        assert_eq!(host.hostname(), "tower.example.com");
        assert_eq!(host.port(), 9000);
        assert_eq!(host.to_string().parse::<HostId>().expect("again"), host);
    }

    #[test]
    fn parse_rejects_missing_port() {
        assert!("no-port-here".parse::<HostId>().is_err());
        assert!(":4450".parse::<HostId>().is_err());
        assert!("host:not-a-port".parse::<HostId>().is_err());
    }
}
