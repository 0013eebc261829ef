// Broker node: accepts publishes (pilot path) and subscriptions, owns one
// room per worker, and coalesces overlapping subscriptions to a topic into
// one reader against the durable log.
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use petrel_common::{HostId, MsgId, Status};
use petrel_io::{IoConfig, MsgLoop};
use petrel_router::{LogId, LogRouter};
use petrel_storage::LogStorage;
use petrel_wire::Message;
use tokio::sync::mpsc;

mod cache;
mod log_tailer;
mod pilot;
mod room;
mod server;
mod topic_tailer;

use room::{AdminRequest, RoomCmd};

/// Upper bound accepted by `cache set`.
const MAX_CACHE_CAPACITY: usize = 1 << 40;

/// Broker-side name of one subscription instance: the network worker and
/// origin key identify the stream, the wire sub id the subscription on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Origin {
    pub(crate) worker: usize,
    pub(crate) key: u64,
}

pub struct TowerOptions {
    /// Workers, each hosting one room.
    pub num_workers: usize,
    pub io: IoConfig,
    pub storage: Arc<dyn LogStorage>,
    /// Topic-to-log binding; every topic maps into this range.
    pub log_router: LogRouter,
    /// Reader slots each room may hold against storage.
    pub readers_per_room: usize,
    /// Total record-cache budget, split equally across rooms.
    pub cache_bytes: usize,
    /// Bloom bits for negative topic lookups; zero disables the filter.
    pub cache_bloom_bits: usize,
    /// Skip the cache for reserved (underscore) namespaces.
    pub cache_reserved_bypass: bool,
    pub room_inbox_depth: usize,
    pub reader_inbox_depth: usize,
}

impl TowerOptions {
    pub fn new(storage: Arc<dyn LogStorage>) -> Self {
        TowerOptions {
            num_workers: 2,
            io: IoConfig::default(),
            storage,
            log_router: LogRouter::new(1, 256),
            readers_per_room: 64,
            cache_bytes: 64 * 1024 * 1024,
            cache_bloom_bits: 1 << 16,
            cache_reserved_bypass: true,
            room_inbox_depth: 256,
            reader_inbox_depth: 256,
        }
    }
}

pub(crate) struct TowerEnv {
    pub(crate) storage: Arc<dyn LogStorage>,
    pub(crate) log_router: LogRouter,
    pub(crate) room_txs: Vec<mpsc::Sender<RoomCmd>>,
    pub(crate) reply_txs: Vec<mpsc::Sender<(u64, Message)>>,
    /// Message ids acked in this broker lifetime; duplicates never ack
    /// twice.
    pub(crate) dedupe: Mutex<HashSet<MsgId>>,
    pub(crate) num_rooms: usize,
    pub(crate) readers_per_room: usize,
    pub(crate) cache_bytes_per_room: usize,
    pub(crate) cache_bloom_bits: usize,
    pub(crate) cache_reserved_bypass: bool,
    pub(crate) reader_inbox_depth: usize,
}

/// A running broker node. Dropping it stops the workers, which closes
/// every client connection.
pub struct ControlTower {
    _msg_loop: MsgLoop,
    env: Arc<TowerEnv>,
    local_host: HostId,
}

impl ControlTower {
    pub fn start(options: TowerOptions, port: u16) -> Result<ControlTower, Status> {
        server::start(options, port)
    }

    pub fn local_host(&self) -> &HostId {
        &self.local_host
    }

    pub(crate) fn assemble(msg_loop: MsgLoop, env: Arc<TowerEnv>, local_host: HostId) -> Self {
        ControlTower {
            _msg_loop: msg_loop,
            env,
            local_host,
        }
    }

    /// Synchronous operational interface. Understood commands:
    /// `logs`, `log <id>`, `tail_seqno <id>`,
    /// `cache {usage|capacity|clear|set <bytes>}`.
    pub fn run_admin_command(&self, command: &str) -> Result<String, Status> {
        let parts: Vec<&str> = command.split_whitespace().collect();
        match parts.as_slice() {
            ["logs"] => self.ask_all_rooms(|| AdminRequest::Logs),
            ["log", id] => {
                let log_id = parse_log_id(id)?;
                self.ask_room(log_id, AdminRequest::LogInfo(log_id))
            }
            ["tail_seqno", id] => {
                let log_id = parse_log_id(id)?;
                self.ask_room(log_id, AdminRequest::TailSeqno(log_id))
            }
            ["cache", "usage"] => self.ask_all_rooms(|| AdminRequest::CacheUsage),
            ["cache", "capacity"] => self.ask_all_rooms(|| AdminRequest::CacheCapacity),
            ["cache", "clear"] => self.ask_all_rooms(|| AdminRequest::CacheClear),
            ["cache", "set", bytes] => {
                let bytes: usize = bytes
                    .parse()
                    .map_err(|_| Status::invalid_argument("bad cache capacity"))?;
                if bytes > MAX_CACHE_CAPACITY {
                    return Err(Status::invalid_argument("cache capacity above 1 TiB"));
                }
                // The new capacity splits equally across rooms.
                let per_room = bytes / self.env.num_rooms;
                self.ask_all_rooms(move || AdminRequest::CacheSetCapacity(per_room))
            }
            _ => Err(Status::invalid_argument(format!(
                "unknown admin command {command:?}"
            ))),
        }
    }

    fn ask_room(&self, log_id: LogId, request: AdminRequest) -> Result<String, Status> {
        let room = (log_id % self.env.num_rooms as u64) as usize;
        let (tx, rx) = std::sync::mpsc::channel();
        self.env.room_txs[room]
            .try_send(RoomCmd::Admin { request, reply: tx })
            .map_err(|_| Status::queue_full("room inbox at capacity"))?;
        rx.recv_timeout(Duration::from_secs(5))
            .map_err(|_| Status::timed_out("room did not answer"))
    }

    fn ask_all_rooms(&self, request: impl Fn() -> AdminRequest) -> Result<String, Status> {
        let mut lines = Vec::with_capacity(self.env.num_rooms);
        for room in 0..self.env.num_rooms {
            let (tx, rx) = std::sync::mpsc::channel();
            self.env.room_txs[room]
                .try_send(RoomCmd::Admin {
                    request: request(),
                    reply: tx,
                })
                .map_err(|_| Status::queue_full("room inbox at capacity"))?;
            lines.push(
                rx.recv_timeout(Duration::from_secs(5))
                    .map_err(|_| Status::timed_out("room did not answer"))?,
            );
        }
        Ok(lines.join("\n"))
    }
}

fn parse_log_id(value: &str) -> Result<LogId, Status> {
    value
        .parse::<LogId>()
        .map_err(|_| Status::invalid_argument(format!("bad log id {value:?}")))
}
