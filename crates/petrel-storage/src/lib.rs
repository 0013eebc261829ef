// Contracts for the durable log backend and for persisted subscription
// snapshots. The real backend lives elsewhere; this crate pins down the
// interfaces the pipeline assumes and ships an in-memory implementation for
// tests and local development.
use async_trait::async_trait;
use bytes::Bytes;
use petrel_common::SequenceNumber;
use tokio::sync::mpsc;

mod memory;
mod snapshot;

pub use memory::MemoryLogStorage;
pub use snapshot::{FileSubscriptionStorage, SubscriptionSnapshot};

pub type LogId = u64;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("log {0} not found")]
    UnknownLog(LogId),
    #[error("snapshot worker index {index} out of range ({parts} parts)")]
    BadWorkerIndex { index: usize, parts: usize },
    #[error("snapshot io: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot record: {0}")]
    Record(#[from] serde_json::Error),
}

/// Classifies a run of sequence numbers with no data to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapKind {
    /// Nothing was lost; the entries carried no subscriber-visible data.
    Benign,
    /// Acknowledged entries are gone.
    DataLoss,
    /// The retention window moved past the requested position.
    Retention,
}

#[derive(Debug, Clone)]
pub struct LogRecord {
    pub log_id: LogId,
    pub seqno: SequenceNumber,
    pub payload: Bytes,
}

#[derive(Debug, Clone)]
pub struct GapRecord {
    pub log_id: LogId,
    pub kind: GapKind,
    /// First missing sequence number, inclusive.
    pub from: SequenceNumber,
    /// Last missing sequence number, inclusive.
    pub to: SequenceNumber,
}

/// What a log reader hands back: records and gaps, in sequence order.
#[derive(Debug, Clone)]
pub enum ReaderEvent {
    Record(LogRecord),
    Gap(GapRecord),
}

/// An asynchronous tailing reader over one or more logs.
///
/// Events for all open logs of this reader are pushed, in per-log sequence
/// order, into the channel supplied at creation. The channel is bounded;
/// readers stall rather than drop when the consumer falls behind.
pub trait AsyncLogReader: Send {
    /// Start (or restart) reading `log_id` from `start`. Reopening at an
    /// earlier position rewinds the reader.
    fn open(&mut self, log_id: LogId, start: SequenceNumber) -> Result<()>;

    /// Stop reading `log_id`; buffered events may still surface.
    fn close(&mut self, log_id: LogId) -> Result<()>;
}

/// The durable log backend contract assumed by the pipeline.
#[async_trait]
pub trait LogStorage: Send + Sync {
    /// Append a record, returning its assigned sequence number.
    async fn append(&self, log_id: LogId, payload: Bytes) -> Result<SequenceNumber>;

    /// Highest assigned sequence number, or zero for an empty log.
    async fn find_latest_seqno(&self, log_id: LogId) -> Result<SequenceNumber>;

    /// Create a reader delivering into `events`.
    fn create_reader(&self, events: mpsc::Sender<ReaderEvent>) -> Box<dyn AsyncLogReader>;
}
