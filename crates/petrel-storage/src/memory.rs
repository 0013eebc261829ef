// In-memory log backend. Sequence numbers start at one per log; tests can
// reserve explicit gap entries and trim the head to simulate retention.
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use petrel_common::SequenceNumber;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::{
    AsyncLogReader, Error, GapKind, GapRecord, LogId, LogRecord, LogStorage, ReaderEvent, Result,
};

#[derive(Clone)]
enum Entry {
    Record(Bytes),
    Gap(GapKind),
}

#[derive(Default)]
struct LogState {
    entries: BTreeMap<SequenceNumber, Entry>,
    next_seqno: SequenceNumber,
    /// Everything at or below this was trimmed away.
    trimmed_until: SequenceNumber,
}

impl LogState {
    fn new() -> Self {
        LogState {
            entries: BTreeMap::new(),
            next_seqno: 1,
            trimmed_until: 0,
        }
    }
}

struct Shared {
    logs: Mutex<HashMap<LogId, LogState>>,
    // One notifier for all logs keeps the accounting trivial; readers
    // re-check their own cursor after every wakeup.
    appended: Notify,
}

/// In-memory `LogStorage`.
///
/// ```
/// use petrel_storage::{LogStorage, MemoryLogStorage};
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let storage = MemoryLogStorage::new();
///     let seqno = storage.append(1, "hi".into()).await.expect("append");
///     assert_eq!(seqno, 1);
///     assert_eq!(storage.find_latest_seqno(1).await.expect("latest"), 1);
/// });
/// ```
#[derive(Clone)]
pub struct MemoryLogStorage {
    shared: Arc<Shared>,
}

impl Default for MemoryLogStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLogStorage {
    pub fn new() -> Self {
        MemoryLogStorage {
            shared: Arc::new(Shared {
                logs: Mutex::new(HashMap::new()),
                appended: Notify::new(),
            }),
        }
    }

    /// Reserve the next sequence number for a non-data entry.
    pub fn append_gap(&self, log_id: LogId, kind: GapKind) -> SequenceNumber {
        let mut logs = self.shared.logs.lock().expect("logs lock");
        let log = logs.entry(log_id).or_insert_with(LogState::new);
        let seqno = log.next_seqno;
        log.next_seqno += 1;
        log.entries.insert(seqno, Entry::Gap(kind));
        drop(logs);
        self.shared.appended.notify_waiters();
        seqno
    }

    /// Drop every entry at or below `until`; readers positioned earlier will
    /// observe a retention gap.
    pub fn trim(&self, log_id: LogId, until: SequenceNumber) {
        let mut logs = self.shared.logs.lock().expect("logs lock");
        let log = logs.entry(log_id).or_insert_with(LogState::new);
        log.entries = log.entries.split_off(&(until + 1));
        log.trimmed_until = log.trimmed_until.max(until);
        drop(logs);
        self.shared.appended.notify_waiters();
    }
}

#[async_trait]
impl LogStorage for MemoryLogStorage {
    async fn append(&self, log_id: LogId, payload: Bytes) -> Result<SequenceNumber> {
        let seqno = {
            let mut logs = self.shared.logs.lock().expect("logs lock");
            let log = logs.entry(log_id).or_insert_with(LogState::new);
            let seqno = log.next_seqno;
            log.next_seqno += 1;
            log.entries.insert(seqno, Entry::Record(payload));
            seqno
        };
        self.shared.appended.notify_waiters();
        Ok(seqno)
    }

    async fn find_latest_seqno(&self, log_id: LogId) -> Result<SequenceNumber> {
        let logs = self.shared.logs.lock().expect("logs lock");
        Ok(logs.get(&log_id).map(|log| log.next_seqno - 1).unwrap_or(0))
    }

    fn create_reader(&self, events: mpsc::Sender<ReaderEvent>) -> Box<dyn AsyncLogReader> {
        Box::new(MemoryLogReader {
            shared: Arc::clone(&self.shared),
            events,
            tails: HashMap::new(),
        })
    }
}

struct MemoryLogReader {
    shared: Arc<Shared>,
    events: mpsc::Sender<ReaderEvent>,
    tails: HashMap<LogId, JoinHandle<()>>,
}

impl AsyncLogReader for MemoryLogReader {
    fn open(&mut self, log_id: LogId, start: SequenceNumber) -> Result<()> {
        // Reopen rewinds: replace any existing tailing task.
        if let Some(task) = self.tails.remove(&log_id) {
            task.abort();
        }
        let task = tokio::spawn(tail_log(
            Arc::clone(&self.shared),
            self.events.clone(),
            log_id,
            start,
        ));
        self.tails.insert(log_id, task);
        Ok(())
    }

    fn close(&mut self, log_id: LogId) -> Result<()> {
        match self.tails.remove(&log_id) {
            Some(task) => {
                task.abort();
                Ok(())
            }
            None => Err(Error::UnknownLog(log_id)),
        }
    }
}

impl Drop for MemoryLogReader {
    fn drop(&mut self) {
        for (_, task) in self.tails.drain() {
            task.abort();
        }
    }
}

async fn tail_log(
    shared: Arc<Shared>,
    events: mpsc::Sender<ReaderEvent>,
    log_id: LogId,
    start: SequenceNumber,
) {
    let mut cursor = start.max(1);
    loop {
        // Register interest before scanning so an append between the scan and
        // the await cannot be missed.
        let notified = shared.appended.notified();
        let mut batch: Vec<ReaderEvent> = Vec::new();
        {
            let logs = shared.logs.lock().expect("logs lock");
            if let Some(log) = logs.get(&log_id) {
                if cursor <= log.trimmed_until {
                    batch.push(ReaderEvent::Gap(GapRecord {
                        log_id,
                        kind: GapKind::Retention,
                        from: cursor,
                        to: log.trimmed_until,
                    }));
                    cursor = log.trimmed_until + 1;
                }
                for (seqno, entry) in log.entries.range(cursor..) {
                    match entry {
                        Entry::Record(payload) => batch.push(ReaderEvent::Record(LogRecord {
                            log_id,
                            seqno: *seqno,
                            payload: payload.clone(),
                        })),
                        Entry::Gap(kind) => batch.push(ReaderEvent::Gap(GapRecord {
                            log_id,
                            kind: *kind,
                            from: *seqno,
                            to: *seqno,
                        })),
                    }
                    cursor = seqno + 1;
                }
            }
        }
        for event in batch {
            if events.send(event).await.is_err() {
                return;
            }
        }
        notified.await;
    }
}
