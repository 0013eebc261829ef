// Thin adapter over the storage reader pool, enforcing the per-room reader
// slot budget. Reader events land in the room's bounded inbox; the storage
// task stalls rather than drop when the room falls behind.
use std::collections::HashMap;
use std::sync::Arc;

use petrel_common::{SequenceNumber, Status};
use petrel_storage::{AsyncLogReader, LogId, LogStorage, ReaderEvent};
use tokio::sync::mpsc;

pub(crate) struct SlotInfo {
    pub(crate) log_id: LogId,
    pub(crate) start: SequenceNumber,
}

pub(crate) struct LogTailer {
    storage: Arc<dyn LogStorage>,
    reader: Box<dyn AsyncLogReader>,
    slots: HashMap<LogId, SlotInfo>,
    max_slots: usize,
}

impl LogTailer {
    pub(crate) fn new(
        storage: Arc<dyn LogStorage>,
        max_slots: usize,
        events: mpsc::Sender<ReaderEvent>,
    ) -> Self {
        let reader = storage.create_reader(events);
        LogTailer {
            storage,
            reader,
            slots: HashMap::new(),
            max_slots: max_slots.max(1),
        }
    }

    /// Bind a reader slot for `log_id` at `start`, or rewind an existing
    /// one. Fails with `QueueFull` when every slot is taken.
    pub(crate) fn open(&mut self, log_id: LogId, start: SequenceNumber) -> Result<(), Status> {
        if let Some(slot) = self.slots.get_mut(&log_id) {
            slot.start = start;
        } else {
            if self.slots.len() >= self.max_slots {
                return Err(Status::queue_full(format!(
                    "no reader slots left ({} in use)",
                    self.slots.len()
                )));
            }
            self.slots.insert(log_id, SlotInfo { log_id, start });
        }
        self.reader
            .open(log_id, start)
            .map_err(|err| Status::io_error(format!("open log {log_id}: {err}")))
    }

    pub(crate) fn is_open(&self, log_id: LogId) -> bool {
        self.slots.contains_key(&log_id)
    }

    pub(crate) fn close(&mut self, log_id: LogId) {
        if self.slots.remove(&log_id).is_some() {
            if let Err(err) = self.reader.close(log_id) {
                tracing::warn!(log_id, error = %err, "failed to close log reader");
            }
        }
    }

    pub(crate) async fn find_latest_seqno(&self, log_id: LogId) -> Result<SequenceNumber, Status> {
        self.storage
            .find_latest_seqno(log_id)
            .await
            .map_err(|err| Status::io_error(format!("find latest seqno for {log_id}: {err}")))
    }

    pub(crate) fn slots(&self) -> impl Iterator<Item = &SlotInfo> {
        self.slots.values()
    }

    /// Cut loose from storage during shutdown.
    pub(crate) fn stop(&mut self) {
        let open: Vec<LogId> = self.slots.keys().copied().collect();
        for log_id in open {
            self.close(log_id);
        }
    }
}
