// One room per worker. A room single-threadedly owns its log tailer, its
// subscription tables, and its cache; commands arrive on the inbox from the
// network workers and reader events from storage, and one pump task drives
// both.
use std::collections::HashMap;
use std::sync::Arc;

use petrel_common::{NamespaceId, SequenceNumber, Status, TenantId, Topic};
use petrel_storage::{LogId, ReaderEvent};
use petrel_wire::{Message, UnsubscribeReason};
use tokio::sync::mpsc;

use crate::log_tailer::LogTailer;
use crate::topic_tailer::{ReaderAction, Reply, TopicTailer};
use crate::{Origin, TowerEnv};

/// Commands from the network workers into a room.
pub(crate) enum RoomCmd {
    Subscribe {
        origin: Origin,
        tenant: TenantId,
        namespace: NamespaceId,
        topic: Topic,
        start_seqno: SequenceNumber,
        sub_id: u64,
        log_id: LogId,
    },
    Unsubscribe {
        origin: Origin,
        sub_id: u64,
    },
    RemoveOrigin {
        origin: Origin,
    },
    FindTail {
        origin: Origin,
        tenant: TenantId,
        namespace: NamespaceId,
        topic: Topic,
        log_id: LogId,
    },
    Admin {
        request: AdminRequest,
        reply: std::sync::mpsc::Sender<String>,
    },
}

/// Operational queries and knobs, one request per room.
pub(crate) enum AdminRequest {
    LogInfo(LogId),
    Logs,
    TailSeqno(LogId),
    CacheUsage,
    CacheCapacity,
    CacheClear,
    CacheSetCapacity(usize),
}

pub(crate) struct Room {
    index: usize,
    env: Arc<TowerEnv>,
    tailer: TopicTailer,
    log_tailer: LogTailer,
    /// Next seqno each open reader will produce; rewinds only move it back.
    reader_pos: HashMap<LogId, SequenceNumber>,
}

/// Build a room and run its pump until the tower shuts down.
pub(crate) async fn run_room(
    index: usize,
    env: Arc<TowerEnv>,
    mut commands: mpsc::Receiver<RoomCmd>,
) {
    let (event_tx, mut events) = mpsc::channel::<ReaderEvent>(env.reader_inbox_depth);
    let log_tailer = LogTailer::new(Arc::clone(&env.storage), env.readers_per_room, event_tx);
    let tailer = TopicTailer::new(
        env.cache_bytes_per_room,
        env.cache_bloom_bits,
        env.cache_reserved_bypass,
    );
    let mut room = Room {
        index,
        env,
        tailer,
        log_tailer,
        reader_pos: HashMap::new(),
    };
    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(command) => room.handle_command(command).await,
                    None => break,
                }
            }
            event = events.recv() => {
                match event {
                    Some(event) => room.handle_reader_event(event).await,
                    None => break,
                }
            }
        }
    }
    room.log_tailer.stop();
}

impl Room {
    async fn handle_command(&mut self, command: RoomCmd) {
        match command {
            RoomCmd::Subscribe {
                origin,
                tenant,
                namespace,
                topic,
                start_seqno,
                sub_id,
                log_id,
            } => {
                self.subscribe(origin, tenant, namespace, topic, start_seqno, sub_id, log_id)
                    .await;
            }
            RoomCmd::Unsubscribe { origin, sub_id } => {
                let action = self.tailer.remove_subscriber(origin, sub_id);
                self.apply_reader_action(action);
            }
            RoomCmd::RemoveOrigin { origin } => {
                for log_id in self.tailer.remove_origin(origin) {
                    self.close_reader(log_id);
                }
            }
            RoomCmd::FindTail {
                origin,
                tenant,
                namespace,
                topic,
                log_id,
            } => {
                let seqno = match self.tail_seqno(log_id).await {
                    Ok(seqno) => seqno,
                    Err(status) => {
                        tracing::warn!(log_id, error = %status, "tail seqno lookup failed");
                        0
                    }
                };
                self.send_reply(
                    origin,
                    Message::TailSeqno {
                        tenant,
                        namespace,
                        topic,
                        seqno,
                    },
                )
                .await;
            }
            RoomCmd::Admin { request, reply } => {
                let _ = reply.send(self.admin(request).await);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn subscribe(
        &mut self,
        origin: Origin,
        tenant: TenantId,
        namespace: NamespaceId,
        topic: Topic,
        start_seqno: SequenceNumber,
        sub_id: u64,
        log_id: LogId,
    ) {
        // Zero means "from the next record": resolve against the tail.
        let start = if start_seqno == 0 {
            match self.tail_seqno(log_id).await {
                Ok(latest) => latest + 1,
                Err(status) => {
                    tracing::warn!(log_id, error = %status, "tail resolution failed");
                    self.send_reply(
                        origin,
                        Message::Unsubscribe {
                            tenant,
                            sub_id,
                            reason: UnsubscribeReason::BackOff,
                        },
                    )
                    .await;
                    return;
                }
            }
        } else {
            start_seqno
        };

        let (replies, action) = self.tailer.add_subscriber(
            &namespace, &topic, log_id, origin, sub_id, tenant, start,
        );
        if let Err(status) = self.try_apply_reader_action(&action) {
            // No reader slot for the log: the subscription cannot be served
            // right now. Undo the table entry and ask the client to back
            // off.
            tracing::warn!(log_id, error = %status, "cannot open log reader");
            self.tailer.remove_subscriber(origin, sub_id);
            self.send_reply(
                origin,
                Message::Unsubscribe {
                    tenant,
                    sub_id,
                    reason: UnsubscribeReason::BackOff,
                },
            )
            .await;
            return;
        }
        self.send_replies(replies).await;
    }

    async fn handle_reader_event(&mut self, event: ReaderEvent) {
        match event {
            ReaderEvent::Record(record) => {
                let pos = self.reader_pos.entry(record.log_id).or_insert(0);
                *pos = (*pos).max(record.seqno + 1);
                let mut payload = record.payload.clone();
                match Message::decode(&mut payload) {
                    Ok(Message::Publish {
                        namespace,
                        topic,
                        msg_id,
                        payload: contents,
                        ..
                    }) => {
                        let replies = self.tailer.on_record(
                            record.log_id,
                            record.seqno,
                            &namespace,
                            &topic,
                            msg_id,
                            contents,
                        );
                        self.send_replies(replies).await;
                    }
                    Ok(message) => {
                        tracing::error!(
                            log_id = record.log_id,
                            seqno = record.seqno,
                            kind = ?message.message_type(),
                            "unexpected log entry kind"
                        );
                    }
                    Err(err) => {
                        tracing::error!(
                            log_id = record.log_id,
                            seqno = record.seqno,
                            error = %err,
                            "undecodable log entry"
                        );
                    }
                }
            }
            ReaderEvent::Gap(gap) => {
                let pos = self.reader_pos.entry(gap.log_id).or_insert(0);
                *pos = (*pos).max(gap.to + 1);
                let replies = self.tailer.on_gap(gap.log_id, gap.kind, gap.from, gap.to);
                self.send_replies(replies).await;
            }
        }
    }

    /// Resolve the tail from the in-room estimate, falling back to a live
    /// storage lookup on a miss.
    async fn tail_seqno(&mut self, log_id: LogId) -> Result<SequenceNumber, Status> {
        if let Some(estimate) = self.tailer.tail_estimate(log_id) {
            return Ok(estimate);
        }
        let latest = self.log_tailer.find_latest_seqno(log_id).await?;
        self.tailer.set_tail_estimate(log_id, latest);
        Ok(latest)
    }

    fn apply_reader_action(&mut self, action: ReaderAction) {
        if let Err(status) = self.try_apply_reader_action(&action) {
            tracing::warn!(error = %status, "reader action failed");
        }
    }

    fn try_apply_reader_action(&mut self, action: &ReaderAction) -> Result<(), Status> {
        match action {
            ReaderAction::None => Ok(()),
            ReaderAction::Close { log_id } => {
                self.close_reader(*log_id);
                Ok(())
            }
            ReaderAction::Ensure { log_id, seqno } => {
                let log_id = *log_id;
                let seqno = *seqno;
                if !self.log_tailer.is_open(log_id) {
                    self.log_tailer.open(log_id, seqno)?;
                    self.reader_pos.insert(log_id, seqno);
                    return Ok(());
                }
                let pos = self.reader_pos.get(&log_id).copied().unwrap_or(0);
                if seqno < pos {
                    // A subscriber wants history the reader already passed;
                    // rewind. Later subscribers filter duplicates by seqno.
                    self.log_tailer.open(log_id, seqno)?;
                    self.reader_pos.insert(log_id, seqno);
                }
                Ok(())
            }
        }
    }

    fn close_reader(&mut self, log_id: LogId) {
        self.log_tailer.close(log_id);
        self.reader_pos.remove(&log_id);
    }

    async fn send_reply(&self, origin: Origin, message: Message) {
        let Some(tx) = self.env.reply_txs.get(origin.worker) else {
            tracing::error!(worker = origin.worker, "reply for unknown worker");
            return;
        };
        if tx.send((origin.key, message)).await.is_err() {
            tracing::debug!(worker = origin.worker, "reply channel closed");
        }
    }

    async fn send_replies(&self, replies: Vec<Reply>) {
        for (origin, message) in replies {
            self.send_reply(origin, message).await;
        }
    }

    async fn admin(&mut self, request: AdminRequest) -> String {
        match request {
            AdminRequest::LogInfo(log_id) => self.tailer.describe_log(log_id),
            AdminRequest::Logs => {
                let ids = self.tailer.log_ids();
                let readers: Vec<String> = self
                    .log_tailer
                    .slots()
                    .map(|slot| format!("{}@{}", slot.log_id, slot.start))
                    .collect();
                format!("room {}: logs {:?}, readers {:?}", self.index, ids, readers)
            }
            AdminRequest::TailSeqno(log_id) => {
                match self.log_tailer.find_latest_seqno(log_id).await {
                    Ok(seqno) => {
                        self.tailer.set_tail_estimate(log_id, seqno);
                        format!("room {}: log {log_id} tail {seqno}", self.index)
                    }
                    Err(status) => format!("room {}: log {log_id} error {status}", self.index),
                }
            }
            AdminRequest::CacheUsage => {
                format!("room {}: {}", self.index, self.tailer.cache().usage_bytes())
            }
            AdminRequest::CacheCapacity => {
                format!(
                    "room {}: {}",
                    self.index,
                    self.tailer.cache().capacity_bytes()
                )
            }
            AdminRequest::CacheClear => {
                self.tailer.cache().clear();
                format!("room {}: cache cleared", self.index)
            }
            AdminRequest::CacheSetCapacity(bytes) => {
                self.tailer.cache().set_capacity(bytes);
                format!("room {}: cache capacity {}", self.index, bytes)
            }
        }
    }
}
