// Publish path for one worker: a single stream to the pilot, pending acks
// keyed by message id, and reconnect-on-demand.
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use bytes::Bytes;
use petrel_common::{HostId, MsgId, NamespaceId, Status, TenantId, Topic};
use petrel_io::{LoopCtx, Stream, StreamEvent};
use petrel_wire::{AckStatus, Message};

use crate::{PublishCallback, ResultStatus};

struct PendingPublish {
    tenant: TenantId,
    namespace: NamespaceId,
    topic: Topic,
    payload: Bytes,
    callback: PublishCallback,
}

struct PublisherState {
    sink: Option<Stream>,
    connecting: bool,
    pending: HashMap<MsgId, PendingPublish>,
    /// Ids inserted while no sink was up, in call order; flushed
    /// front-to-back after connect so publish order reaches the pilot
    /// intact.
    unsent: VecDeque<MsgId>,
}

pub(crate) struct Publisher {
    ctx: LoopCtx,
    pilot: HostId,
    state: Rc<RefCell<PublisherState>>,
}

impl Publisher {
    pub(crate) fn new(ctx: &LoopCtx, pilot: HostId) -> Self {
        Publisher {
            ctx: ctx.clone(),
            pilot,
            state: Rc::new(RefCell::new(PublisherState {
                sink: None,
                connecting: false,
                pending: HashMap::new(),
                unsent: VecDeque::new(),
            })),
        }
    }

    pub(crate) fn publish(
        &self,
        tenant: TenantId,
        namespace: NamespaceId,
        topic: Topic,
        msg_id: MsgId,
        payload: Bytes,
        callback: PublishCallback,
    ) {
        {
            let mut state = self.state.borrow_mut();
            if state.pending.contains_key(&msg_id) {
                drop(state);
                callback(ResultStatus {
                    status: Status::invalid_argument("message id already in flight"),
                    msg_id,
                    seqno: 0,
                    namespace,
                    topic,
                    contents: payload,
                });
                return;
            }
            state.pending.insert(
                msg_id,
                PendingPublish {
                    tenant,
                    namespace,
                    topic,
                    payload,
                    callback,
                },
            );
            state.unsent.push_back(msg_id);
        }
        self.flush_or_connect();
    }

    fn flush_or_connect(&self) {
        let needs_connect = {
            let state = self.state.borrow();
            state.sink.is_none() && !state.connecting
        };
        if needs_connect {
            self.state.borrow_mut().connecting = true;
            let ctx = self.ctx.clone();
            let pilot = self.pilot.clone();
            let shared = Rc::clone(&self.state);
            self.ctx.spawn(async move {
                match ctx.open_stream(&pilot).await {
                    Ok(stream) => {
                        install_receiver(&shared, &stream);
                        {
                            let mut state = shared.borrow_mut();
                            state.connecting = false;
                            state.sink = Some(stream);
                        }
                        flush_unsent(&shared);
                    }
                    Err(status) => {
                        tracing::warn!(host = %pilot, error = %status, "pilot connect failed");
                        fail_all(&shared, Status::io_error("pilot unreachable"));
                        shared.borrow_mut().connecting = false;
                    }
                }
            });
            return;
        }
        flush_unsent(&self.state);
    }
}

fn flush_unsent(shared: &Rc<RefCell<PublisherState>>) {
    loop {
        let (sink, msg) = {
            let mut state = shared.borrow_mut();
            let Some(sink) = state.sink.clone() else {
                return;
            };
            let Some(msg_id) = state.unsent.pop_front() else {
                return;
            };
            let Some(pending) = state.pending.get(&msg_id) else {
                continue;
            };
            (
                sink,
                Message::Publish {
                    tenant: pending.tenant,
                    namespace: pending.namespace.clone(),
                    topic: pending.topic.clone(),
                    msg_id,
                    payload: pending.payload.clone(),
                },
            )
        };
        sink.send(&msg);
    }
}

fn install_receiver(shared: &Rc<RefCell<PublisherState>>, stream: &Stream) {
    let weak = Rc::downgrade(shared);
    stream.set_receiver(Box::new(move |_flow, event| {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        match event {
            StreamEvent::Message(Message::DataAck { acks, .. }) => {
                for ack in acks {
                    let pending = shared.borrow_mut().pending.remove(&ack.msg_id);
                    let Some(pending) = pending else {
                        tracing::debug!(msg_id = %ack.msg_id, "ack for unknown publish");
                        continue;
                    };
                    let status = match ack.status {
                        AckStatus::Success => Status::ok(),
                        AckStatus::Failure => Status::internal_error("publish rejected"),
                    };
                    (pending.callback)(ResultStatus {
                        status,
                        msg_id: ack.msg_id,
                        seqno: ack.seqno,
                        namespace: pending.namespace,
                        topic: pending.topic,
                        contents: pending.payload,
                    });
                }
            }
            StreamEvent::Message(Message::Goodbye { .. }) => {
                // Connection lost with acks outstanding: fail them all; the
                // application decides whether to republish.
                {
                    let mut state = shared.borrow_mut();
                    state.sink = None;
                    state.unsent.clear();
                }
                fail_all(&shared, Status::io_error("pilot connection lost"));
            }
            StreamEvent::Message(message) => {
                tracing::debug!(kind = ?message.message_type(), "unexpected message on publish stream");
            }
            StreamEvent::Health(_) => {}
        }
    }));
}

fn fail_all(shared: &Rc<RefCell<PublisherState>>, status: Status) {
    let failed: Vec<(MsgId, PendingPublish)> = {
        let mut state = shared.borrow_mut();
        state.unsent.clear();
        state.pending.drain().collect()
    };
    for (msg_id, pending) in failed {
        (pending.callback)(ResultStatus {
            status: status.clone(),
            msg_id,
            seqno: 0,
            namespace: pending.namespace,
            topic: pending.topic,
            contents: pending.payload,
        });
    }
}
