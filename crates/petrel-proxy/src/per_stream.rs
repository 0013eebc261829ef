// One downstream client stream. Each subscription on it is either
// forwarded verbatim over a per-session upstream stream (cold topics) or
// handed to the shard's multiplexer (hot topics); the mode is recorded so
// unsubscribes find their way back.
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use std::collections::HashMap;

use petrel_common::TenantId;
use petrel_io::{Flow, Stream, StreamEvent};
use petrel_wire::{GoodbyeCode, Message};

use crate::ordered::{OrderedError, OrderedProcessor};
use crate::per_shard::PerShard;

enum SubMode {
    Forwarded,
    Multiplexed { upstream_id: u64 },
}

enum UpstreamSlot {
    Idle,
    Connecting { queued: Vec<Message> },
    Ready(Stream),
}

struct PerStreamState {
    modes: HashMap<u64, SubMode>,
    upstream: UpstreamSlot,
    /// Ingress replay protection; ingress tags each message with the next
    /// session seqno before it crosses into the shard worker.
    ordered: OrderedProcessor<Message>,
    next_session_seqno: u64,
    dead: bool,
}

pub(crate) struct PerStream {
    shard: Weak<PerShard>,
    downstream: Stream,
    state: RefCell<PerStreamState>,
}

impl PerStream {
    pub(crate) fn new(shard: &Rc<PerShard>, downstream: Stream) -> Rc<PerStream> {
        let window = shard.env.ordering_buffer_size;
        Rc::new(PerStream {
            shard: Rc::downgrade(shard),
            downstream,
            state: RefCell::new(PerStreamState {
                modes: HashMap::new(),
                upstream: UpstreamSlot::Idle,
                ordered: OrderedProcessor::new(window),
                next_session_seqno: 0,
                dead: false,
            }),
        })
    }

    /// Entry point for everything the downstream client sends.
    pub(crate) fn on_downstream(self: &Rc<Self>, flow: &mut Flow, event: StreamEvent) {
        let message = match event {
            StreamEvent::Message(message) => message,
            StreamEvent::Health(_) => return,
        };
        let released = {
            let mut state = self.state.borrow_mut();
            if state.dead {
                return;
            }
            let seqno = state.next_session_seqno;
            state.next_session_seqno += 1;
            state.ordered.push(seqno, message)
        };
        match released {
            Ok(messages) => {
                for message in messages {
                    self.dispatch(flow, message);
                }
            }
            Err(OrderedError::Duplicate(seqno)) => {
                tracing::debug!(seqno, "dropped duplicate session message");
            }
            Err(OrderedError::SequenceGap { expected, received }) => {
                tracing::warn!(expected, received, "session sequence gap; failing session");
                self.fail_session();
            }
        }
    }

    fn dispatch(self: &Rc<Self>, flow: &mut Flow, message: Message) {
        let Some(shard) = self.shard.upgrade() else {
            return;
        };
        match message {
            Message::Subscribe {
                tenant,
                namespace,
                topic,
                start_seqno,
                sub_id,
            } => {
                if (shard.env.hot_topic)(&namespace, &topic) {
                    let upstream_id = shard.mux.subscribe(
                        flow,
                        tenant,
                        &namespace,
                        &topic,
                        start_seqno,
                        self.downstream.clone(),
                        sub_id,
                    );
                    self.state
                        .borrow_mut()
                        .modes
                        .insert(sub_id, SubMode::Multiplexed { upstream_id });
                } else {
                    self.state.borrow_mut().modes.insert(sub_id, SubMode::Forwarded);
                    self.forward_upstream(
                        &shard,
                        Message::Subscribe {
                            tenant,
                            namespace,
                            topic,
                            start_seqno,
                            sub_id,
                        },
                    );
                }
            }
            Message::Unsubscribe {
                tenant,
                sub_id,
                reason,
            } => {
                let mode = self.state.borrow_mut().modes.remove(&sub_id);
                match mode {
                    Some(SubMode::Multiplexed { upstream_id }) => {
                        shard.mux.unsubscribe(upstream_id, self.downstream.id(), sub_id);
                    }
                    Some(SubMode::Forwarded) => {
                        self.forward_upstream(
                            &shard,
                            Message::Unsubscribe {
                                tenant,
                                sub_id,
                                reason,
                            },
                        );
                    }
                    None => {
                        tracing::debug!(sub_id, "unsubscribe for unknown downstream subscription");
                    }
                }
            }
            Message::Goodbye { .. } => {
                // Client is gone; fold the session without another goodbye.
                self.teardown();
            }
            Message::Ping { tenant, cookie } => {
                flow.write(
                    &self.downstream,
                    Message::Ping { tenant, cookie },
                );
            }
            // Publishes, tail lookups, and anything else ride the
            // stream-level path to the shard host.
            message => self.forward_upstream(&shard, message),
        }
    }

    /// Queue or send a message on the session's upstream stream, opening it
    /// on demand.
    fn forward_upstream(self: &Rc<Self>, shard: &Rc<PerShard>, message: Message) {
        {
            let mut state = self.state.borrow_mut();
            match &mut state.upstream {
                UpstreamSlot::Ready(stream) => {
                    let stream = stream.clone();
                    drop(state);
                    stream.send(&message);
                    return;
                }
                UpstreamSlot::Connecting { queued } => {
                    queued.push(message);
                    return;
                }
                UpstreamSlot::Idle => {
                    state.upstream = UpstreamSlot::Connecting {
                        queued: vec![message],
                    };
                }
            }
        }
        let Some(host) = shard.host() else {
            tracing::warn!(shard = shard.shard, "no host for shard; failing session");
            self.fail_session();
            return;
        };
        let this = Rc::clone(self);
        let ctx = shard.ctx.clone();
        shard.ctx.spawn(async move {
            match ctx.open_stream(&host).await {
                Ok(stream) => {
                    this.install_upstream_receiver(&stream);
                    let queued = {
                        let mut state = this.state.borrow_mut();
                        let queued = match &mut state.upstream {
                            UpstreamSlot::Connecting { queued } => std::mem::take(queued),
                            _ => Vec::new(),
                        };
                        state.upstream = UpstreamSlot::Ready(stream.clone());
                        queued
                    };
                    for message in queued {
                        stream.send(&message);
                    }
                }
                Err(status) => {
                    tracing::warn!(host = %host, error = %status, "upstream connect failed");
                    this.fail_session();
                }
            }
        });
    }

    /// The upstream half of stream-level proxying: deliveries come back on
    /// the session's upstream stream and are relayed as-is; the downstream
    /// client already speaks the same subscription ids.
    fn install_upstream_receiver(self: &Rc<Self>, stream: &Stream) {
        let this = Rc::downgrade(self);
        stream.set_receiver(Box::new(move |flow, event| {
            let Some(this) = this.upgrade() else {
                return;
            };
            match event {
                StreamEvent::Message(Message::Goodbye { .. }) => {
                    this.fail_session();
                }
                StreamEvent::Message(message) => {
                    flow.write(&this.downstream, message);
                }
                StreamEvent::Health(_) => {}
            }
        }));
    }

    /// Route change: the upstream host is gone for this session's purposes.
    /// Stream-level subscriptions cannot be migrated, so the whole session
    /// is failed and the client re-subscribes against the new route.
    pub(crate) fn change_route(self: &Rc<Self>) {
        self.fail_session();
    }

    fn fail_session(self: &Rc<Self>) {
        if self.state.borrow().dead {
            return;
        }
        self.downstream.send(&Message::Goodbye {
            tenant: TenantId::SYSTEM,
            code: GoodbyeCode::SocketError,
        });
        self.teardown();
    }

    fn teardown(self: &Rc<Self>) {
        {
            let mut state = self.state.borrow_mut();
            if state.dead {
                return;
            }
            state.dead = true;
            if let UpstreamSlot::Ready(stream) = &state.upstream {
                stream.close(true);
            }
            state.upstream = UpstreamSlot::Idle;
            state.modes.clear();
        }
        if let Some(shard) = self.shard.upgrade() {
            shard.mux.remove_session(self.downstream.id());
            shard.remove_session(self.downstream.id());
        }
        // Removing the stream leaves the socket alive for the client's
        // other sessions.
        self.downstream.close(false);
    }
}
