// Network front of the broker: accepts client connections, validates and
// routes messages to rooms by log id, and pumps room replies back onto the
// originating streams.
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use petrel_common::{HostId, Status};
use petrel_io::{Flow, LoopCtx, MsgLoop, Stream, StreamEvent};
use petrel_wire::{Message, UnsubscribeReason};
use tokio::sync::mpsc;

use crate::pilot;
use crate::room::{run_room, RoomCmd};
use crate::{ControlTower, Origin, TowerEnv, TowerOptions};

struct NetWorker {
    ctx: LoopCtx,
    index: usize,
    env: Arc<TowerEnv>,
    /// Origin key to live stream; replies from rooms resolve through this.
    registry: RefCell<HashMap<u64, Stream>>,
    next_key: Cell<u64>,
    /// `(origin key, sub id)` to room, recorded at subscribe time so
    /// unsubscribes route without recomputing the topic's log.
    route: RefCell<HashMap<(u64, u64), usize>>,
}

impl NetWorker {
    fn on_new_stream(self: &Rc<Self>, stream: Stream, first: Message) {
        let key = self.next_key.get();
        self.next_key.set(key + 1);
        self.registry.borrow_mut().insert(key, stream.clone());
        let worker = Rc::clone(self);
        let receiver_stream = stream.clone();
        stream.set_receiver(Box::new(move |flow, event| {
            worker.on_event(key, &receiver_stream, flow, event);
        }));
        let mut flow = Flow::new();
        self.on_event(key, &stream, &mut flow, StreamEvent::Message(first));
    }

    fn on_event(self: &Rc<Self>, key: u64, stream: &Stream, flow: &mut Flow, event: StreamEvent) {
        let message = match event {
            StreamEvent::Message(message) => message,
            StreamEvent::Health(_) => return,
        };
        match message {
            Message::Subscribe {
                tenant,
                namespace,
                topic,
                start_seqno,
                sub_id,
            } => {
                if namespace.is_empty() {
                    flow.write(
                        stream,
                        Message::Unsubscribe {
                            tenant,
                            sub_id,
                            reason: UnsubscribeReason::Invalid,
                        },
                    );
                    return;
                }
                let log_id = self.env.log_router.get_log_id(&namespace, &topic);
                let room = (log_id % self.env.num_rooms as u64) as usize;
                self.route.borrow_mut().insert((key, sub_id), room);
                let command = RoomCmd::Subscribe {
                    origin: Origin {
                        worker: self.index,
                        key,
                    },
                    tenant,
                    namespace,
                    topic,
                    start_seqno,
                    sub_id,
                    log_id,
                };
                if self.env.room_txs[room].try_send(command).is_err() {
                    // Inbox full: the room is overloaded. Tell the client to
                    // come back rather than queueing unboundedly.
                    self.route.borrow_mut().remove(&(key, sub_id));
                    flow.write(
                        stream,
                        Message::Unsubscribe {
                            tenant,
                            sub_id,
                            reason: UnsubscribeReason::BackOff,
                        },
                    );
                }
            }
            Message::Unsubscribe { sub_id, .. } => {
                let Some(room) = self.route.borrow_mut().remove(&(key, sub_id)) else {
                    tracing::debug!(sub_id, "unsubscribe for unrouted subscription");
                    return;
                };
                let command = RoomCmd::Unsubscribe {
                    origin: Origin {
                        worker: self.index,
                        key,
                    },
                    sub_id,
                };
                if self.env.room_txs[room].try_send(command).is_err() {
                    tracing::warn!(room, "room inbox full; unsubscribe delayed until goodbye");
                }
            }
            Message::Goodbye { .. } => {
                self.registry.borrow_mut().remove(&key);
                self.route.borrow_mut().retain(|(k, _), _| *k != key);
                // The origin's subscriptions span every room; each one must
                // hear about the departure, so this send may not be lossy.
                let origin = Origin {
                    worker: self.index,
                    key,
                };
                let room_txs = self.env.room_txs.clone();
                self.ctx.spawn(async move {
                    for tx in room_txs {
                        let _ = tx.send(RoomCmd::RemoveOrigin { origin }).await;
                    }
                });
            }
            Message::FindTailSeqno {
                tenant,
                namespace,
                topic,
            } => {
                if namespace.is_empty() {
                    return;
                }
                let log_id = self.env.log_router.get_log_id(&namespace, &topic);
                let room = (log_id % self.env.num_rooms as u64) as usize;
                let command = RoomCmd::FindTail {
                    origin: Origin {
                        worker: self.index,
                        key,
                    },
                    tenant,
                    namespace,
                    topic,
                    log_id,
                };
                if self.env.room_txs[room].try_send(command).is_err() {
                    tracing::warn!(room, "room inbox full; dropping tail lookup");
                }
            }
            Message::Publish {
                tenant,
                namespace,
                topic,
                msg_id,
                payload,
            } => {
                pilot::handle_publish(
                    &self.ctx, &self.env, stream, tenant, namespace, topic, msg_id, payload,
                );
            }
            Message::Ping { tenant, cookie } => {
                flow.write(stream, Message::Ping { tenant, cookie });
            }
            message => {
                tracing::debug!(kind = ?message.message_type(), "unexpected client message");
            }
        }
    }
}

pub(crate) fn start(options: TowerOptions, port: u16) -> Result<ControlTower, Status> {
    let num_rooms = options.num_workers.max(1);
    let msg_loop = MsgLoop::spawn("petrel-tower", num_rooms, options.io.clone())
        .map_err(|err| Status::io_error(format!("spawn tower workers: {err}")))?;

    let mut room_txs = Vec::with_capacity(num_rooms);
    let mut room_rxs = Vec::with_capacity(num_rooms);
    let mut reply_txs = Vec::with_capacity(num_rooms);
    let mut reply_rxs = Vec::with_capacity(num_rooms);
    for _ in 0..num_rooms {
        let (tx, rx) = mpsc::channel::<RoomCmd>(options.room_inbox_depth.max(1));
        room_txs.push(tx);
        room_rxs.push(Some(rx));
        let (tx, rx) = mpsc::channel::<(u64, Message)>(options.room_inbox_depth.max(1));
        reply_txs.push(tx);
        reply_rxs.push(Some(rx));
    }

    let env = Arc::new(TowerEnv {
        storage: Arc::clone(&options.storage),
        log_router: options.log_router.clone(),
        room_txs,
        reply_txs,
        dedupe: std::sync::Mutex::new(std::collections::HashSet::new()),
        num_rooms,
        readers_per_room: options.readers_per_room,
        cache_bytes_per_room: options.cache_bytes / num_rooms,
        cache_bloom_bits: options.cache_bloom_bits,
        cache_reserved_bypass: options.cache_reserved_bypass,
        reader_inbox_depth: options.reader_inbox_depth,
    });

    let mut adopt_txs = Vec::with_capacity(num_rooms);
    for index in 0..num_rooms {
        let (adopt_tx, mut adopt_rx) = mpsc::channel::<std::net::TcpStream>(64);
        adopt_txs.push(adopt_tx);
        let env = Arc::clone(&env);
        let room_rx = room_rxs[index].take().expect("room rx");
        let reply_rx = reply_rxs[index].take().expect("reply rx");
        msg_loop.submit_to(index, move |ctx| {
            let worker = Rc::new(NetWorker {
                ctx: ctx.clone(),
                index,
                env: Arc::clone(&env),
                registry: RefCell::new(HashMap::new()),
                next_key: Cell::new(1),
                route: RefCell::new(HashMap::new()),
            });

            // The room, its reply pump, and the adoption pump all live on
            // this worker.
            let room_env = Arc::clone(&env);
            ctx.spawn(async move {
                run_room(index, room_env, room_rx).await;
            });

            let reply_worker = Rc::clone(&worker);
            ctx.spawn(async move {
                let mut reply_rx = reply_rx;
                while let Some((origin_key, message)) = reply_rx.recv().await {
                    let stream = reply_worker.registry.borrow().get(&origin_key).cloned();
                    match stream {
                        Some(stream) => {
                            stream.send(&message);
                        }
                        None => {
                            tracing::debug!(origin_key, "reply for departed stream");
                        }
                    }
                }
            });

            let adopt_ctx = ctx.clone();
            ctx.spawn(async move {
                while let Some(connection) = adopt_rx.recv().await {
                    let adopt_worker = Rc::clone(&worker);
                    let adopted = adopt_ctx.adopt_inbound(connection, move |_ctx, stream, first| {
                        adopt_worker.on_new_stream(stream, first);
                    });
                    if let Err(status) = adopted {
                        tracing::warn!(error = %status, "failed to adopt client connection");
                    }
                }
            });
        })?;
    }

    let (addr_tx, addr_rx) = std::sync::mpsc::channel();
    msg_loop.submit_to(0, move |ctx| {
        ctx.clone().spawn(async move {
            let listener = match tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => listener,
                Err(err) => {
                    let _ = addr_tx.send(Err(Status::io_error(format!("bind tower: {err}"))));
                    return;
                }
            };
            let local = listener.local_addr().expect("tower local addr");
            let _ = addr_tx.send(Ok(local));
            let mut next_worker = 0usize;
            loop {
                let Ok((connection, _)) = listener.accept().await else {
                    break;
                };
                let Ok(connection) = connection.into_std() else {
                    continue;
                };
                let target = next_worker % adopt_txs.len();
                next_worker += 1;
                if adopt_txs[target].send(connection).await.is_err() {
                    break;
                }
            }
        });
    })?;

    let local = addr_rx
        .recv_timeout(Duration::from_secs(10))
        .map_err(|_| Status::timed_out("tower bind timed out"))??;
    Ok(ControlTower::assemble(
        msg_loop,
        env,
        HostId::local(local.port()),
    ))
}
