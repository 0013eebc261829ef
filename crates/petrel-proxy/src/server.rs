// Accept loop and per-worker session wiring. Connections are spread over
// the workers round-robin; everything about one connection then stays on
// its worker.
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use petrel_common::{HostId, Status};
use petrel_io::{LoopCtx, MsgLoop, Stream, StreamEvent};
use petrel_router::ShardId;
use petrel_wire::Message;
use tokio::sync::mpsc;

use crate::per_shard::PerShard;
use crate::per_stream::PerStream;
use crate::{ProxyEnv, ProxyOptions, ProxyServer};

struct ProxyWorker {
    ctx: LoopCtx,
    env: Arc<ProxyEnv>,
    shards: RefCell<HashMap<ShardId, Rc<PerShard>>>,
}

impl ProxyWorker {
    fn shard(self: &Rc<Self>, shard_id: ShardId) -> Rc<PerShard> {
        if let Some(shard) = self.shards.borrow().get(&shard_id) {
            return Rc::clone(shard);
        }
        let shard = PerShard::new(&self.ctx, Arc::clone(&self.env), shard_id);
        self.shards
            .borrow_mut()
            .insert(shard_id, Rc::clone(&shard));
        shard
    }

    /// Wire an accepted downstream stream: the session is pinned to the
    /// shard of the first routable message.
    fn on_new_stream(self: &Rc<Self>, stream: Stream, first: Message) {
        let session: Rc<RefCell<Option<Rc<PerStream>>>> = Rc::new(RefCell::new(None));
        let worker = Rc::clone(self);
        let receiver_session = Rc::clone(&session);
        let receiver_stream = stream.clone();
        stream.set_receiver(Box::new(move |flow, event| {
            let existing = receiver_session.borrow().clone();
            match existing {
                Some(per_stream) => per_stream.on_downstream(flow, event),
                None => {
                    if let StreamEvent::Message(message) = event {
                        worker.route_first(&receiver_session, &receiver_stream, flow, message);
                    }
                }
            }
        }));
        let mut flow = petrel_io::Flow::new();
        let worker = Rc::clone(self);
        worker.route_first(&session, &stream, &mut flow, first);
    }

    /// Handle a message on a stream with no session yet. Messages that name
    /// a topic pin the session's shard; pings are answered in place.
    fn route_first(
        self: &Rc<Self>,
        session: &Rc<RefCell<Option<Rc<PerStream>>>>,
        stream: &Stream,
        flow: &mut petrel_io::Flow,
        message: Message,
    ) {
        let topic_key = match &message {
            Message::Subscribe {
                namespace, topic, ..
            }
            | Message::Publish {
                namespace, topic, ..
            }
            | Message::FindTailSeqno {
                namespace, topic, ..
            } => Some((namespace.clone(), topic.clone())),
            Message::Ping { tenant, cookie } => {
                flow.write(
                    stream,
                    Message::Ping {
                        tenant: *tenant,
                        cookie: cookie.clone(),
                    },
                );
                return;
            }
            Message::Goodbye { .. } => {
                stream.close(false);
                return;
            }
            _ => None,
        };
        let Some((namespace, topic)) = topic_key else {
            tracing::debug!(kind = ?message.message_type(), "cannot route session-less message");
            return;
        };
        let shard_id = self.env.sharding.get_shard(&namespace, &topic);
        let shard = self.shard(shard_id);
        let per_stream = PerStream::new(&shard, stream.clone());
        shard.register_session(stream.id(), Rc::clone(&per_stream));
        *session.borrow_mut() = Some(Rc::clone(&per_stream));
        per_stream.on_downstream(flow, StreamEvent::Message(message));
    }
}

pub(crate) fn start(options: ProxyOptions, port: u16) -> Result<ProxyServer, Status> {
    let msg_loop = MsgLoop::spawn("petrel-proxy", options.num_workers, options.io.clone())
        .map_err(|err| Status::io_error(format!("spawn proxy workers: {err}")))?;
    let env = Arc::new(ProxyEnv {
        sharding: Arc::clone(&options.sharding),
        hot_topic: Arc::clone(&options.hot_topic),
        router_poll_period: options.router_poll_period,
        ordering_buffer_size: options.ordering_buffer_size,
        accumulator_bytes: options.accumulator_bytes,
    });

    // Each worker adopts connections pushed onto its channel; the accept
    // loop on worker zero deals them out round-robin.
    let mut adopt_txs = Vec::with_capacity(msg_loop.num_workers());
    for index in 0..msg_loop.num_workers() {
        let (tx, mut rx) = mpsc::channel::<std::net::TcpStream>(64);
        let env = Arc::clone(&env);
        msg_loop.submit_to(index, move |ctx| {
            let worker = Rc::new(ProxyWorker {
                ctx: ctx.clone(),
                env,
                shards: RefCell::new(HashMap::new()),
            });
            let ctx = ctx.clone();
            ctx.clone().spawn(async move {
                while let Some(connection) = rx.recv().await {
                    let worker = Rc::clone(&worker);
                    let adopted = ctx.adopt_inbound(connection, move |_ctx, stream, first| {
                        worker.on_new_stream(stream, first);
                    });
                    if let Err(status) = adopted {
                        tracing::warn!(error = %status, "failed to adopt downstream connection");
                    }
                }
            });
        })?;
        adopt_txs.push(tx);
    }

    let (addr_tx, addr_rx) = std::sync::mpsc::channel();
    msg_loop.submit_to(0, move |ctx| {
        ctx.clone().spawn(async move {
            let listener = match tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => listener,
                Err(err) => {
                    let _ = addr_tx.send(Err(Status::io_error(format!("bind proxy: {err}"))));
                    return;
                }
            };
            let local = listener.local_addr().expect("proxy local addr");
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
        .map_err(|_| Status::timed_out("proxy bind timed out"))??;
    Ok(ProxyServer::assemble(msg_loop, HostId::local(local.port())))
}
