// One TCP connection carrying many logical streams.
//
// Each socket owns exactly two I/O tasks: a reader that frames inbound bytes
// and dispatches them to stream receivers, and a single writer that drains
// the send queue with bounded vectored writes. Nothing else touches the
// connection. Teardown is cooperative: a watch flag stops both tasks, and
// every local stream observes one synthesized `Goodbye(SocketError)`.
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io::IoSlice;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes};
use petrel_common::{HostId, Status, TenantId};
use petrel_wire::{decode_frame_body, encode_frame, FrameHeader, GoodbyeCode, Message};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};

use crate::event_loop::{LoopCtx, LoopInner};
use crate::flow::{EventTrigger, Flow};
use crate::stats::LoopStats;
use crate::stream::{Stream, StreamEvent, StreamReceiver};
use crate::{IoConfig, MAX_IOVECS, READ_BUDGET_BYTES};

/// Why a socket went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Graceful,
    Error,
}

pub(crate) type OnStream = Box<dyn FnMut(&LoopCtx, Stream, Message) + 'static>;

enum Direction {
    Outbound { host: HostId },
    Inbound { on_stream: RefCell<OnStream> },
}

struct StreamSlot {
    receiver: Option<StreamReceiver>,
    healthy: bool,
    last_seen: Instant,
    /// Loop-local id for accepted streams; the wire id belongs to the peer.
    local_id: u64,
}

struct SocketState {
    streams: HashMap<u64, StreamSlot>,
    send_queue: VecDeque<Bytes>,
    queued_bytes: usize,
    closed: bool,
}

pub(crate) struct SocketShared {
    config: IoConfig,
    stats: Rc<LoopStats>,
    loop_inner: Weak<LoopInner>,
    direction: Direction,
    state: RefCell<SocketState>,
    write_trigger: EventTrigger,
    writer_wake: Notify,
    closed_tx: watch::Sender<bool>,
}

impl SocketShared {
    fn new(ctx: &LoopCtx, direction: Direction) -> Rc<SocketShared> {
        let (closed_tx, _) = watch::channel(false);
        Rc::new(SocketShared {
            config: ctx.config().clone(),
            stats: ctx.stats(),
            loop_inner: Rc::downgrade(&ctx.inner),
            direction,
            state: RefCell::new(SocketState {
                streams: HashMap::new(),
                send_queue: VecDeque::new(),
                queued_bytes: 0,
                closed: false,
            }),
            write_trigger: EventTrigger::new(true),
            writer_wake: Notify::new(),
            closed_tx,
        })
    }

    fn is_outbound(&self) -> bool {
        matches!(self.direction, Direction::Outbound { .. })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    pub(crate) fn write_trigger(&self) -> EventTrigger {
        self.write_trigger.clone()
    }

    pub(crate) fn has_stream(&self, wire_id: u64) -> bool {
        self.state.borrow().streams.contains_key(&wire_id)
    }

    fn add_stream(&self, ctx: &LoopCtx, wire_id: u64) {
        let local_id = ctx.alloc_inbound_local();
        tracing::trace!(wire_id, local_id, "stream added");
        let mut state = self.state.borrow_mut();
        state.streams.insert(
            wire_id,
            StreamSlot {
                receiver: None,
                healthy: true,
                last_seen: Instant::now(),
                local_id,
            },
        );
        LoopStats::bump(&self.stats.streams_opened);
    }

    pub(crate) fn set_receiver(&self, wire_id: u64, receiver: StreamReceiver) {
        if let Some(slot) = self.state.borrow_mut().streams.get_mut(&wire_id) {
            slot.receiver = Some(receiver);
        }
    }

    /// Queue a message on a stream. Returns whether the socket still has
    /// room; the message is queued either way.
    pub(crate) fn send_on_stream(self: &Rc<Self>, wire_id: u64, message: &Message) -> bool {
        {
            let state = self.state.borrow();
            if state.closed {
                return true;
            }
        }
        // User-level heartbeats on an inbound socket fold into the periodic
        // aggregate instead of hitting the wire individually.
        if let (Message::Heartbeat { .. }, Direction::Inbound { .. }) = (message, &self.direction) {
            if let Some(slot) = self.state.borrow_mut().streams.get_mut(&wire_id) {
                slot.healthy = true;
            }
            return true;
        }
        self.enqueue_frame(wire_id, message)
    }

    fn enqueue_frame(self: &Rc<Self>, wire_id: u64, message: &Message) -> bool {
        let frame = match encode_frame(wire_id, message) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::error!(stream = wire_id, error = %err, "failed to encode frame");
                return true;
            }
        };
        let mut state = self.state.borrow_mut();
        if state.closed {
            return true;
        }
        state.queued_bytes += frame.len();
        state.send_queue.push_back(frame);
        if state.queued_bytes > self.config.send_queue_limit_bytes {
            self.write_trigger.lower();
        }
        drop(state);
        LoopStats::bump(&self.stats.messages_sent);
        self.writer_wake.notify_one();
        self.write_trigger.is_raised()
    }

    pub(crate) fn close_stream(self: &Rc<Self>, wire_id: u64, graceful: bool) {
        let closed = self.state.borrow().closed;
        if graceful && !closed {
            self.enqueue_frame(
                wire_id,
                &Message::Goodbye {
                    tenant: TenantId::SYSTEM,
                    code: GoodbyeCode::Graceful,
                },
            );
        }
        self.remove_stream(wire_id);
    }

    fn remove_stream(self: &Rc<Self>, wire_id: u64) {
        let removed = self.state.borrow_mut().streams.remove(&wire_id);
        if removed.is_some() {
            LoopStats::bump(&self.stats.streams_closed);
            self.maybe_close_when_empty();
        }
    }

    /// Outbound sockets close once their last stream is gone, either right
    /// away or after the configured keepalive.
    fn maybe_close_when_empty(self: &Rc<Self>) {
        if !self.is_outbound() {
            return;
        }
        {
            let state = self.state.borrow();
            if state.closed || !state.streams.is_empty() {
                return;
            }
        }
        let keepalive = self.config.connection_without_streams_keepalive;
        if keepalive.is_zero() {
            self.close(CloseReason::Graceful);
        } else {
            let weak = Rc::downgrade(self);
            tokio::task::spawn_local(async move {
                tokio::time::sleep(keepalive).await;
                if let Some(socket) = weak.upgrade() {
                    let still_empty = {
                        let state = socket.state.borrow();
                        !state.closed && state.streams.is_empty()
                    };
                    if still_empty {
                        socket.close(CloseReason::Graceful);
                    }
                }
            });
        }
    }

    /// Tear the socket down. Every stream that still has a receiver gets a
    /// synthesized `Goodbye(SocketError)` so upper layers observe a single
    /// uniform termination signal.
    pub(crate) fn close(self: &Rc<Self>, reason: CloseReason) {
        let slots: Vec<(u64, StreamSlot)> = {
            let mut state = self.state.borrow_mut();
            if state.closed {
                return;
            }
            state.closed = true;
            state.send_queue.clear();
            state.queued_bytes = 0;
            state.streams.drain().collect()
        };
        let _ = self.closed_tx.send(true);
        // Unpark anything waiting for queue room; the streams are gone.
        self.write_trigger.raise();
        LoopStats::bump(&self.stats.sockets_closed);
        if let Direction::Outbound { host } = &self.direction {
            if let Some(inner) = self.loop_inner.upgrade() {
                let mut sockets = inner.outbound_sockets.borrow_mut();
                if let Some(current) = sockets.get(host) {
                    if Rc::ptr_eq(current, self) {
                        sockets.remove(host);
                    }
                }
            }
            if reason == CloseReason::Error {
                tracing::warn!(host = %host, "socket closed on error");
            }
        }
        for (wire_id, mut slot) in slots {
            LoopStats::bump(&self.stats.streams_closed);
            tracing::trace!(wire_id, local_id = slot.local_id, "stream torn down with socket");
            if let Some(receiver) = slot.receiver.as_mut() {
                // Teardown delivery: there is no upstream to pause, so any
                // backpressure reported here is dropped on the floor.
                let mut flow = Flow::new();
                receiver(
                    &mut flow,
                    StreamEvent::Message(Message::Goodbye {
                        tenant: TenantId::SYSTEM,
                        code: match reason {
                            CloseReason::Graceful => GoodbyeCode::Graceful,
                            CloseReason::Error => GoodbyeCode::SocketError,
                        },
                    }),
                );
            }
            let _ = wire_id;
        }
    }

    fn take_receiver(&self, wire_id: u64) -> Option<StreamReceiver> {
        self.state
            .borrow_mut()
            .streams
            .get_mut(&wire_id)
            .and_then(|slot| slot.receiver.take())
    }

    fn restore_receiver(&self, wire_id: u64, receiver: StreamReceiver) {
        if let Some(slot) = self.state.borrow_mut().streams.get_mut(&wire_id) {
            if slot.receiver.is_none() {
                slot.receiver = Some(receiver);
            }
        }
    }
}

/// Deliver one event to a stream's receiver, honoring any backpressure the
/// handler reported before returning to the caller.
async fn deliver_event(shared: &Rc<SocketShared>, wire_id: u64, event: StreamEvent) {
    let Some(mut receiver) = shared.take_receiver(wire_id) else {
        tracing::debug!(stream = wire_id, "event for stream without receiver");
        return;
    };
    let mut flow = Flow::new();
    receiver(&mut flow, event);
    shared.restore_receiver(wire_id, receiver);
    flow.wait_ready().await;
}

/// Open (or reuse) the outbound socket to `host` and add a fresh stream.
pub(crate) async fn open_stream(ctx: &LoopCtx, host: &HostId) -> Result<Stream, Status> {
    let existing = ctx.inner.outbound_sockets.borrow().get(host).cloned();
    let socket = match existing {
        Some(socket) if !socket.is_closed() => socket,
        _ => connect(ctx, host).await?,
    };
    let wire_id = ctx.alloc_stream_id();
    socket.add_stream(ctx, wire_id);
    Ok(Stream {
        socket,
        wire_id,
    })
}

async fn connect(ctx: &LoopCtx, host: &HostId) -> Result<Rc<SocketShared>, Status> {
    let tcp = TcpStream::connect((host.hostname(), host.port()))
        .await
        .map_err(|err| Status::io_error(format!("connect {host}: {err}")))?;
    let _ = tcp.set_nodelay(true);
    // Another task may have connected while we awaited; prefer the socket
    // that made it into the pool first.
    if let Some(existing) = ctx.inner.outbound_sockets.borrow().get(host).cloned() {
        if !existing.is_closed() {
            return Ok(existing);
        }
    }
    let shared = spawn_socket(
        ctx,
        tcp,
        Direction::Outbound { host: host.clone() },
    );
    ctx.inner
        .outbound_sockets
        .borrow_mut()
        .insert(host.clone(), Rc::clone(&shared));
    Ok(shared)
}

/// Adopt an accepted connection as an inbound socket on this loop.
pub(crate) fn adopt_inbound(
    ctx: &LoopCtx,
    connection: std::net::TcpStream,
    on_stream: OnStream,
) -> Result<(), Status> {
    connection
        .set_nonblocking(true)
        .map_err(|err| Status::io_error(format!("set_nonblocking: {err}")))?;
    let tcp = TcpStream::from_std(connection)
        .map_err(|err| Status::io_error(format!("adopt connection: {err}")))?;
    let _ = tcp.set_nodelay(true);
    spawn_socket(
        ctx,
        tcp,
        Direction::Inbound {
            on_stream: RefCell::new(on_stream),
        },
    );
    Ok(())
}

fn spawn_socket(ctx: &LoopCtx, tcp: TcpStream, direction: Direction) -> Rc<SocketShared> {
    let (read_half, write_half) = tcp.into_split();
    let shared = SocketShared::new(ctx, direction);
    LoopStats::bump(&shared.stats.sockets_opened);

    let reader_shared = Rc::clone(&shared);
    let reader_ctx = ctx.clone();
    let reader_closed = shared.closed_tx.subscribe();
    ctx.spawn(async move {
        reader_task(reader_shared, reader_ctx, read_half, reader_closed).await;
    });

    let writer_shared = Rc::clone(&shared);
    let writer_closed = shared.closed_tx.subscribe();
    ctx.spawn(async move {
        writer_task(writer_shared, write_half, writer_closed).await;
    });

    let timer_shared = Rc::downgrade(&shared);
    let timer_closed = shared.closed_tx.subscribe();
    match &shared.direction {
        Direction::Inbound { .. } => {
            ctx.spawn(async move {
                heartbeat_task(timer_shared, timer_closed).await;
            });
        }
        Direction::Outbound { .. } => {
            ctx.spawn(async move {
                timeout_scan_task(timer_shared, timer_closed).await;
            });
        }
    }
    shared
}

async fn reader_task(
    shared: Rc<SocketShared>,
    ctx: LoopCtx,
    mut read_half: OwnedReadHalf,
    mut closed: watch::Receiver<bool>,
) {
    let work = async {
        let mut budget = 0usize;
        let mut header = [0u8; FrameHeader::LEN];
        loop {
            read_half
                .read_exact(&mut header)
                .await
                .map_err(|err| format!("read header: {err}"))?;
            let frame_header =
                FrameHeader::decode(&header).map_err(|err| format!("bad header: {err}"))?;
            let mut body = vec![0u8; frame_header.size as usize];
            read_half
                .read_exact(&mut body)
                .await
                .map_err(|err| format!("read body: {err}"))?;
            budget += FrameHeader::LEN + body.len();
            let (stream_id, message) = decode_frame_body(Bytes::from(body))
                .map_err(|err| format!("bad frame: {err}"))?;
            LoopStats::bump(&shared.stats.messages_received);
            dispatch_message(&shared, &ctx, stream_id, message).await;
            if shared.is_closed() {
                return Ok::<(), String>(());
            }
            // Cap how much one connection consumes per wakeup so other fds
            // on the loop get a turn.
            if budget >= READ_BUDGET_BYTES {
                budget = 0;
                tokio::task::yield_now().await;
            }
        }
    };
    tokio::select! {
        _ = closed.changed() => {}
        result = work => {
            if let Err(reason) = result {
                tracing::debug!(reason, "socket read failed");
                shared.close(CloseReason::Error);
            }
        }
    }
}

async fn dispatch_message(
    shared: &Rc<SocketShared>,
    ctx: &LoopCtx,
    stream_id: u64,
    message: Message,
) {
    match message {
        Message::Heartbeat {
            healthy_streams, ..
        } => {
            for id in healthy_streams {
                mark_stream_seen(shared, id).await;
            }
        }
        Message::Goodbye { .. } => {
            deliver_event(shared, stream_id, StreamEvent::Message(message)).await;
            shared.remove_stream(stream_id);
        }
        message => {
            let known = shared.state.borrow().streams.contains_key(&stream_id);
            if known {
                mark_stream_seen(shared, stream_id).await;
                deliver_event(shared, stream_id, StreamEvent::Message(message)).await;
            } else if let Direction::Inbound { on_stream } = &shared.direction {
                shared.add_stream(ctx, stream_id);
                let stream = Stream {
                    socket: Rc::clone(shared),
                    wire_id: stream_id,
                };
                let mut handler = on_stream.borrow_mut();
                handler(ctx, stream, message);
            } else {
                tracing::debug!(stream = stream_id, "message for unknown outbound stream");
            }
        }
    }
}

/// Refresh liveness on a stream; flips it back to healthy if a timeout scan
/// had marked it down.
async fn mark_stream_seen(shared: &Rc<SocketShared>, stream_id: u64) {
    let recovered = {
        let mut state = shared.state.borrow_mut();
        match state.streams.get_mut(&stream_id) {
            Some(slot) => {
                slot.last_seen = Instant::now();
                !std::mem::replace(&mut slot.healthy, true)
            }
            None => false,
        }
    };
    if recovered {
        deliver_event(shared, stream_id, StreamEvent::Health(true)).await;
    }
}

async fn writer_task(
    shared: Rc<SocketShared>,
    mut write_half: OwnedWriteHalf,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        let chunk: Vec<Bytes> = {
            let state = shared.state.borrow();
            if state.closed {
                return;
            }
            state
                .send_queue
                .iter()
                .take(MAX_IOVECS)
                .cloned()
                .collect()
        };
        if chunk.is_empty() {
            tokio::select! {
                _ = closed.changed() => return,
                _ = shared.writer_wake.notified() => continue,
            }
        }
        let slices: Vec<IoSlice<'_>> = chunk.iter().map(|buf| IoSlice::new(buf)).collect();
        let written = tokio::select! {
            _ = closed.changed() => return,
            result = write_half.write_vectored(&slices) => match result {
                Ok(0) | Err(_) => {
                    shared.close(CloseReason::Error);
                    return;
                }
                Ok(written) => written,
            }
        };
        consume_sent(&shared, written);
    }
}

/// Drop `written` bytes off the front of the send queue, tracking partial
/// progress on the head buffer, and hand credit back at the low watermark.
fn consume_sent(shared: &Rc<SocketShared>, mut written: usize) {
    let mut state = shared.state.borrow_mut();
    state.queued_bytes = state.queued_bytes.saturating_sub(written);
    while written > 0 {
        let Some(front) = state.send_queue.front_mut() else {
            break;
        };
        if front.len() <= written {
            written -= front.len();
            state.send_queue.pop_front();
        } else {
            front.advance(written);
            written = 0;
        }
    }
    if !shared.write_trigger.is_raised()
        && state.queued_bytes <= shared.config.send_queue_limit_bytes / 2
    {
        drop(state);
        shared.write_trigger.raise();
    }
}

/// Inbound side: aggregate the healthy local stream ids into one periodic
/// heartbeat instead of writing them individually.
async fn heartbeat_task(shared: Weak<SocketShared>, mut closed: watch::Receiver<bool>) {
    let period = match shared.upgrade() {
        Some(socket) => socket.config.heartbeat_period,
        None => return,
    };
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(10)));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = closed.changed() => return,
            _ = ticker.tick() => {}
        }
        let Some(socket) = shared.upgrade() else {
            return;
        };
        let healthy: Vec<u64> = {
            let state = socket.state.borrow();
            if state.closed {
                return;
            }
            state
                .streams
                .iter()
                .filter(|(_, slot)| slot.healthy)
                .map(|(id, _)| *id)
                .collect()
        };
        if healthy.is_empty() {
            continue;
        }
        // Stream id zero is never allocated; the receiving socket consumes
        // heartbeats before stream routing.
        socket.enqueue_frame(
            0,
            &Message::Heartbeat {
                tenant: TenantId::SYSTEM,
                healthy_streams: healthy,
            },
        );
    }
}

/// Outbound side: scan the per-stream timeout list and tick unhealthy any
/// stream unseen for longer than the heartbeat timeout.
async fn timeout_scan_task(shared: Weak<SocketShared>, mut closed: watch::Receiver<bool>) {
    let (timeout, period) = match shared.upgrade() {
        Some(socket) => (
            socket.config.heartbeat_timeout,
            socket.config.heartbeat_timeout / 10,
        ),
        None => return,
    };
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(10)));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = closed.changed() => return,
            _ = ticker.tick() => {}
        }
        let Some(socket) = shared.upgrade() else {
            return;
        };
        let now = Instant::now();
        let stale: Vec<u64> = {
            let mut state = socket.state.borrow_mut();
            if state.closed {
                return;
            }
            state
                .streams
                .iter_mut()
                .filter(|(_, slot)| slot.healthy && now.duration_since(slot.last_seen) > timeout)
                .map(|(id, slot)| {
                    slot.healthy = false;
                    *id
                })
                .collect()
        };
        for id in stale {
            deliver_event(&socket, id, StreamEvent::Health(false)).await;
        }
    }
}
