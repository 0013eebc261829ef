// One OS thread driving one loop. Commands cross the thread boundary through
// a bounded queue; everything else stays on the loop.
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use petrel_common::{HostId, Status};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, LocalSet};

use crate::socket::{self, SocketShared};
use crate::stats::LoopStats;
use crate::stream::Stream;
use crate::IoConfig;

pub(crate) type Task = Box<dyn FnOnce(&LoopCtx) + Send + 'static>;

/// Handle to a running event loop. Dropping it stops the loop and joins the
/// thread; sockets and timers owned by the loop are torn down with it.
pub struct EventLoop {
    command_tx: mpsc::Sender<Task>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl EventLoop {
    /// Start a loop thread. The name shows up in thread listings and log
    /// lines from the loop.
    pub fn spawn(name: impl Into<String>, config: IoConfig) -> std::io::Result<EventLoop> {
        let name = name.into();
        let (command_tx, command_rx) = mpsc::channel::<Task>(config.command_queue_size.max(1));
        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_loop(name, config, command_rx))?;
        Ok(EventLoop {
            command_tx,
            thread: Some(thread),
        })
    }

    /// Thread-safe; enqueue a task for the loop thread. Tasks submitted by a
    /// single producer run in FIFO order. Fails with `QueueFull` when the
    /// command queue is at capacity; the caller decides whether to drop or
    /// back off.
    pub fn submit(&self, task: impl FnOnce(&LoopCtx) + Send + 'static) -> Result<(), Status> {
        self.command_tx
            .try_send(Box::new(task))
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => {
                    Status::queue_full("event loop command queue at capacity")
                }
                mpsc::error::TrySendError::Closed(_) => {
                    Status::not_initialized("event loop stopped")
                }
            })
    }

    /// Run a periodic callback on the loop thread. The timer lives until the
    /// loop stops; use `LoopCtx::register_timer` from loop code when the
    /// timer must be cancellable.
    pub fn register_timer(
        &self,
        period: Duration,
        mut callback: impl FnMut(&LoopCtx) + Send + 'static,
    ) -> Result<(), Status> {
        self.submit(move |ctx| {
            let handle = ctx.register_timer(period, move |ctx| callback(ctx));
            handle.detach();
        })
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // Closing the command channel makes the loop's main task return,
        // which drops the LocalSet and every task on it.
        let (closed_tx, _) = mpsc::channel(1);
        let _ = std::mem::replace(&mut self.command_tx, closed_tx);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run_loop(name: String, config: IoConfig, mut command_rx: mpsc::Receiver<Task>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(loop_name = %name, error = %err, "failed to build loop runtime");
            return;
        }
    };
    let local = LocalSet::new();
    let ctx = LoopCtx {
        inner: Rc::new(LoopInner {
            name,
            config,
            stats: Rc::new(LoopStats::default()),
            next_stream_id: Cell::new(1),
            next_inbound_local: Cell::new(1),
            outbound_sockets: RefCell::new(HashMap::new()),
        }),
    };
    local.block_on(&runtime, async move {
        while let Some(task) = command_rx.recv().await {
            ctx.inner.stats.commands.set(ctx.inner.stats.commands.get() + 1);
            task(&ctx);
        }
    });
}

pub(crate) struct LoopInner {
    pub(crate) name: String,
    pub(crate) config: IoConfig,
    pub(crate) stats: Rc<LoopStats>,
    // Wire ids for streams opened from this loop; unique per loop.
    next_stream_id: Cell<u64>,
    // Internal ids for accepted streams.
    next_inbound_local: Cell<u64>,
    pub(crate) outbound_sockets: RefCell<HashMap<HostId, Rc<SocketShared>>>,
}

/// Loop-side context handed to tasks, timers, and stream receivers. `!Send`
/// by construction; everything reachable from it stays on the loop thread.
#[derive(Clone)]
pub struct LoopCtx {
    pub(crate) inner: Rc<LoopInner>,
}

impl LoopCtx {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &IoConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> Rc<LoopStats> {
        Rc::clone(&self.inner.stats)
    }

    /// Spawn a task onto this loop.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        tokio::task::spawn_local(future)
    }

    /// Periodic callback on the loop thread; cancelled when the returned
    /// handle is dropped. Callbacks must not block.
    pub fn register_timer(
        &self,
        period: Duration,
        mut callback: impl FnMut(&LoopCtx) + 'static,
    ) -> TimerHandle {
        let ctx = self.clone();
        let task = self.spawn(async move {
            let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
            // The immediate first tick of `interval` would fire the callback
            // at registration time; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                callback(&ctx);
            }
        });
        TimerHandle { task: Some(task) }
    }

    pub(crate) fn alloc_stream_id(&self) -> u64 {
        let id = self.inner.next_stream_id.get();
        self.inner.next_stream_id.set(id + 1);
        id
    }

    pub(crate) fn alloc_inbound_local(&self) -> u64 {
        let id = self.inner.next_inbound_local.get();
        self.inner.next_inbound_local.set(id + 1);
        id
    }

    /// Open a fresh outbound stream on the pooled socket to `host`,
    /// connecting if no live socket exists.
    pub async fn open_stream(&self, host: &HostId) -> Result<Stream, Status> {
        socket::open_stream(self, host).await
    }

    /// Adopt an accepted TCP connection as an inbound socket on this loop.
    /// `on_stream` runs once per new inbound stream, with its first message.
    pub fn adopt_inbound(
        &self,
        connection: std::net::TcpStream,
        on_stream: impl FnMut(&LoopCtx, Stream, petrel_wire::Message) + 'static,
    ) -> Result<(), Status> {
        socket::adopt_inbound(self, connection, Box::new(on_stream))
    }

    /// Drop `value` on a later loop tick. Used to tear objects down from
    /// callbacks that still hold references into them.
    pub fn defer_drop<T: 'static>(&self, value: T) {
        self.spawn(async move {
            drop(value);
        });
    }
}

#[cfg(test)]
impl LoopCtx {
    /// Bare context for single-threaded tests that drive a `LocalSet`
    /// directly instead of spawning a loop thread.
    pub(crate) fn test_ctx() -> LoopCtx {
        LoopCtx {
            inner: Rc::new(LoopInner {
                name: "test".into(),
                config: IoConfig::default(),
                stats: Rc::new(LoopStats::default()),
                next_stream_id: Cell::new(1),
                next_inbound_local: Cell::new(1),
                outbound_sockets: RefCell::new(HashMap::new()),
            }),
        }
    }
}

/// Cancels its timer when dropped.
pub struct TimerHandle {
    task: Option<JoinHandle<()>>,
}

impl TimerHandle {
    /// Let the timer run for the lifetime of the loop.
    pub fn detach(mut self) {
        self.task.take();
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
