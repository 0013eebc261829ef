// Credit-based backpressure between sources and sinks on one loop.
//
// A sink accepts every item written to it (sinks never silently drop) but
// reports whether it still has room. A source that is told "no room" must
// stop producing until the sink's write trigger is raised again; the
// `register_source` pump enforces exactly that.
use std::cell::Cell;
use std::rc::Rc;

use tokio::sync::mpsc;
use tokio::sync::Notify;

use crate::LoopCtx;

/// Level-triggered signal shared between sources and sinks for credit
/// passing. Raised means "there is room".
#[derive(Clone)]
pub struct EventTrigger {
    inner: Rc<TriggerInner>,
}

struct TriggerInner {
    level: Cell<bool>,
    notify: Notify,
}

impl EventTrigger {
    pub fn new(raised: bool) -> Self {
        EventTrigger {
            inner: Rc::new(TriggerInner {
                level: Cell::new(raised),
                notify: Notify::new(),
            }),
        }
    }

    pub fn raise(&self) {
        if !self.inner.level.replace(true) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn lower(&self) {
        self.inner.level.set(false);
    }

    pub fn is_raised(&self) -> bool {
        self.inner.level.get()
    }

    /// Wait until the trigger is raised. Level-triggered: returns
    /// immediately if it is already up.
    pub async fn raised(&self) {
        loop {
            if self.inner.level.get() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.inner.level.get() {
                return;
            }
            notified.await;
        }
    }

    /// Run `callback` on the loop whenever this trigger is raised. This is
    /// how a sink lets paused upstream sources register for resume events;
    /// dropping the returned handle cancels the registration.
    pub fn on_raise(
        &self,
        ctx: &LoopCtx,
        mut callback: impl FnMut() + 'static,
    ) -> tokio::task::JoinHandle<()> {
        let trigger = self.clone();
        ctx.spawn(async move {
            loop {
                trigger.raised().await;
                callback();
                trigger.next_edge().await;
            }
        })
    }

    /// Wait for the next raise notification, regardless of current level.
    async fn next_edge(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        notified.await;
    }
}

/// Anything that consumes items from a source on the same loop.
pub trait Sink<T> {
    /// Accept `item`. Returns false when the sink is past its limit and the
    /// caller should pause until `write_trigger` is raised.
    fn write(&self, item: T) -> bool;

    /// Trigger raised whenever the sink has room again.
    fn write_trigger(&self) -> EventTrigger;
}

/// Per-delivery flow handle passed to handlers. Collects the triggers of
/// every sink that reported "no room" so the pump can park the source on
/// them.
pub struct Flow {
    blocked_on: Vec<EventTrigger>,
}

impl Flow {
    pub fn new() -> Self {
        Flow {
            blocked_on: Vec::new(),
        }
    }

    pub fn write<T>(&mut self, sink: &dyn Sink<T>, item: T) -> bool {
        let has_room = sink.write(item);
        if !has_room {
            self.blocked_on.push(sink.write_trigger());
        }
        has_room
    }

    pub fn is_blocked(&self) -> bool {
        !self.blocked_on.is_empty()
    }

    /// Wait until every sink hit during this delivery has room again.
    pub async fn wait_ready(&mut self) {
        for trigger in self.blocked_on.drain(..) {
            trigger.raised().await;
        }
    }
}

impl Default for Flow {
    fn default() -> Self {
        Flow::new()
    }
}

/// Flow for teardown paths with no upstream to pause: writes are
/// best-effort and overflow is allowed to drop on the floor.
pub struct SourcelessFlow;

impl SourcelessFlow {
    pub fn write<T>(&self, sink: &dyn Sink<T>, item: T) {
        let _ = sink.write(item);
    }
}

/// Register a source on the loop: a pump task pulls items and hands them to
/// `handler` with a fresh `Flow`. When a delivery leaves a sink without
/// room, the pump stops pulling until that sink's trigger is raised, which
/// is what keeps a slow consumer from being buried.
pub fn register_source<T: 'static>(
    ctx: &LoopCtx,
    mut source: mpsc::Receiver<T>,
    mut handler: impl FnMut(&mut Flow, T) + 'static,
) -> tokio::task::JoinHandle<()> {
    ctx.spawn(async move {
        while let Some(item) = source.recv().await {
            let mut flow = Flow::new();
            handler(&mut flow, item);
            flow.wait_ready().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::time::Duration;

    // Toy sink with a fixed capacity and manual drain, for pump tests.
    #[derive(Clone)]
    struct TestSink {
        items: Rc<RefCell<Vec<u32>>>,
        capacity: usize,
        trigger: EventTrigger,
    }

    impl TestSink {
        fn new(capacity: usize) -> Self {
            TestSink {
                items: Rc::new(RefCell::new(Vec::new())),
                capacity,
                trigger: EventTrigger::new(true),
            }
        }

        fn drain(&self) -> Vec<u32> {
            let drained = self.items.borrow_mut().split_off(0);
            self.trigger.raise();
            drained
        }
    }

    impl Sink<u32> for TestSink {
        fn write(&self, item: u32) -> bool {
            let mut items = self.items.borrow_mut();
            items.push(item);
            let has_room = items.len() < self.capacity;
            if !has_room {
                self.trigger.lower();
            }
            has_room
        }

        fn write_trigger(&self) -> EventTrigger {
            self.trigger.clone()
        }
    }

    #[tokio::test]
    async fn trigger_is_level_triggered() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let trigger = EventTrigger::new(true);
                trigger.raised().await; // must not hang
                trigger.lower();
                let waiter = {
                    let trigger = trigger.clone();
                    tokio::task::spawn_local(async move {
                        trigger.raised().await;
                    })
                };
                tokio::time::sleep(Duration::from_millis(10)).await;
                assert!(!waiter.is_finished());
                trigger.raise();
                tokio::time::timeout(Duration::from_secs(1), waiter)
                    .await
                    .expect("woken")
                    .expect("join");
            })
            .await;
    }

    #[test]
    fn on_raise_fires_once_per_rising_edge() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");
        let local = tokio::task::LocalSet::new();
        local.block_on(&runtime, async {
            let ctx = LoopCtx::test_ctx();
            let trigger = EventTrigger::new(false);
            let fires = Rc::new(Cell::new(0usize));
            let fires_clone = Rc::clone(&fires);
            let handle = trigger.on_raise(&ctx, move || {
                fires_clone.set(fires_clone.get() + 1);
            });

            tokio::time::sleep(Duration::from_millis(5)).await;
            assert_eq!(fires.get(), 0);

            trigger.raise();
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert_eq!(fires.get(), 1);

            // Raising an already-high trigger is not a new edge.
            trigger.raise();
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert_eq!(fires.get(), 1);

            trigger.lower();
            trigger.raise();
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert_eq!(fires.get(), 2);
            handle.abort();
        });
    }

    #[test]
    fn source_pauses_on_full_sink_and_resumes() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");
        let local = tokio::task::LocalSet::new();
        local.block_on(&runtime, async {
            let ctx = LoopCtx::test_ctx();
            let sink = TestSink::new(2);
            let delivered = Rc::new(Cell::new(0usize));
            let (tx, rx) = mpsc::channel::<u32>(64);

            let handler_sink = sink.clone();
            let handler_delivered = Rc::clone(&delivered);
            register_source(&ctx, rx, move |flow, item| {
                flow.write(&handler_sink, item);
                handler_delivered.set(handler_delivered.get() + 1);
            });

            for i in 0..10u32 {
                tx.send(i).await.expect("send");
            }

            // Capacity two: the pump must stall after the second delivery.
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_eq!(delivered.get(), 2);

            // Draining raises the trigger; the pump proceeds two more.
            assert_eq!(sink.drain(), vec![0, 1]);
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_eq!(delivered.get(), 4);

            // And again until the queue is exhausted.
            assert_eq!(sink.drain(), vec![2, 3]);
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_eq!(delivered.get(), 6);
        });
    }
}
