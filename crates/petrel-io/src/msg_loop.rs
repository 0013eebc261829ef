// Fixed pool of worker loops. Work is pinned to a worker by a stable hash
// of the topic, so everything touching one topic runs on one thread and
// worker state needs no locks.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use petrel_common::hash::topic_hash;
use petrel_common::Status;

use crate::event_loop::{EventLoop, LoopCtx};
use crate::IoConfig;

pub struct MsgLoop {
    workers: Vec<EventLoop>,
}

impl MsgLoop {
    pub fn spawn(
        name_prefix: &str,
        num_workers: usize,
        config: IoConfig,
    ) -> std::io::Result<MsgLoop> {
        let num_workers = num_workers.max(1);
        let mut workers = Vec::with_capacity(num_workers);
        for index in 0..num_workers {
            workers.push(EventLoop::spawn(
                format!("{name_prefix}-{index}"),
                config.clone(),
            )?);
        }
        Ok(MsgLoop { workers })
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Deterministic worker assignment for a topic.
    pub fn worker_for_topic(&self, topic: &str) -> usize {
        (topic_hash(topic) % self.workers.len() as u64) as usize
    }

    pub fn submit_to(
        &self,
        worker: usize,
        task: impl FnOnce(&LoopCtx) + Send + 'static,
    ) -> Result<(), Status> {
        match self.workers.get(worker) {
            Some(event_loop) => event_loop.submit(task),
            None => Err(Status::invalid_argument(format!(
                "worker {worker} out of range ({} workers)",
                self.workers.len()
            ))),
        }
    }

    /// Run `task` on every worker.
    pub fn broadcast(&self, task: impl Fn(&LoopCtx) + Send + Sync + 'static) -> Result<(), Status> {
        let task = Arc::new(task);
        for worker in 0..self.workers.len() {
            let task = Arc::clone(&task);
            self.submit_to(worker, move |ctx| task(ctx))?;
        }
        Ok(())
    }

    /// Fan `map` out to every worker, collect one result per worker, and
    /// invoke `reduce` once with all of them. `reduce` runs on the worker
    /// that finishes last.
    pub fn gather<R, M, F>(&self, map: M, reduce: F) -> Result<(), Status>
    where
        R: Send + 'static,
        M: Fn(&LoopCtx) -> R + Send + Sync + 'static,
        F: FnOnce(Vec<R>) + Send + 'static,
    {
        let num_workers = self.workers.len();
        let map = Arc::new(map);
        let results: Arc<Mutex<Vec<Option<R>>>> =
            Arc::new(Mutex::new((0..num_workers).map(|_| None).collect()));
        let remaining = Arc::new(AtomicUsize::new(num_workers));
        let reduce = Arc::new(Mutex::new(Some(reduce)));

        for worker in 0..num_workers {
            let map = Arc::clone(&map);
            let results = Arc::clone(&results);
            let remaining = Arc::clone(&remaining);
            let reduce = Arc::clone(&reduce);
            self.submit_to(worker, move |ctx| {
                let value = map(ctx);
                results.lock().expect("gather results")[worker] = Some(value);
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let collected: Vec<R> = results
                        .lock()
                        .expect("gather results")
                        .iter_mut()
                        .map(|slot| slot.take().expect("gather slot"))
                        .collect();
                    if let Some(reduce) = reduce.lock().expect("gather reduce").take() {
                        reduce(collected);
                    }
                }
            })?;
        }
        Ok(())
    }

    /// Post `request` to a worker and block for its result. Only callable
    /// from outside loop threads; a loop calling this would deadlock on
    /// itself, which is why callbacks must use `submit` instead.
    pub fn request_sync<R: Send + 'static>(
        &self,
        worker: usize,
        request: impl FnOnce(&LoopCtx) -> R + Send + 'static,
        timeout: Duration,
    ) -> Result<R, Status> {
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        self.submit_to(worker, move |ctx| {
            let _ = tx.send(request(ctx));
        })?;
        rx.recv_timeout(timeout)
            .map_err(|_| Status::timed_out("worker request timed out"))
    }

    pub fn worker(&self, index: usize) -> Option<&EventLoop> {
        self.workers.get(index)
    }

    /// Aggregate every worker's counters into one snapshot.
    pub fn gather_stats(
        &self,
        reduce: impl FnOnce(crate::StatsSnapshot) + Send + 'static,
    ) -> Result<(), Status> {
        self.gather(
            |ctx| ctx.stats().snapshot(),
            move |snapshots| {
                let total = snapshots
                    .into_iter()
                    .fold(crate::StatsSnapshot::default(), crate::StatsSnapshot::merge);
                reduce(total);
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize) -> MsgLoop {
        MsgLoop::spawn("test-pool", n, IoConfig::default()).expect("spawn pool")
    }

    #[test]
    fn topic_assignment_is_stable() {
        let pool = pool(4);
        let worker = pool.worker_for_topic("orders");
        for _ in 0..10 {
            assert_eq!(pool.worker_for_topic("orders"), worker);
        }
        assert!(worker < 4);
    }

    #[test]
    fn gather_collects_one_result_per_worker() {
        let pool = pool(3);
        let (tx, rx) = std::sync::mpsc::channel();
        pool.gather(
            |ctx| ctx.name().to_string(),
            move |names| {
                tx.send(names).expect("send");
            },
        )
        .expect("gather");
        let mut names = rx.recv_timeout(Duration::from_secs(5)).expect("reduce ran");
        names.sort();
        assert_eq!(names, vec!["test-pool-0", "test-pool-1", "test-pool-2"]);
    }

    #[test]
    fn request_sync_returns_value() {
        let pool = pool(2);
        let value = pool
            .request_sync(1, |ctx| ctx.name().to_string(), Duration::from_secs(5))
            .expect("request");
        assert_eq!(value, "test-pool-1");
    }

    #[test]
    fn request_sync_times_out_on_stuck_worker() {
        let pool = pool(1);
        let (block_tx, block_rx) = std::sync::mpsc::channel::<()>();
        pool.submit_to(0, move |_ctx| {
            let _ = block_rx.recv();
        })
        .expect("submit blocker");
        let result = pool.request_sync(0, |_ctx| 42, Duration::from_millis(50));
        assert_eq!(
            result.expect_err("should time out").code(),
            petrel_common::StatusCode::TimedOut
        );
        block_tx.send(()).expect("unblock");
    }

    #[test]
    fn gather_stats_sums_worker_counters() {
        let pool = pool(3);
        // One command per worker has run by the time the reduce executes.
        let (tx, rx) = std::sync::mpsc::channel();
        pool.gather_stats(move |total| {
            tx.send(total).expect("send");
        })
        .expect("gather stats");
        let total = rx.recv_timeout(Duration::from_secs(5)).expect("snapshot");
        assert!(total.commands >= 3, "saw {} commands", total.commands);
    }

    #[test]
    fn broadcast_reaches_every_worker() {
        let pool = pool(4);
        let (tx, rx) = std::sync::mpsc::channel();
        let tx = Mutex::new(tx);
        pool.broadcast(move |ctx| {
            tx.lock()
                .expect("sender lock")
                .send(ctx.name().to_string())
                .expect("send");
        })
        .expect("broadcast");
        let mut names: Vec<String> = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).expect("recv"))
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec!["test-pool-0", "test-pool-1", "test-pool-2", "test-pool-3"]
        );
    }
}
