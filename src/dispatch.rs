// Bounded dispatcher for blocking backend calls
//
// A fixed set of named OS threads drains one unbounded FIFO queue. Callers on
// the async side await a oneshot, so their runtime worker is free while the
// job runs. The pool is created once; after shutdown new submissions fail and
// queued jobs still run to completion.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::errors::DispatchError;
use crate::metrics::Metrics;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub const DEFAULT_THREAD_PREFIX: &str = "db-dispatcher";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub pool_size: usize,
    pub busy_workers: usize,
    pub queued_jobs: usize,
    pub shut_down: bool,
}

#[derive(Default)]
struct Counters {
    queued: AtomicUsize,
    busy: AtomicUsize,
}

struct Pool {
    sender: RwLock<Option<Sender<Job>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl Pool {
    /// Pool with no threads that refuses every submission.
    fn closed() -> Self {
        Self {
            sender: RwLock::new(None),
            threads: Mutex::new(Vec::new()),
            size: 0,
        }
    }
}

pub struct BoundedDispatcher {
    pool: OnceCell<Pool>,
    default_size: usize,
    thread_prefix: String,
    counters: Arc<Counters>,
    shut_down: AtomicBool,
    metrics: Option<Metrics>,
}

impl BoundedDispatcher {
    pub fn new(default_size: usize, metrics: Option<Metrics>) -> Self {
        Self {
            pool: OnceCell::new(),
            default_size: default_size.max(1),
            thread_prefix: DEFAULT_THREAD_PREFIX.to_string(),
            counters: Arc::new(Counters::default()),
            shut_down: AtomicBool::new(false),
            metrics,
        }
    }

    pub fn with_thread_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_prefix = prefix.into();
        self
    }

    /// Create the pool with `size` threads. Returns false (and changes
    /// nothing) if the pool already exists.
    pub fn init(&self, size: usize) -> bool {
        let mut created = false;
        let pool = self.pool.get_or_init(|| {
            created = true;
            self.spawn_pool(size.max(1))
        });
        if !created {
            warn!(
                requested = size,
                existing = pool.size,
                "dispatcher already initialized; ignoring"
            );
        }
        created
    }

    fn pool(&self) -> &Pool {
        self.pool.get_or_init(|| {
            // a submission that raced with shutdown must not start threads
            if self.shut_down.load(Ordering::Acquire) {
                return Pool::closed();
            }
            warn!(
                pool_size = self.default_size,
                "dispatcher used before init; creating default pool"
            );
            self.spawn_pool(self.default_size)
        })
    }

    fn spawn_pool(&self, size: usize) -> Pool {
        let (tx, rx) = unbounded::<Job>();
        let mut threads = Vec::with_capacity(size);
        for i in 1..=size {
            let rx = rx.clone();
            let counters = Arc::clone(&self.counters);
            let metrics = self.metrics.clone();
            let name = format!("{}-{}", self.thread_prefix, i);
            match thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(rx, counters, metrics))
            {
                Ok(handle) => threads.push(handle),
                Err(err) => error!(thread = %name, error = %err, "failed to spawn dispatcher thread"),
            }
        }
        info!(pool_size = threads.len(), prefix = %self.thread_prefix, "dispatcher started");
        Pool {
            sender: RwLock::new(Some(tx)),
            size: threads.len(),
            threads: Mutex::new(threads),
        }
    }

    /// Run `job` on a dispatcher thread and await its result.
    pub async fn run<F, T>(&self, job: F) -> Result<T, DispatchError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(DispatchError::ShutDown);
        }
        let (tx, rx) = oneshot::channel();
        self.submit(Box::new(move || {
            // receiver gone means the caller stopped waiting
            let _ = tx.send(job());
        }))?;
        rx.await.map_err(|_| DispatchError::WorkerLost)
    }

    fn submit(&self, job: Job) -> Result<(), DispatchError> {
        let pool = self.pool();
        let sender = pool.sender.read();
        let Some(sender) = sender.as_ref() else {
            return Err(DispatchError::ShutDown);
        };
        self.counters.queued.fetch_add(1, Ordering::AcqRel);
        if let Some(m) = &self.metrics {
            m.dispatcher_queue_depth.inc();
        }
        if sender.send(job).is_err() {
            self.counters.queued.fetch_sub(1, Ordering::AcqRel);
            if let Some(m) = &self.metrics {
                m.dispatcher_queue_depth.dec();
            }
            return Err(DispatchError::ShutDown);
        }
        Ok(())
    }

    /// Stop accepting work. Queued and running jobs finish; this call waits
    /// for every worker thread to exit.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        // waits for an init in progress, so that pool is drained too
        let pool = self.pool.get_or_init(|| {
            info!("dispatcher shut down before first use");
            Pool::closed()
        });
        pool.sender.write().take();
        let handles: Vec<_> = pool.threads.lock().drain(..).collect();
        let pending = self.counters.queued.load(Ordering::Acquire);
        info!(pending, "dispatcher draining");
        for handle in handles {
            if handle.join().is_err() {
                warn!("dispatcher thread exited with a panic");
            }
        }
        info!("dispatcher stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            pool_size: self.pool.get().map(|p| p.size).unwrap_or(0),
            busy_workers: self.counters.busy.load(Ordering::Acquire),
            queued_jobs: self.counters.queued.load(Ordering::Acquire),
            shut_down: self.is_shut_down(),
        }
    }
}

fn worker_loop(rx: Receiver<Job>, counters: Arc<Counters>, metrics: Option<Metrics>) {
    // ends once every sender is dropped and the queue is empty
    for job in rx.iter() {
        counters.queued.fetch_sub(1, Ordering::AcqRel);
        counters.busy.fetch_add(1, Ordering::AcqRel);
        if let Some(m) = &metrics {
            m.dispatcher_queue_depth.dec();
            m.dispatcher_busy_workers.inc();
        }
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("dispatcher job panicked");
        }
        counters.busy.fetch_sub(1, Ordering::AcqRel);
        if let Some(m) = &metrics {
            m.dispatcher_busy_workers.dec();
        }
    }
    debug!(thread = ?thread::current().name(), "dispatcher thread exiting");
}

impl Drop for BoundedDispatcher {
    fn drop(&mut self) {
        // let idle workers exit; do not join here
        if let Some(pool) = self.pool.get() {
            pool.sender.write().take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::{Duration, Instant};

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn run_returns_job_result_on_named_thread() {
        let d = BoundedDispatcher::new(2, None);
        d.init(2);
        let name = d
            .run(|| thread::current().name().map(str::to_string))
            .await
            .unwrap()
            .unwrap();
        assert!(name.starts_with("db-dispatcher-"), "{name}");
        d.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pool_never_exceeds_its_size() {
        let d = Arc::new(BoundedDispatcher::new(3, None));
        d.init(3);
        let (release_tx, release_rx) = crossbeam_channel::unbounded::<()>();
        let names = Arc::new(Mutex::new(HashSet::new()));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let d = Arc::clone(&d);
            let rx = release_rx.clone();
            let names = Arc::clone(&names);
            tasks.push(tokio::spawn(async move {
                d.run(move || {
                    names
                        .lock()
                        .insert(thread::current().name().unwrap_or_default().to_string());
                    let _ = rx.recv();
                })
                .await
            }));
        }

        let probe = Arc::clone(&d);
        wait_until(move || {
            let s = probe.stats();
            s.busy_workers == 3 && s.queued_jobs == 1
        });
        let stats = d.stats();
        assert_eq!(stats.pool_size, 3);
        assert_eq!(stats.busy_workers, 3);
        assert_eq!(stats.queued_jobs, 1);

        drop(release_tx);
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        assert!(names.lock().len() <= 3);
        assert_eq!(d.stats().busy_workers, 0);
        d.shutdown();
    }

    #[test]
    fn second_init_is_ignored() {
        let d = BoundedDispatcher::new(4, None);
        assert!(d.init(2));
        assert!(!d.init(8));
        assert_eq!(d.stats().pool_size, 2);
        d.shutdown();
    }

    #[tokio::test]
    async fn lazy_pool_uses_default_size() {
        let d = BoundedDispatcher::new(2, None);
        assert_eq!(d.run(|| 41 + 1).await.unwrap(), 42);
        assert_eq!(d.stats().pool_size, 2);
        d.shutdown();
    }

    #[tokio::test]
    async fn shutdown_before_first_use_never_spawns_a_pool() {
        let d = BoundedDispatcher::new(3, None);
        d.shutdown();
        // a submission that passed the shut-down check just before shutdown
        assert_eq!(d.submit(Box::new(|| ())), Err(DispatchError::ShutDown));
        assert_eq!(d.run(|| 1).await, Err(DispatchError::ShutDown));
        assert_eq!(d.stats().pool_size, 0);
        assert!(!d.init(3));
        assert_eq!(d.stats().pool_size, 0);
    }

    #[test]
    fn racing_submit_and_shutdown_leave_no_threads_behind() {
        for _ in 0..50 {
            let d = Arc::new(BoundedDispatcher::new(2, None));
            let submitter = {
                let d = Arc::clone(&d);
                thread::spawn(move || d.submit(Box::new(|| ())))
            };
            d.shutdown();
            let _ = submitter.join().unwrap();
            let pool = d.pool.get().unwrap();
            // either the pool came first and was drained, or it never started
            assert!(pool.sender.read().is_none());
            assert!(pool.threads.lock().is_empty());
        }
    }

    #[tokio::test]
    async fn submissions_after_shutdown_fail_fast() {
        let d = BoundedDispatcher::new(1, None);
        d.init(1);
        d.shutdown();
        assert_eq!(d.run(|| ()).await, Err(DispatchError::ShutDown));
        // second shutdown is a no-op
        d.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_drains_queued_jobs() {
        let d = Arc::new(BoundedDispatcher::new(1, None));
        d.init(1);
        let (release_tx, release_rx) = crossbeam_channel::unbounded::<()>();
        let mut tasks = Vec::new();
        for i in 0..5 {
            let d = Arc::clone(&d);
            let rx = release_rx.clone();
            tasks.push(tokio::spawn(async move {
                d.run(move || {
                    let _ = rx.recv();
                    i
                })
                .await
            }));
        }
        let probe = Arc::clone(&d);
        wait_until(move || {
            let s = probe.stats();
            s.busy_workers == 1 && s.queued_jobs == 4
        });

        let d2 = Arc::clone(&d);
        let stopper = tokio::task::spawn_blocking(move || d2.shutdown());
        drop(release_tx);
        stopper.await.unwrap();

        let mut results = Vec::new();
        for t in tasks {
            results.push(t.await.unwrap().unwrap());
        }
        results.sort_unstable();
        assert_eq!(results, vec![0, 1, 2, 3, 4]);
        assert_eq!(d.run(|| ()).await, Err(DispatchError::ShutDown));
    }

    #[tokio::test]
    async fn panicking_job_reports_worker_lost_and_pool_survives() {
        let d = BoundedDispatcher::new(1, None);
        d.init(1);
        let err = d.run(|| -> u32 { panic!("boom") }).await;
        assert_eq!(err, Err(DispatchError::WorkerLost));
        assert_eq!(d.run(|| 7).await.unwrap(), 7);
        d.shutdown();
    }

    #[tokio::test]
    async fn gauges_return_to_zero() {
        let metrics = Metrics::new().unwrap();
        let d = BoundedDispatcher::new(2, Some(metrics.clone()));
        d.init(2);
        for i in 0..10 {
            assert_eq!(d.run(move || i * 2).await.unwrap(), i * 2);
        }
        assert_eq!(metrics.dispatcher_queue_depth.get(), 0);
        assert_eq!(metrics.dispatcher_busy_workers.get(), 0);
        d.shutdown();
    }
}
