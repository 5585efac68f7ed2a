//! Offload pool: blocking work on worker threads, awaited by fibers.
//!
//! A reactor thread can never afford a blocking syscall: one stuck `read`
//! would stall every fiber on that reactor. [`FiberQueuePool`] owns a small
//! set of plain OS threads fed from a bounded closure channel;
//! [`FiberQueuePool::submit`] hands a blocking closure to a worker, suspends
//! the calling fiber on a [`Done`], and resumes it on its own reactor with
//! the closure's result once a worker has run it.
//!
//! Closures must be self-contained: they run on a worker thread with no
//! reactor context and must not re-enter fiber code. Errors belong in the
//! closure's return value; a panic inside a worker is treated as fatal (it
//! is logged and the process aborts), matching the fiber panic policy.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, error};

use crate::fibers::{Channel, Done};

/// Default capacity of the closure channel feeding the workers.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Fallback worker count when hardware parallelism cannot be detected.
const FALLBACK_WORKER_COUNT: usize = 8;

type Job = Box<dyn FnOnce() + Send>;

/// Thread pool that runs blocking closures on behalf of fibers.
pub struct FiberQueuePool {
    input: Channel<Job>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl FiberQueuePool {
    /// Starts a pool with `num_threads` workers (0 means hardware
    /// parallelism) and the default queue capacity.
    pub fn new(num_threads: usize) -> Self {
        Self::with_queue_capacity(num_threads, DEFAULT_QUEUE_CAPACITY)
    }

    /// Starts a pool with an explicit queue capacity.
    pub fn with_queue_capacity(num_threads: usize, queue_capacity: usize) -> Self {
        let num_threads = if num_threads == 0 {
            thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(FALLBACK_WORKER_COUNT)
        } else {
            num_threads
        };

        let input = Channel::<Job>::bounded(queue_capacity);
        let workers = (0..num_threads)
            .map(|i| {
                let input = input.clone();
                thread::Builder::new()
                    .name(format!("fq-pool-{i}"))
                    .spawn(move || worker_loop(input))
                    .expect("failed to spawn offload worker")
            })
            .collect();

        debug!(workers = num_threads, "offload pool started");
        Self {
            input,
            workers: Mutex::new(workers),
        }
    }

    /// Runs `f` on a worker thread, suspending the calling fiber until the
    /// result is available. The fiber resumes on its own reactor.
    ///
    /// # Panics
    ///
    /// Panics if called after [`FiberQueuePool::shutdown`].
    pub async fn submit<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let done = Done::new();
        let slot: Arc<Mutex<Option<R>>> = Arc::new(Mutex::new(None));

        let job_done = done.clone();
        let job_slot = Arc::clone(&slot);
        let job: Job = Box::new(move || {
            let result = f();
            *job_slot.lock().expect("offload slot poisoned") = Some(result);
            job_done.notify();
        });

        if self.input.send(job).await.is_err() {
            panic!("submit to a shut-down FiberQueuePool");
        }
        done.wait().await;

        let result = slot
            .lock()
            .expect("offload slot poisoned")
            .take()
            .expect("worker completed without storing a result");
        result
    }

    /// Fire-and-forget variant: queue `f` without waiting for completion.
    pub async fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.input.send(Box::new(f)).await.is_err() {
            panic!("post to a shut-down FiberQueuePool");
        }
    }

    /// Closes the input channel and joins every worker after it drains.
    /// Idempotent.
    pub fn shutdown(&self) {
        self.input.close();
        let workers = std::mem::take(&mut *self.workers.lock().expect("worker list poisoned"));
        if workers.is_empty() {
            return;
        }
        for worker in workers {
            let _ = worker.join();
        }
        debug!("offload pool stopped");
    }
}

impl Drop for FiberQueuePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for FiberQueuePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberQueuePool")
            .field("queued", &self.input.len())
            .finish_non_exhaustive()
    }
}

fn worker_loop(input: Channel<Job>) {
    while let Ok(job) = input.recv_blocking() {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
            let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                *s
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.as_str()
            } else {
                "<non-string panic payload>"
            };
            error!(panic = msg, "offload worker closure panicked; aborting");
            std::process::abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fibers::Done;
    use crate::reactor::pool::{ReactorPool, ReactorPoolConfig};
    use crate::reactor::NiceLevel;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_submit_returns_result() {
        let pool = FiberQueuePool::new(2);
        let value = pool.submit(|| 6 * 7).await;
        assert_eq!(value, 42);
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_submit_runs_on_worker_thread() {
        let pool = FiberQueuePool::new(1);
        let name = pool
            .submit(|| thread::current().name().unwrap_or("").to_string())
            .await;
        assert!(name.starts_with("fq-pool-"), "ran on {name}");
        pool.shutdown();
    }

    #[test]
    fn test_submit_resumes_on_calling_reactor() {
        let reactors = ReactorPool::start(ReactorPoolConfig {
            num_reactors: 1,
            thread_name_prefix: "offload-test".to_string(),
        })
        .expect("pool start");
        let offload = Arc::new(FiberQueuePool::new(2));
        let done = Done::new();

        let d2 = done.clone();
        let off = Arc::clone(&offload);
        reactors.handle(0).spawn_fn(NiceLevel::NORMAL, move || async move {
            let before = thread::current().id();
            let worker = off.submit(|| thread::current().id()).await;
            let after = thread::current().id();
            assert_ne!(before, worker, "closure must run off-reactor");
            assert_eq!(before, after, "fiber must resume on its reactor");
            d2.notify();
        });
        done.wait_blocking();
        reactors.stop();
        offload.shutdown();
    }

    #[tokio::test]
    async fn test_many_submits_with_few_workers() {
        // More outstanding submits than workers: all complete, roughly in
        // parallel across the worker set.
        let pool = Arc::new(FiberQueuePool::new(8));
        let completed = Arc::new(AtomicUsize::new(0));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..64 {
            let pool = Arc::clone(&pool);
            let completed = Arc::clone(&completed);
            handles.push(tokio::spawn(async move {
                pool.submit(|| thread::sleep(Duration::from_millis(5))).await;
                completed.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(completed.load(Ordering::SeqCst), 64);
        // 64 5ms jobs over 8 workers is ~40ms of work; anything far beyond
        // that means the pool serialized.
        assert!(start.elapsed() < Duration::from_secs(2));
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_work() {
        let pool = FiberQueuePool::new(1);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            pool.post(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    #[should_panic(expected = "shut-down FiberQueuePool")]
    async fn test_submit_after_shutdown_panics() {
        let pool = FiberQueuePool::new(1);
        pool.shutdown();
        let _ = pool.submit(|| 1).await;
    }
}
