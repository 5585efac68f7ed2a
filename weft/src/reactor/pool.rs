//! Pool of reactors, one per OS thread.
//!
//! The pool owns N reactors and distributes work across them: round-robin
//! handles via [`ReactorPool::next_context`] for load spreading, and
//! [`ReactorPool::await_on_all`] for running one fiber on every reactor and
//! waiting for all of them, the fan-out primitive pipeline drivers build on.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::info;

use super::{run_reactor, NiceLevel, ReactorContext, ReactorHandle, Shared};
use crate::fibers::Done;

// =============================================================================
// Configuration
// =============================================================================

/// Fallback reactor count when hardware parallelism cannot be detected.
pub const FALLBACK_REACTOR_COUNT: usize = 8;

/// Default prefix for reactor thread names ("reactor-0", "reactor-1", ...).
pub const DEFAULT_THREAD_NAME_PREFIX: &str = "reactor";

/// Configuration for a [`ReactorPool`].
#[derive(Clone, Debug)]
pub struct ReactorPoolConfig {
    /// Number of reactors (event-loop threads) to run.
    pub num_reactors: usize,

    /// Prefix for reactor thread names.
    pub thread_name_prefix: String,
}

impl ReactorPoolConfig {
    /// Configuration with an explicit concurrency degree.
    pub fn with_reactors(num_reactors: usize) -> Self {
        Self {
            num_reactors,
            ..Self::default()
        }
    }

    fn validate(&self) -> io::Result<()> {
        if self.num_reactors == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "reactor pool needs at least one reactor",
            ));
        }
        Ok(())
    }
}

impl Default for ReactorPoolConfig {
    fn default() -> Self {
        let num_reactors = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(FALLBACK_REACTOR_COUNT);
        Self {
            num_reactors,
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
        }
    }
}

// =============================================================================
// Pool
// =============================================================================

/// A fixed set of reactors, each pinned to its own OS thread.
pub struct ReactorPool {
    handles: Vec<ReactorHandle>,
    next: AtomicUsize,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    stopped: AtomicBool,
}

/// Cheap, shareable round-robin view of a pool's reactors.
///
/// Long-lived fibers (like an accept loop) hold one of these instead of a
/// reference to the pool itself.
#[derive(Clone)]
pub struct ReactorRouter {
    handles: Arc<[ReactorHandle]>,
    next: Arc<AtomicUsize>,
}

impl ReactorRouter {
    /// Round-robin handle for load distribution.
    pub fn next_context(&self) -> ReactorHandle {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.handles.len();
        self.handles[i].clone()
    }

    /// Number of reactors behind this router.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Always false: routers are built from started pools.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl std::fmt::Debug for ReactorRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactorRouter")
            .field("reactors", &self.handles.len())
            .finish()
    }
}

impl ReactorPool {
    /// Starts a pool sized to the hardware parallelism.
    pub fn start_default() -> io::Result<Self> {
        Self::start(ReactorPoolConfig::default())
    }

    /// Starts `config.num_reactors` reactors, each on a named OS thread.
    pub fn start(config: ReactorPoolConfig) -> io::Result<Self> {
        config.validate()?;

        let mut handles = Vec::with_capacity(config.num_reactors);
        let mut threads = Vec::with_capacity(config.num_reactors);
        for index in 0..config.num_reactors {
            let shared = Arc::new(Shared::new(index));
            let thread_shared = Arc::clone(&shared);
            let thread = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name_prefix, index))
                .spawn(move || run_reactor(index, thread_shared))?;
            handles.push(ReactorHandle::from_shared(shared));
            threads.push(thread);
        }

        info!(reactors = config.num_reactors, "reactor pool started");
        Ok(Self {
            handles,
            next: AtomicUsize::new(0),
            threads: Mutex::new(threads),
            stopped: AtomicBool::new(false),
        })
    }

    /// Round-robin handle for load distribution. The counter is relaxed;
    /// approximate fairness is all that is promised.
    pub fn next_context(&self) -> ReactorHandle {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.handles.len();
        self.handles[i].clone()
    }

    /// Handle to a specific reactor.
    pub fn handle(&self, index: usize) -> ReactorHandle {
        self.handles[index].clone()
    }

    /// A shareable round-robin router over this pool's reactors.
    pub fn router(&self) -> ReactorRouter {
        ReactorRouter {
            handles: self.handles.clone().into(),
            next: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// All reactor handles, in index order.
    pub fn handles(&self) -> &[ReactorHandle] {
        &self.handles
    }

    /// Number of reactors in the pool.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Returns false: a started pool always has at least one reactor.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Runs one fiber built by `f` on every reactor and blocks the calling
    /// thread until all of them have completed.
    ///
    /// Must be called from outside the pool's reactor threads; calling it
    /// from a fiber would block that fiber's own reactor.
    pub fn await_on_all<F, Fut>(&self, f: F)
    where
        F: Fn(ReactorContext) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let dones: Vec<Done> = self
            .handles
            .iter()
            .map(|handle| {
                let done = Done::new();
                let done_fiber = done.clone();
                let f = f.clone();
                handle.post(move || {
                    let ctx = ReactorContext::current();
                    let fut = f(ctx.clone());
                    ctx.spawn(NiceLevel::NORMAL, async move {
                        fut.await;
                        done_fiber.notify();
                    });
                });
                done
            })
            .collect();

        for done in &dones {
            done.wait_blocking();
        }
    }

    /// Stops every reactor and joins their threads. Idempotent. Fibers still
    /// live at stop time are dropped; posting to the pool afterwards panics.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for handle in &self.handles {
            handle.shared().request_stop();
        }
        let threads = std::mem::take(&mut *self.threads.lock().expect("pool threads poisoned"));
        for thread in threads {
            let _ = thread.join();
        }
        info!(reactors = self.handles.len(), "reactor pool stopped");
    }
}

impl Drop for ReactorPool {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ReactorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactorPool")
            .field("reactors", &self.handles.len())
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}
