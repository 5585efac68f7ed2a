//! Per-reactor fiber scheduler.
//!
//! Each reactor thread runs [`run_reactor`]: a single-threaded tokio runtime
//! whose sole top-level future is the scheduler loop. The runtime contributes
//! the I/O and timer drivers; scheduling decisions stay here. The loop owns
//! the fiber table and one FIFO ready queue per nice level, and always polls
//! the runnable fiber with the lowest nice level, so latency-critical fibers
//! are never queued behind background maintenance work.
//!
//! Cross-thread interaction goes through [`Shared`]: posted closures and
//! fiber wakeups land in the inbox under a mutex, and the loop's own waker is
//! stored there so any producer can rouse a parked reactor.

use std::collections::{HashMap, VecDeque};
use std::future::poll_fn;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};

use super::{FiberFuture, NiceLevel, ReactorContext};

/// Scheduler polls between forced driver yields, mirroring the fairness
/// cadence used by the job-executor loop this design grew out of.
const YIELD_EVERY_N_POLLS: u32 = 50;

/// Cross-thread state of one reactor.
pub(crate) struct Shared {
    inbox: Mutex<Inbox>,
    /// Set once the reactor loop has exited; posting afterwards is a
    /// programmer error.
    stopped: AtomicBool,
    index: usize,
}

struct Inbox {
    /// Closures posted from any thread, run on the reactor in FIFO order.
    posted: VecDeque<Box<dyn FnOnce() + Send>>,
    /// Fibers woken from any thread.
    woken: Vec<u64>,
    /// Local work (spawns) arrived while the loop may be parked.
    kicked: bool,
    stopping: bool,
    loop_waker: Option<Waker>,
}

impl Shared {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            inbox: Mutex::new(Inbox {
                posted: VecDeque::new(),
                woken: Vec::new(),
                kicked: false,
                stopping: false,
                loop_waker: None,
            }),
            stopped: AtomicBool::new(false),
            index,
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Enqueues a closure for execution on the reactor thread.
    ///
    /// # Panics
    ///
    /// Panics if the reactor has already stopped.
    pub(crate) fn post(&self, f: Box<dyn FnOnce() + Send>) {
        assert!(
            !self.is_stopped(),
            "post to stopped reactor {}",
            self.index
        );
        let waker = {
            let mut inbox = self.inbox.lock().expect("reactor inbox poisoned");
            inbox.posted.push_back(f);
            inbox.loop_waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Asks the reactor loop to exit. Idempotent.
    pub(crate) fn request_stop(&self) {
        let waker = {
            let mut inbox = self.inbox.lock().expect("reactor inbox poisoned");
            inbox.stopping = true;
            inbox.loop_waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Signals that reactor-local work (a spawn) appeared outside the loop's
    /// normal drain points.
    pub(crate) fn kick(&self) {
        let waker = {
            let mut inbox = self.inbox.lock().expect("reactor inbox poisoned");
            inbox.kicked = true;
            inbox.loop_waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn wake_fiber(&self, id: u64) {
        let waker = {
            let mut inbox = self.inbox.lock().expect("reactor inbox poisoned");
            inbox.woken.push(id);
            inbox.loop_waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Waker handed to a fiber's I/O futures. Waking routes the fiber id back to
/// its owning reactor; fibers never migrate.
struct FiberWaker {
    id: u64,
    shared: Arc<Shared>,
}

impl Wake for FiberWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.shared.wake_fiber(self.id);
    }
}

struct Fiber {
    future: FiberFuture,
    waker: Waker,
    nice: NiceLevel,
    /// Whether the fiber currently sits in a ready queue (dedups wakeups).
    queued: bool,
}

/// Entry point of a reactor thread: build the single-threaded runtime and
/// drive the scheduler loop on it.
pub(crate) fn run_reactor(index: usize, shared: Arc<Shared>) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
        .expect("failed to build reactor runtime");

    let ctx = ReactorContext::install(index, Arc::clone(&shared));
    tracing::debug!(reactor = index, "reactor started");

    runtime.block_on(scheduler_loop(ctx, Arc::clone(&shared)));

    shared.stopped.store(true, Ordering::Release);
    ReactorContext::uninstall();
    tracing::debug!(reactor = index, "reactor stopped");
}

async fn scheduler_loop(ctx: ReactorContext, shared: Arc<Shared>) {
    let mut fibers: HashMap<u64, Fiber> = HashMap::new();
    let mut ready: Vec<VecDeque<u64>> = (0..NiceLevel::COUNT).map(|_| VecDeque::new()).collect();
    let mut next_id: u64 = 0;
    let mut polls_since_yield: u32 = 0;

    loop {
        // Move cross-thread activity into local state.
        let (posted, woken, stopping) = {
            let mut inbox = shared.inbox.lock().expect("reactor inbox poisoned");
            inbox.kicked = false;
            (
                std::mem::take(&mut inbox.posted),
                std::mem::take(&mut inbox.woken),
                inbox.stopping,
            )
        };
        for f in posted {
            f();
        }
        for id in woken {
            if let Some(fiber) = fibers.get_mut(&id) {
                if !fiber.queued {
                    fiber.queued = true;
                    ready[fiber.nice.as_usize()].push_back(id);
                }
            }
        }
        // Admit fibers spawned on this reactor since the last drain.
        for (nice, future) in ctx.take_spawns() {
            let id = next_id;
            next_id += 1;
            let waker = Waker::from(Arc::new(FiberWaker {
                id,
                shared: Arc::clone(&shared),
            }));
            fibers.insert(
                id,
                Fiber {
                    future,
                    waker,
                    nice,
                    queued: true,
                },
            );
            ready[nice.as_usize()].push_back(id);
        }

        if stopping {
            break;
        }

        // Lowest nice level first, FIFO within a level.
        let next = ready.iter_mut().find_map(|q| q.pop_front());
        let Some(id) = next else {
            wait_for_inbox(&shared).await;
            continue;
        };

        let Some(fiber) = fibers.get_mut(&id) else {
            continue;
        };
        fiber.queued = false;
        let waker = fiber.waker.clone();
        let mut cx = Context::from_waker(&waker);
        match catch_unwind(AssertUnwindSafe(|| fiber.future.as_mut().poll(&mut cx))) {
            Ok(Poll::Ready(())) => {
                fibers.remove(&id);
            }
            Ok(Poll::Pending) => {}
            Err(payload) => {
                tracing::error!(
                    reactor = shared.index,
                    fiber = id,
                    panic = panic_message(payload.as_ref()),
                    "fiber panicked; aborting"
                );
                std::process::abort();
            }
        }

        polls_since_yield += 1;
        if polls_since_yield >= YIELD_EVERY_N_POLLS {
            polls_since_yield = 0;
            // Give the runtime a chance to service its I/O and timer drivers
            // even when fibers stay runnable.
            super::yield_now().await;
        }
    }

    // Drain pass: closures posted up to the stop request still run; live
    // fibers are dropped with the loop.
    let posted = {
        let mut inbox = shared.inbox.lock().expect("reactor inbox poisoned");
        std::mem::take(&mut inbox.posted)
    };
    for f in posted {
        f();
    }
    if !fibers.is_empty() {
        tracing::debug!(
            reactor = shared.index,
            dropped = fibers.len(),
            "dropping live fibers on stop"
        );
    }
}

/// Parks the scheduler until the inbox has work. The loop waker is stored
/// under the inbox lock, so a producer that enqueues right after our check
/// still finds and wakes it.
async fn wait_for_inbox(shared: &Arc<Shared>) {
    poll_fn(|cx| {
        let mut inbox = shared.inbox.lock().expect("reactor inbox poisoned");
        if !inbox.posted.is_empty() || !inbox.woken.is_empty() || inbox.kicked || inbox.stopping {
            Poll::Ready(())
        } else {
            inbox.loop_waker = Some(cx.waker().clone());
            Poll::Pending
        }
    })
    .await
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}
