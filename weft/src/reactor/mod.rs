//! Reactors: single-threaded event loops hosting cooperative fibers.
//!
//! A reactor is one OS thread running an event loop plus a fiber scheduler
//! (see [`scheduler`]). Fibers are stackless cooperative tasks: plain
//! futures pinned to the reactor they were spawned on; they suspend at I/O,
//! timers, channel operations and explicit [`yield_now`] points, and they
//! never migrate between reactors. Parallelism comes from running several
//! reactors side by side (see [`pool::ReactorPool`]); within one reactor,
//! fibers are strictly serialized.
//!
//! All I/O handles created by a fiber belong to its reactor and must only be
//! driven there. Code on other threads interacts with a reactor exclusively
//! through [`ReactorHandle::post`] / [`ReactorHandle::spawn_fn`] or through
//! the fiber-safe primitives in [`crate::fibers`].

pub mod pool;

mod scheduler;

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};

pub(crate) use scheduler::{run_reactor, Shared};

/// A fiber body: a future pinned to one reactor. `!Send` futures are fine
/// because construction happens on the owning reactor thread.
pub(crate) type FiberFuture = Pin<Box<dyn Future<Output = ()> + 'static>>;

// =============================================================================
// Nice levels
// =============================================================================

/// Scheduling hint for a fiber. Level 0 runs first; higher levels are
/// polled only when every lower level is idle. Background upkeep fibers
/// (e.g. connection re-establishment) run at [`NiceLevel::MAINTENANCE`] so
/// they never delay latency-critical I/O fibers on the same reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NiceLevel(u8);

impl NiceLevel {
    /// Number of distinct nice levels.
    pub const COUNT: usize = 8;

    /// The default level for latency-critical work.
    pub const NORMAL: NiceLevel = NiceLevel(0);

    /// Level used by background maintenance fibers.
    pub const MAINTENANCE: NiceLevel = NiceLevel(4);

    /// Creates a nice level.
    ///
    /// # Panics
    ///
    /// Panics if `level >= NiceLevel::COUNT`.
    pub fn new(level: u8) -> Self {
        assert!(
            (level as usize) < Self::COUNT,
            "nice level out of range: {level}"
        );
        Self(level)
    }

    /// The raw level value.
    pub fn get(self) -> u8 {
        self.0
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

// =============================================================================
// Reactor context (the reactor-thread-local surface)
// =============================================================================

thread_local! {
    static CURRENT: RefCell<Option<ReactorContext>> = const { RefCell::new(None) };
}

struct ContextInner {
    index: usize,
    shared: Arc<Shared>,
    /// Fibers spawned since the scheduler's last drain point.
    spawns: RefCell<Vec<(NiceLevel, FiberFuture)>>,
    /// Typed per-reactor state slot, addressable only from this thread.
    locals: RefCell<HashMap<TypeId, Box<dyn Any>>>,
}

/// Explicit per-reactor context.
///
/// Obtainable only on a reactor thread, either as the argument of
/// [`pool::ReactorPool::await_on_all`] closures or via
/// [`ReactorContext::current`] from fiber code. Because it is `!Send`,
/// holding one is proof of being on the owning thread.
#[derive(Clone)]
pub struct ReactorContext {
    inner: Rc<ContextInner>,
}

impl ReactorContext {
    /// Returns the context of the current reactor thread.
    ///
    /// # Panics
    ///
    /// Panics when called from a thread that is not running a reactor.
    pub fn current() -> Self {
        Self::try_current().expect("ReactorContext::current() outside a reactor thread")
    }

    /// Like [`ReactorContext::current`], but returns `None` off-reactor.
    pub fn try_current() -> Option<Self> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// Index of this reactor within its pool.
    pub fn index(&self) -> usize {
        self.inner.index
    }

    /// A cross-thread handle to this reactor.
    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            shared: Arc::clone(&self.inner.shared),
        }
    }

    /// Spawns a detached fiber on this reactor.
    ///
    /// The fiber starts in the ready queue of its nice level and outlives the
    /// caller; its lifetime ends when the future completes. Panics escaping a
    /// fiber are fatal to the process.
    pub fn spawn<F>(&self, nice: NiceLevel, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        self.inner
            .spawns
            .borrow_mut()
            .push((nice, Box::pin(future)));
        self.inner.shared.kick();
    }

    /// Stores a value in this reactor's typed local slot, replacing any
    /// previous value of the same type.
    pub fn set_local<T: 'static>(&self, value: T) {
        self.inner
            .locals
            .borrow_mut()
            .insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Runs `f` against the local slot of type `T`, if one was set.
    pub fn with_local<T: 'static, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut locals = self.inner.locals.borrow_mut();
        let value = locals.get_mut(&TypeId::of::<T>())?;
        let value = value
            .downcast_mut::<T>()
            .expect("local slot type mismatch");
        Some(f(value))
    }

    /// Removes and returns the local slot of type `T`.
    pub fn take_local<T: 'static>(&self) -> Option<T> {
        let boxed = self
            .inner
            .locals
            .borrow_mut()
            .remove(&TypeId::of::<T>())?;
        Some(*boxed.downcast::<T>().expect("local slot type mismatch"))
    }

    pub(crate) fn install(index: usize, shared: Arc<Shared>) -> Self {
        let ctx = Self {
            inner: Rc::new(ContextInner {
                index,
                shared,
                spawns: RefCell::new(Vec::new()),
                locals: RefCell::new(HashMap::new()),
            }),
        };
        CURRENT.with(|c| *c.borrow_mut() = Some(ctx.clone()));
        ctx
    }

    pub(crate) fn uninstall() {
        CURRENT.with(|c| *c.borrow_mut() = None);
    }

    pub(crate) fn take_spawns(&self) -> Vec<(NiceLevel, FiberFuture)> {
        std::mem::take(&mut *self.inner.spawns.borrow_mut())
    }
}

impl std::fmt::Debug for ReactorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactorContext")
            .field("index", &self.inner.index)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Reactor handle (the cross-thread surface)
// =============================================================================

/// Cross-thread handle to one reactor.
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Arc<Shared>,
}

impl ReactorHandle {
    /// Enqueues `f` to run on the reactor thread. Non-blocking; closures from
    /// one producer run in FIFO order.
    ///
    /// # Panics
    ///
    /// Panics if the reactor has stopped; posting to a dead reactor is a
    /// programmer error.
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.post(Box::new(f));
    }

    /// Builds a future on the reactor thread and spawns it as a detached
    /// fiber there. This is the cross-thread spawn: the constructor closure
    /// must be `Send`, the future it builds need not be.
    pub fn spawn_fn<F, Fut>(&self, nice: NiceLevel, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        self.post(move || {
            let ctx = ReactorContext::current();
            ctx.spawn(nice, f());
        });
    }

    /// Index of this reactor within its pool.
    pub fn index(&self) -> usize {
        self.shared.index()
    }

    /// Whether the reactor loop has exited.
    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopped()
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }
}

impl std::fmt::Debug for ReactorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactorHandle")
            .field("index", &self.index())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

// =============================================================================
// Yield
// =============================================================================

/// Yields the current fiber back to its reactor's scheduler, letting other
/// ready fibers (and the I/O driver) run before this one resumes.
pub async fn yield_now() {
    struct YieldNow {
        yielded: bool,
    }

    impl Future for YieldNow {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.yielded {
                Poll::Ready(())
            } else {
                self.yielded = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }

    YieldNow { yielded: false }.await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nice_level_ordering() {
        assert!(NiceLevel::NORMAL < NiceLevel::MAINTENANCE);
        assert_eq!(NiceLevel::new(3).get(), 3);
    }

    #[test]
    #[should_panic(expected = "nice level out of range")]
    fn test_nice_level_bounds() {
        let _ = NiceLevel::new(NiceLevel::COUNT as u8);
    }

    #[test]
    fn test_try_current_off_reactor_is_none() {
        assert!(ReactorContext::try_current().is_none());
    }
}
