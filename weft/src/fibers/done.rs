//! One-shot edge-triggered completion event.
//!
//! [`Done`] carries a single "it happened" bit between fibers and threads.
//! [`Done::notify`] is idempotent, [`Done::wait`] suspends the calling fiber
//! until the bit is set (returning immediately if it already is), and
//! [`Done::wait_blocking`] does the same for OS threads. The offload pool
//! uses one `Done` per submitted closure; the accept server uses one for its
//! "fully stopped" signal.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll};

use super::waiter::WaitQueue;

struct State {
    set: bool,
    waiters: WaitQueue,
    blocked_threads: usize,
}

struct Inner {
    state: Mutex<State>,
    cv: Condvar,
}

/// One-shot event usable by both fibers and OS threads.
#[derive(Clone)]
pub struct Done {
    inner: Arc<Inner>,
}

impl Default for Done {
    fn default() -> Self {
        Self::new()
    }
}

impl Done {
    /// Creates an unset event.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    set: false,
                    waiters: WaitQueue::new(),
                    blocked_threads: 0,
                }),
                cv: Condvar::new(),
            }),
        }
    }

    /// Sets the event and wakes every waiter. Multiple notifies collapse into
    /// one.
    pub fn notify(&self) {
        let mut state = self.inner.state.lock().expect("done lock poisoned");
        if state.set {
            return;
        }
        state.set = true;
        state.waiters.notify_all();
        self.inner.cv.notify_all();
    }

    /// Suspends the calling fiber until the event is set. Returns immediately
    /// if it already is.
    pub fn wait(&self) -> Wait<'_> {
        Wait { done: self, key: None }
    }

    /// Blocks the calling OS thread until the event is set.
    pub fn wait_blocking(&self) {
        let mut state = self.inner.state.lock().expect("done lock poisoned");
        state.blocked_threads += 1;
        while !state.set {
            state = self.inner.cv.wait(state).expect("done lock poisoned");
        }
        state.blocked_threads -= 1;
    }

    /// Returns whether the event has been set.
    pub fn is_notified(&self) -> bool {
        self.inner.state.lock().expect("done lock poisoned").set
    }

    /// Returns the event to the unset state.
    ///
    /// # Panics
    ///
    /// Panics if any fiber or thread is currently waiting; resetting under
    /// waiters would race with their wakeups.
    pub fn reset(&self) {
        let mut state = self.inner.state.lock().expect("done lock poisoned");
        assert!(
            state.waiters.is_empty() && state.blocked_threads == 0,
            "Done::reset while waiters are present"
        );
        state.set = false;
    }
}

/// Future returned by [`Done::wait`].
pub struct Wait<'a> {
    done: &'a Done,
    key: Option<u64>,
}

impl Unpin for Wait<'_> {}

impl Future for Wait<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = &mut *self;
        let mut state = this.done.inner.state.lock().expect("done lock poisoned");
        if state.set {
            if let Some(k) = this.key.take() {
                state.waiters.remove(k);
            }
            return Poll::Ready(());
        }
        match this.key {
            None => this.key = Some(state.waiters.register_task(Some(cx.waker().clone()))),
            Some(k) => state.waiters.update(k, cx.waker()),
        }
        Poll::Pending
    }
}

impl Drop for Wait<'_> {
    fn drop(&mut self) {
        if let Some(k) = self.key.take() {
            let mut state = self.done.inner.state.lock().expect("done lock poisoned");
            state.waiters.remove(k);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_after_notify_returns_immediately() {
        let done = Done::new();
        done.notify();
        done.wait().await;
    }

    #[tokio::test]
    async fn test_double_notify_collapses() {
        let done = Done::new();
        done.notify();
        done.notify();
        done.wait().await;
        assert!(done.is_notified());
    }

    #[tokio::test]
    async fn test_notify_wakes_pending_waiter() {
        let done = Done::new();
        let d2 = done.clone();
        let waiter = tokio::spawn(async move { d2.wait().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        done.notify();
        waiter.await.unwrap();
    }

    #[test]
    fn test_wait_blocking_from_thread() {
        let done = Done::new();
        let d2 = done.clone();
        let waiter = std::thread::spawn(move || d2.wait_blocking());
        std::thread::sleep(Duration::from_millis(20));
        done.notify();
        waiter.join().unwrap();
    }

    #[test]
    fn test_reset_allows_reuse() {
        let done = Done::new();
        done.notify();
        assert!(done.is_notified());
        done.reset();
        assert!(!done.is_notified());
        done.notify();
        done.wait_blocking();
    }
}
