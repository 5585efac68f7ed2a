//! Fiber mutex and condition variable.
//!
//! These mirror the standard library contracts but suspend the calling
//! fiber instead of the OS thread, so they are safe to use from reactor
//! fibers. The accept server pairs them to wait for its live-connection set
//! to drain.

use std::cell::UnsafeCell;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::Mutex as StdMutex;
use std::task::{Context, Poll};

use super::waiter::WaitQueue;

// =============================================================================
// Mutex
// =============================================================================

struct LockState {
    locked: bool,
    waiters: WaitQueue,
}

/// A mutual-exclusion lock that suspends fibers rather than threads.
pub struct Mutex<T> {
    state: StdMutex<LockState>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates an unlocked mutex holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            state: StdMutex::new(LockState {
                locked: false,
                waiters: WaitQueue::new(),
            }),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, suspending the calling fiber until it is free.
    pub fn lock(&self) -> Lock<'_, T> {
        Lock { mutex: self, key: None }
    }

    /// Attempts to acquire the lock without suspending.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let mut state = self.state.lock().expect("mutex state poisoned");
        if state.locked {
            None
        } else {
            state.locked = true;
            Some(MutexGuard { mutex: self })
        }
    }

    /// Consumes the mutex and returns the inner value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    fn unlock(&self) {
        let mut state = self.state.lock().expect("mutex state poisoned");
        state.locked = false;
        state.waiters.notify_one();
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("Mutex").field("data", &*guard).finish(),
            None => f.debug_struct("Mutex").field("data", &"<locked>").finish(),
        }
    }
}

/// Future returned by [`Mutex::lock`].
pub struct Lock<'a, T> {
    mutex: &'a Mutex<T>,
    key: Option<u64>,
}

impl<T> Unpin for Lock<'_, T> {}

impl<'a, T> Future for Lock<'a, T> {
    type Output = MutexGuard<'a, T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let mut state = this.mutex.state.lock().expect("mutex state poisoned");
        if !state.locked {
            state.locked = true;
            if let Some(k) = this.key.take() {
                state.waiters.remove(k);
            }
            return Poll::Ready(MutexGuard { mutex: this.mutex });
        }
        match this.key {
            None => this.key = Some(state.waiters.register_task(Some(cx.waker().clone()))),
            Some(k) => {
                if state.waiters.is_notified(k) {
                    // Another fiber barged in; wait for the next unlock.
                    state.waiters.reset_to_waiting(k);
                }
                state.waiters.update(k, cx.waker());
            }
        }
        Poll::Pending
    }
}

impl<T> Drop for Lock<'_, T> {
    fn drop(&mut self) {
        if let Some(k) = self.key.take() {
            let mut state = self.mutex.state.lock().expect("mutex state poisoned");
            if state.waiters.remove(k) {
                state.waiters.notify_one();
            }
        }
    }
}

/// RAII guard for [`Mutex`]; releases the lock on drop.
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<'a, T> MutexGuard<'a, T> {
    /// Returns the mutex this guard belongs to. Used by [`Condvar::wait`] to
    /// re-acquire after waking.
    pub fn mutex(this: &Self) -> &'a Mutex<T> {
        this.mutex
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

// =============================================================================
// Condvar
// =============================================================================

/// Condition variable for use with the fiber [`Mutex`].
///
/// Waiters are registered before the mutex is released, so a notification
/// issued at any point after the caller unlocks is never lost.
pub struct Condvar {
    waiters: StdMutex<WaitQueue>,
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

impl Condvar {
    /// Creates a condition variable.
    pub fn new() -> Self {
        Self {
            waiters: StdMutex::new(WaitQueue::new()),
        }
    }

    /// Releases `guard`, suspends until notified, then re-acquires the lock.
    ///
    /// As with any condition variable, spurious wakeups are possible; callers
    /// should re-check their predicate (or use [`Condvar::wait_while`]).
    pub async fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let mutex = MutexGuard::mutex(&guard);
        let listener = self.listen();
        drop(guard);
        listener.await;
        mutex.lock().await
    }

    /// Waits until `condition` returns false, re-checking after every wakeup.
    pub async fn wait_while<'a, T, F>(
        &self,
        mut guard: MutexGuard<'a, T>,
        mut condition: F,
    ) -> MutexGuard<'a, T>
    where
        F: FnMut(&mut T) -> bool,
    {
        while condition(&mut guard) {
            guard = self.wait(guard).await;
        }
        guard
    }

    /// Wakes one waiter.
    pub fn notify_one(&self) {
        self.waiters
            .lock()
            .expect("condvar waiters poisoned")
            .notify_one();
    }

    /// Wakes every waiter.
    pub fn notify_all(&self) {
        self.waiters
            .lock()
            .expect("condvar waiters poisoned")
            .notify_all();
    }

    fn listen(&self) -> Listener<'_> {
        let key = self
            .waiters
            .lock()
            .expect("condvar waiters poisoned")
            .register_task(None);
        Listener { cv: self, key: Some(key) }
    }
}

struct Listener<'a> {
    cv: &'a Condvar,
    key: Option<u64>,
}

impl Unpin for Listener<'_> {}

impl Future for Listener<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = &mut *self;
        let key = this.key.expect("listener polled after completion");
        let mut waiters = this.cv.waiters.lock().expect("condvar waiters poisoned");
        if waiters.is_notified(key) {
            waiters.remove(key);
            this.key = None;
            Poll::Ready(())
        } else {
            waiters.update(key, cx.waker());
            Poll::Pending
        }
    }
}

impl Drop for Listener<'_> {
    fn drop(&mut self) {
        if let Some(k) = self.key.take() {
            let mut waiters = self.cv.waiters.lock().expect("condvar waiters poisoned");
            if waiters.remove(k) {
                waiters.notify_one();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_mutex_guards_counter() {
        let mutex = Arc::new(Mutex::new(0u64));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let mutex = Arc::clone(&mutex);
            tasks.push(tokio::spawn(async move {
                for _ in 0..100 {
                    let mut guard = mutex.lock().await;
                    *guard += 1;
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(*mutex.lock().await, 800);
    }

    #[tokio::test]
    async fn test_try_lock_contended() {
        let mutex = Mutex::new(5);
        let guard = mutex.lock().await;
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert_eq!(*mutex.try_lock().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_condvar_wait_sees_notify() {
        let pair = Arc::new((Mutex::new(false), Condvar::new()));
        let pair2 = Arc::clone(&pair);

        let waiter = tokio::spawn(async move {
            let (lock, cv) = &*pair2;
            let guard = lock.lock().await;
            let guard = cv.wait_while(guard, |ready| !*ready).await;
            assert!(*guard);
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        {
            let (lock, cv) = &*pair;
            let mut guard = lock.lock().await;
            *guard = true;
            cv.notify_all();
        }
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_condvar_notify_before_wait_is_not_lost() {
        // The listener registers before releasing the lock, so a notify
        // issued by a racing task right after the unlock must be observed.
        let pair = Arc::new((Mutex::new(0u32), Condvar::new()));
        for _ in 0..50 {
            let pair2 = Arc::clone(&pair);
            let waiter = tokio::spawn(async move {
                let (lock, cv) = &*pair2;
                let guard = lock.lock().await;
                let _guard = cv.wait_while(guard, |v| *v == 0).await;
            });
            let (lock, cv) = &*pair;
            {
                let mut guard = lock.lock().await;
                *guard = 1;
            }
            cv.notify_all();
            waiter.await.unwrap();
            *pair.0.lock().await = 0;
        }
    }
}
