//! Bounded MPMC channel usable by fibers and OS threads.
//!
//! A [`Channel`] is a fixed-capacity FIFO shared by any mix of fibers and
//! plain threads. Fibers use the async [`Channel::send`] / [`Channel::recv`]
//! operations, which suspend the fiber (never the reactor thread) while the
//! channel is full or empty. Worker threads use the `_blocking` variants,
//! which park the OS thread.
//!
//! Closing follows the buffered-channel contract: after [`Channel::close`]
//! no further send succeeds, while receivers drain whatever is already
//! buffered and only then observe the closed state.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use super::waiter::WaitQueue;

// =============================================================================
// Errors
// =============================================================================

/// The channel was closed; the unsent value is returned to the caller.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("sending on a closed channel")]
pub struct SendError<T>(pub T);

/// Error returned by [`Channel::try_send`].
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum TrySendError<T> {
    /// The channel is at capacity.
    #[error("channel is full")]
    Full(T),
    /// The channel was closed.
    #[error("sending on a closed channel")]
    Closed(T),
}

/// The channel was closed and fully drained.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("receiving on a closed channel")]
pub struct RecvError;

/// Error returned by [`Channel::try_recv`].
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum TryRecvError {
    /// The channel is currently empty.
    #[error("channel is empty")]
    Empty,
    /// The channel was closed and fully drained.
    #[error("receiving on a closed channel")]
    Closed,
}

// =============================================================================
// Channel
// =============================================================================

struct Inner<T> {
    queue: VecDeque<T>,
    capacity: usize,
    closed: bool,
    send_waiters: WaitQueue,
    recv_waiters: WaitQueue,
}

/// Bounded MPMC FIFO channel. Cloning yields another handle to the same
/// channel; all handles see the same close state.
pub struct Channel<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Channel<T> {
    /// Creates a bounded channel.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn bounded(capacity: usize) -> Self {
        assert!(capacity > 0, "channel capacity must be positive");
        Self {
            inner: Arc::new(Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                capacity,
                closed: false,
                send_waiters: WaitQueue::new(),
                recv_waiters: WaitQueue::new(),
            })),
        }
    }

    /// Sends a value, suspending the calling fiber while the channel is full.
    pub fn send(&self, value: T) -> Send<'_, T> {
        Send {
            channel: self,
            value: Some(value),
            key: None,
        }
    }

    /// Receives a value, suspending the calling fiber while the channel is
    /// empty. Returns `Err(RecvError)` once the channel is closed and fully
    /// drained.
    pub fn recv(&self) -> Recv<'_, T> {
        Recv { channel: self, key: None }
    }

    /// Non-suspending send.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let mut inner = self.inner.lock().expect("channel lock poisoned");
        if inner.closed {
            return Err(TrySendError::Closed(value));
        }
        if inner.queue.len() >= inner.capacity {
            return Err(TrySendError::Full(value));
        }
        inner.queue.push_back(value);
        inner.recv_waiters.notify_one();
        Ok(())
    }

    /// Non-suspending receive.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        let mut inner = self.inner.lock().expect("channel lock poisoned");
        match inner.queue.pop_front() {
            Some(value) => {
                inner.send_waiters.notify_one();
                Ok(value)
            }
            None if inner.closed => Err(TryRecvError::Closed),
            None => Err(TryRecvError::Empty),
        }
    }

    /// Sends from an OS thread, parking it while the channel is full.
    pub fn send_blocking(&self, value: T) -> Result<(), SendError<T>> {
        let mut value = Some(value);
        let mut key: Option<u64> = None;
        loop {
            {
                let mut inner = self.inner.lock().expect("channel lock poisoned");
                if inner.closed {
                    if let Some(k) = key.take() {
                        if inner.send_waiters.remove(k) {
                            inner.send_waiters.notify_one();
                        }
                    }
                    return Err(SendError(value.take().expect("value present")));
                }
                if inner.queue.len() < inner.capacity {
                    if let Some(k) = key.take() {
                        inner.send_waiters.remove(k);
                    }
                    inner.queue.push_back(value.take().expect("value present"));
                    inner.recv_waiters.notify_one();
                    return Ok(());
                }
                match key {
                    None => key = Some(inner.send_waiters.register_thread()),
                    Some(k) => inner.send_waiters.reset_to_waiting(k),
                }
            }
            std::thread::park();
        }
    }

    /// Receives from an OS thread, parking it while the channel is empty.
    pub fn recv_blocking(&self) -> Result<T, RecvError> {
        let mut key: Option<u64> = None;
        loop {
            {
                let mut inner = self.inner.lock().expect("channel lock poisoned");
                if let Some(value) = inner.queue.pop_front() {
                    if let Some(k) = key.take() {
                        inner.recv_waiters.remove(k);
                    }
                    inner.send_waiters.notify_one();
                    return Ok(value);
                }
                if inner.closed {
                    if let Some(k) = key.take() {
                        if inner.recv_waiters.remove(k) {
                            inner.recv_waiters.notify_one();
                        }
                    }
                    return Err(RecvError);
                }
                match key {
                    None => key = Some(inner.recv_waiters.register_thread()),
                    Some(k) => inner.recv_waiters.reset_to_waiting(k),
                }
            }
            std::thread::park();
        }
    }

    /// Closes the channel. Pending sends fail; receivers drain the buffered
    /// items and then observe the closed state. Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("channel lock poisoned");
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.send_waiters.notify_all();
        inner.recv_waiters.notify_all();
    }

    /// Returns whether the channel has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("channel lock poisoned").closed
    }

    /// Number of currently buffered items.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("channel lock poisoned").queue.len()
    }

    /// Returns whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The fixed capacity the channel was created with.
    pub fn capacity(&self) -> usize {
        self.inner.lock().expect("channel lock poisoned").capacity
    }
}

// =============================================================================
// Futures
// =============================================================================

/// Future returned by [`Channel::send`].
pub struct Send<'a, T> {
    channel: &'a Channel<T>,
    value: Option<T>,
    key: Option<u64>,
}

impl<T> Unpin for Send<'_, T> {}

impl<T> Future for Send<'_, T> {
    type Output = Result<(), SendError<T>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let mut inner = this.channel.inner.lock().expect("channel lock poisoned");
        if inner.closed {
            if let Some(k) = this.key.take() {
                if inner.send_waiters.remove(k) {
                    inner.send_waiters.notify_one();
                }
            }
            let value = this.value.take().expect("polled after completion");
            return Poll::Ready(Err(SendError(value)));
        }
        if inner.queue.len() < inner.capacity {
            if let Some(k) = this.key.take() {
                inner.send_waiters.remove(k);
            }
            let value = this.value.take().expect("polled after completion");
            inner.queue.push_back(value);
            inner.recv_waiters.notify_one();
            return Poll::Ready(Ok(()));
        }
        match this.key {
            None => this.key = Some(inner.send_waiters.register_task(Some(cx.waker().clone()))),
            Some(k) => {
                if inner.send_waiters.is_notified(k) {
                    // Woken but the space was taken; wait again.
                    inner.send_waiters.reset_to_waiting(k);
                }
                inner.send_waiters.update(k, cx.waker());
            }
        }
        Poll::Pending
    }
}

impl<T> Drop for Send<'_, T> {
    fn drop(&mut self) {
        if let Some(k) = self.key.take() {
            let mut inner = self.channel.inner.lock().expect("channel lock poisoned");
            if inner.send_waiters.remove(k) {
                // We held an unclaimed notification; hand it to the next sender.
                inner.send_waiters.notify_one();
            }
        }
    }
}

/// Future returned by [`Channel::recv`].
pub struct Recv<'a, T> {
    channel: &'a Channel<T>,
    key: Option<u64>,
}

impl<T> Unpin for Recv<'_, T> {}

impl<T> Future for Recv<'_, T> {
    type Output = Result<T, RecvError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let mut inner = this.channel.inner.lock().expect("channel lock poisoned");
        if let Some(value) = inner.queue.pop_front() {
            if let Some(k) = this.key.take() {
                inner.recv_waiters.remove(k);
            }
            inner.send_waiters.notify_one();
            return Poll::Ready(Ok(value));
        }
        if inner.closed {
            if let Some(k) = this.key.take() {
                if inner.recv_waiters.remove(k) {
                    inner.recv_waiters.notify_one();
                }
            }
            return Poll::Ready(Err(RecvError));
        }
        match this.key {
            None => this.key = Some(inner.recv_waiters.register_task(Some(cx.waker().clone()))),
            Some(k) => {
                if inner.recv_waiters.is_notified(k) {
                    inner.recv_waiters.reset_to_waiting(k);
                }
                inner.recv_waiters.update(k, cx.waker());
            }
        }
        Poll::Pending
    }
}

impl<T> Drop for Recv<'_, T> {
    fn drop(&mut self) {
        if let Some(k) = self.key.take() {
            let mut inner = self.channel.inner.lock().expect("channel lock poisoned");
            if inner.recv_waiters.remove(k) {
                inner.recv_waiters.notify_one();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_try_send_try_recv_roundtrip() {
        let ch = Channel::bounded(4);
        ch.try_send(1).unwrap();
        ch.try_send(2).unwrap();
        assert_eq!(ch.try_recv().unwrap(), 1);
        assert_eq!(ch.try_recv().unwrap(), 2);
        assert_eq!(ch.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_try_send_full() {
        let ch = Channel::bounded(1);
        ch.try_send(1).unwrap();
        assert_eq!(ch.try_send(2), Err(TrySendError::Full(2)));
    }

    #[test]
    fn test_close_drains_then_reports_closed() {
        let ch = Channel::bounded(8);
        for i in 0..5 {
            ch.try_send(i).unwrap();
        }
        ch.close();
        assert_eq!(ch.try_send(99), Err(TrySendError::Closed(99)));
        for i in 0..5 {
            assert_eq!(ch.try_recv().unwrap(), i);
        }
        assert_eq!(ch.try_recv(), Err(TryRecvError::Closed));
    }

    #[tokio::test]
    async fn test_async_send_recv_order() {
        let ch = Channel::bounded(16);
        for i in 0..10 {
            ch.send(i).await.unwrap();
        }
        for i in 0..10 {
            assert_eq!(ch.recv().await.unwrap(), i);
        }
    }

    #[tokio::test]
    async fn test_async_recv_waits_for_send() {
        let ch = Channel::<u32>::bounded(1);
        let ch2 = ch.clone();
        let recv = tokio::spawn(async move { ch2.recv().await.unwrap() });
        tokio::time::sleep(Duration::from_millis(20)).await;
        ch.send(7).await.unwrap();
        assert_eq!(recv.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_backpressure_suspends_sender() {
        let ch = Channel::bounded(2);
        ch.send(0u32).await.unwrap();
        ch.send(1u32).await.unwrap();

        let ch2 = ch.clone();
        let sender = tokio::spawn(async move { ch2.send(2).await.unwrap() });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!sender.is_finished(), "send should be suspended while full");

        assert_eq!(ch.recv().await.unwrap(), 0);
        sender.await.unwrap();
        assert_eq!(ch.recv().await.unwrap(), 1);
        assert_eq!(ch.recv().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_close_wakes_pending_recv() {
        let ch = Channel::<u32>::bounded(1);
        let ch2 = ch.clone();
        let recv = tokio::spawn(async move { ch2.recv().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        ch.close();
        assert_eq!(recv.await.unwrap(), Err(RecvError));
    }

    #[test]
    fn test_blocking_producer_consumer_total_order() {
        let ch = Channel::bounded(16);
        let producer = {
            let ch = ch.clone();
            std::thread::spawn(move || {
                for i in 0..1000u32 {
                    ch.send_blocking(i).unwrap();
                }
                ch.close();
            })
        };
        let consumer = {
            let ch = ch.clone();
            std::thread::spawn(move || {
                let mut seen = Vec::new();
                while let Ok(v) = ch.recv_blocking() {
                    seen.push(v);
                }
                seen
            })
        };
        producer.join().unwrap();
        let seen = consumer.join().unwrap();
        assert_eq!(seen, (0..1000).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_thread_producer_fiber_consumer() {
        let ch = Channel::bounded(4);
        let producer = {
            let ch = ch.clone();
            std::thread::spawn(move || {
                for i in 0..100u32 {
                    ch.send_blocking(i).unwrap();
                }
                ch.close();
            })
        };
        let mut seen = Vec::new();
        while let Ok(v) = ch.recv().await {
            seen.push(v);
        }
        producer.join().unwrap();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    #[should_panic(expected = "capacity must be positive")]
    fn test_zero_capacity_rejected() {
        let _ = Channel::<u32>::bounded(0);
    }
}
