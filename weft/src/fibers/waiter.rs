//! Wait-queue bookkeeping shared by the fiber synchronization primitives.
//!
//! A [`WaitQueue`] holds the parties blocked on some condition, fibers
//! (represented by their [`Waker`]) and OS threads (represented by a
//! [`Thread`] handle), in FIFO order. Notification is a two-phase handoff:
//! `notify_one` marks the oldest waiting entry as notified and wakes it; the
//! woken party either claims the notification by removing its entry, or, if
//! it is cancelled before it can act on it, passes the notification on to
//! the next waiter. This is what keeps the channel and condvar free of lost
//! wakeups when futures are dropped mid-wait.

use std::collections::VecDeque;
use std::task::Waker;
use std::thread::Thread;

/// How a waiting party is woken.
#[derive(Debug)]
pub(crate) enum WaiterKind {
    /// A fiber; the waker is absent until the future is first polled.
    Task(Option<Waker>),
    /// An OS thread parked in `std::thread::park`.
    Thread(Thread),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Waiting,
    Notified,
}

#[derive(Debug)]
struct Entry {
    key: u64,
    state: EntryState,
    kind: WaiterKind,
}

impl Entry {
    fn wake(&mut self) {
        match &mut self.kind {
            WaiterKind::Task(waker) => {
                if let Some(waker) = waker.take() {
                    waker.wake();
                }
            }
            WaiterKind::Thread(thread) => thread.unpark(),
        }
    }
}

/// FIFO queue of blocked fibers and threads.
#[derive(Debug, Default)]
pub(crate) struct WaitQueue {
    entries: VecDeque<Entry>,
    next_key: u64,
}

impl WaitQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a fiber waiter. The waker is attached on the first poll via
    /// [`WaitQueue::update`].
    pub(crate) fn register_task(&mut self, waker: Option<Waker>) -> u64 {
        self.register(WaiterKind::Task(waker))
    }

    /// Registers the calling OS thread as a waiter.
    pub(crate) fn register_thread(&mut self) -> u64 {
        self.register(WaiterKind::Thread(std::thread::current()))
    }

    fn register(&mut self, kind: WaiterKind) -> u64 {
        let key = self.next_key;
        self.next_key += 1;
        self.entries.push_back(Entry {
            key,
            state: EntryState::Waiting,
            kind,
        });
        key
    }

    /// Replaces the stored waker for `key` (the future was re-polled with a
    /// possibly different waker).
    pub(crate) fn update(&mut self, key: u64, waker: &Waker) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.key == key) {
            if let WaiterKind::Task(slot) = &mut entry.kind {
                *slot = Some(waker.clone());
            }
        }
    }

    /// Returns whether `key` has been handed a notification.
    pub(crate) fn is_notified(&self, key: u64) -> bool {
        self.entries
            .iter()
            .any(|e| e.key == key && e.state == EntryState::Notified)
    }

    /// Removes `key` from the queue. Returns true if the entry held an
    /// unclaimed notification; the caller must then pass it on with
    /// [`WaitQueue::notify_one`] or the wakeup is lost.
    pub(crate) fn remove(&mut self, key: u64) -> bool {
        if let Some(pos) = self.entries.iter().position(|e| e.key == key) {
            let entry = self.entries.remove(pos).expect("position just found");
            entry.state == EntryState::Notified
        } else {
            false
        }
    }

    /// Puts a notified entry back into the waiting state. Used by thread
    /// waiters that woke up but lost the race for the condition.
    pub(crate) fn reset_to_waiting(&mut self, key: u64) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.key == key) {
            entry.state = EntryState::Waiting;
        }
    }

    /// Notifies the oldest still-waiting entry. Returns false if every entry
    /// is already notified or the queue is empty.
    pub(crate) fn notify_one(&mut self) -> bool {
        for entry in self.entries.iter_mut() {
            if entry.state == EntryState::Waiting {
                entry.state = EntryState::Notified;
                entry.wake();
                return true;
            }
        }
        false
    }

    /// Notifies every waiting entry.
    pub(crate) fn notify_all(&mut self) {
        for entry in self.entries.iter_mut() {
            if entry.state == EntryState::Waiting {
                entry.state = EntryState::Notified;
                entry.wake();
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
