//! Fiber-safe communication and synchronization primitives.
//!
//! Everything in this module works for both fibers and OS threads: a fiber
//! suspends (yielding its reactor to other fibers) while a thread parks.
//!
//! - [`Channel`] — bounded MPMC FIFO with close-then-drain semantics.
//! - [`Done`] — one-shot edge-triggered completion event.
//! - [`Mutex`] / [`Condvar`] — lock and condition variable that suspend
//!   fibers, not threads.

pub mod channel;
pub mod done;
pub mod sync;

mod waiter;

pub use channel::{Channel, RecvError, SendError, TryRecvError, TrySendError};
pub use done::Done;
pub use sync::{Condvar, Mutex, MutexGuard};
