//! weft — a cooperative-fiber runtime over a pool of event-loop threads.
//!
//! The runtime underneath a family of distributed data-processing tools:
//! N single-threaded reactors host many cooperative fibers each, blocking
//! work is offloaded to worker threads, and connection lifecycle primitives
//! (accept server, reconnecting client channel, resumable object reader)
//! compose on top.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  net::AcceptServer   net::ClientChannel   object_store       │
//! │  accept-loop fiber   reconnect fiber      RangeReader        │
//! ├──────────────────────────────────────────────────────────────┤
//! │  fibers: Channel · Done · Mutex/Condvar      offload pool    │
//! ├──────────────────────────────────────────────────────────────┤
//! │  reactor::ReactorPool — N reactors, one OS thread each,      │
//! │  nice-level fiber scheduler per reactor                      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use weft::fibers::Done;
//! use weft::reactor::pool::{ReactorPool, ReactorPoolConfig};
//! use weft::reactor::NiceLevel;
//!
//! let pool = ReactorPool::start(ReactorPoolConfig::with_reactors(4)).unwrap();
//! let done = Done::new();
//!
//! let d = done.clone();
//! pool.next_context().spawn_fn(NiceLevel::NORMAL, move || async move {
//!     // Straight-line fiber code; suspension points are awaits.
//!     tokio::time::sleep(std::time::Duration::from_millis(5)).await;
//!     d.notify();
//! });
//!
//! done.wait_blocking();
//! pool.stop();
//! ```
//!
//! # Threading rules
//!
//! Every I/O handle belongs to the reactor it was created on and is only
//! driven there. Non-reactor threads talk to reactors through
//! [`reactor::ReactorHandle::post`] / `spawn_fn` or through the primitives
//! in [`fibers`], all of which are safe from any thread.

pub mod error;
pub mod fibers;
pub mod logging;
pub mod net;
pub mod object_store;
pub mod offload;
pub mod reactor;

pub use error::Status;
pub use fibers::{Channel, Done};
pub use net::{AcceptServer, AcceptServerConfig, ClientChannel, Connection, ConnectionHandler};
pub use object_store::RangeReader;
pub use offload::FiberQueuePool;
pub use reactor::pool::{ReactorPool, ReactorPoolConfig};
pub use reactor::{yield_now, NiceLevel, ReactorContext, ReactorHandle};

/// Version of the weft library, injected from the workspace manifest.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
