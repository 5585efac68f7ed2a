//! Connection lifecycle primitives built on the reactor runtime.
//!
//! - [`AcceptServer`] — listening socket, accept-loop fiber, per-connection
//!   handler fibers, graceful signal-driven drain.
//! - [`ClientChannel`] — outbound TCP session with a background reconnect
//!   state machine.

pub mod accept_server;
pub mod client_channel;

pub use accept_server::{
    AcceptServer, AcceptServerConfig, Connection, ConnectionHandler, HandlerFactory,
    ACCEPT_BACKLOG,
};
pub use client_channel::ClientChannel;
