//! Runtime-wide status type.
//!
//! Most operations in this crate report failures through [`Status`], a small
//! set of error kinds shared by the connection primitives and the object
//! store reader. Channel operations have their own error types (see
//! [`crate::fibers::channel`]) because their contracts are shaped after the
//! standard library channels.

use std::io;

/// Error kinds surfaced by runtime operations.
///
/// - `InvalidArgument` — caller misuse, e.g. a non-sequential read.
/// - `Transport` — an underlying socket or TLS error, with detail.
/// - `Aborted` — the operation lost to a shutdown or a deadline.
/// - `Internal` — a post-condition violation; these indicate a bug.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Status {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("aborted: {0}")]
    Aborted(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Status {
    /// Shorthand for an `InvalidArgument` status.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Status::InvalidArgument(msg.into())
    }

    /// Shorthand for a `Transport` status.
    pub fn transport(msg: impl Into<String>) -> Self {
        Status::Transport(msg.into())
    }

    /// Shorthand for an `Aborted` status.
    pub fn aborted(msg: impl Into<String>) -> Self {
        Status::Aborted(msg.into())
    }

    /// Shorthand for an `Internal` status.
    pub fn internal(msg: impl Into<String>) -> Self {
        Status::Internal(msg.into())
    }

    /// Returns true if this is an `Aborted` status.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Status::Aborted(_))
    }

    /// Returns true if this is a `Transport` status.
    pub fn is_transport(&self) -> bool {
        matches!(self, Status::Transport(_))
    }
}

impl From<io::Error> for Status {
    fn from(err: io::Error) -> Self {
        Status::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display_includes_detail() {
        let status = Status::transport("connection reset");
        assert_eq!(status.to_string(), "transport error: connection reset");
    }

    #[test]
    fn test_io_error_maps_to_transport() {
        let err = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        let status = Status::from(err);
        assert!(status.is_transport());
    }

    #[test]
    fn test_aborted_predicate() {
        assert!(Status::aborted("shutdown").is_aborted());
        assert!(!Status::transport("oops").is_aborted());
    }
}
