//! Error taxonomy for the cache server.
//!
//! Four categories, matching the propagation policy of the connection loop
//! and executor: client-input errors are reported to the client and never
//! close the connection; transport errors close only the offending
//! connection; resource-exhaustion errors reject the new work; internal
//! invariant violations are fatal in the loop and worker-local in the
//! executor.

use std::fmt;

/// Errors raised while serving a single connection or executing a command.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Malformed input or a command that cannot be satisfied (oversized
    /// entry, unknown command). Reported to the client; connection stays
    /// open.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A read/write syscall failed for a reason other than would-block.
    /// Closes the connection.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// A bounded resource (accept cap, executor queue) is full.
    #[error("resource exhausted: {0}")]
    Exhausted(&'static str),

    /// An invariant documented in the data model was violated. Fatal in the
    /// connection loop; worker-local (the worker exits, the executor
    /// respawns up to `low_watermark`) inside the executor.
    #[error("invariant violation: {0}")]
    Invariant(String),
}

/// Marker type distinguishing a would-block I/O result from a genuine
/// transport failure, so callers can match on it without re-inspecting
/// `ErrorKind` at every call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOutcome {
    /// The operation completed normally.
    Done,
    /// The operation would have blocked; retry on the next readiness event.
    WouldBlock,
    /// The peer closed the connection (a read returned zero bytes).
    Closed,
}

impl fmt::Display for IoOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoOutcome::Done => write!(f, "done"),
            IoOutcome::WouldBlock => write!(f, "would-block"),
            IoOutcome::Closed => write!(f, "closed"),
        }
    }
}

/// Returns `true` if `err` represents a transient non-blocking condition
/// rather than a genuine transport fault.
pub fn would_block(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn would_block_matches_wouldblock_and_interrupted() {
        assert!(would_block(&std::io::Error::from(
            std::io::ErrorKind::WouldBlock
        )));
        assert!(would_block(&std::io::Error::from(
            std::io::ErrorKind::Interrupted
        )));
        assert!(!would_block(&std::io::Error::from(
            std::io::ErrorKind::ConnectionReset
        )));
    }

    #[test]
    fn protocol_error_display() {
        let e = ServerError::Protocol("bad key".to_string());
        assert_eq!(e.to_string(), "protocol error: bad key");
    }

    #[test]
    fn transport_error_wraps_io_error() {
        let io_err = std::io::Error::from(std::io::ErrorKind::BrokenPipe);
        let e: ServerError = io_err.into();
        assert!(matches!(e, ServerError::Transport(_)));
    }
}
