//! Error kinds surfaced by the transport core.
//!
//! Most failures are non-fatal: they are cleaned up locally (rollback in
//! reverse acquisition order) and reported to the connection's
//! [`crate::conn::UpcallObserver`] as a single `Error(kind)` event. The
//! exception is [`Error::ProgramError`], which signals a broken invariant
//! (e.g. a zip over two device lists that did not line up) and is meant to
//! be treated as fatal by the caller, not routed to the observer.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// CM address resolution failed.
    #[error("address resolution failed: {0}")]
    AddrError(String),

    /// CM route resolution failed.
    #[error("route resolution failed: {0}")]
    RouteError(String),

    /// CM reported the peer unreachable.
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    /// `rdma_connect` (or the surrounding handshake) failed.
    #[error("connect failed: {0}")]
    ConnectError(String),

    /// The peer rejected the connection.
    #[error("connection refused by peer: {reason}")]
    Refused { reason: String },

    /// Allocation, registration, or `mlock`-limit failure.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// An option value, or a message to validate, is malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown option name, or an unsupported attribute modify/query.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// A broken program invariant. Not meant to be recovered from; callers
    /// that hit this should treat it the same as a panic.
    #[error("program invariant violated: {0}")]
    ProgramError(String),

    /// Opaque C-level / OS failure, preserved for diagnostics.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for the CM phase failures that §4.5's dispatch table maps
    /// directly to an `Error(kind)` upcall.
    pub fn is_cm_phase_failure(&self) -> bool {
        matches!(
            self,
            Error::AddrError(_) | Error::RouteError(_) | Error::Unreachable(_) | Error::ConnectError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cm_phase_failures_are_flagged() {
        assert!(Error::AddrError("x".into()).is_cm_phase_failure());
        assert!(Error::RouteError("x".into()).is_cm_phase_failure());
        assert!(Error::Unreachable("x".into()).is_cm_phase_failure());
        assert!(Error::ConnectError("x".into()).is_cm_phase_failure());
    }

    #[test]
    fn non_cm_phase_failures_are_not_flagged() {
        assert!(!Error::Refused { reason: "x".into() }.is_cm_phase_failure());
        assert!(!Error::OutOfMemory("x".into()).is_cm_phase_failure());
        assert!(!Error::InvalidArgument("x".into()).is_cm_phase_failure());
        assert!(!Error::NotSupported("x".into()).is_cm_phase_failure());
        assert!(!Error::ProgramError("x".into()).is_cm_phase_failure());
        assert!(!Error::Io(std::io::Error::other("x")).is_cm_phase_failure());
    }
}
