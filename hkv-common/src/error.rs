//! # Error Taxonomy
//!
//! Purpose: Give every layer of HyperKV (engine, persistence, cluster,
//! server) one shared vocabulary of failure modes so they can be logged,
//! counted, and translated to wire-level responses consistently.
//!
//! ## Design Principles
//! 1. **Single Enum, Many Callers**: One `HkvError` crosses crate boundaries
//!    instead of each layer inventing its own error type.
//! 2. **Wire-Mappable**: Each variant has an obvious RESP/HTTP encoding so
//!    the frontends never have to guess at a translation.
//! 3. **Fail Loud on Corruption**: Errors that indicate a broken invariant
//!    are distinct from ordinary not-found/expired results.

use thiserror::Error;

/// Result alias used throughout the workspace.
pub type HkvResult<T> = Result<T, HkvError>;

/// Error kinds shared by the engine, persistence, and cluster layers.
///
/// Variant names mirror the taxonomy in the system design doc so log lines
/// and metrics can be grepped by a stable vocabulary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HkvError {
    /// Empty key, negative TTL, or otherwise malformed request argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Key does not exist (or was lazily expired before lookup).
    #[error("not found")]
    NotFound,

    /// Key existed but its TTL has elapsed; treated as not-found at the wire.
    #[error("expired")]
    Expired,

    /// Store/pool exhausted after eviction attempts.
    #[error("no space")]
    NoSpace,

    /// Key belongs to a different node; caller should redirect.
    #[error("moved: slot {slot} -> {owner_addr}")]
    Moved { slot: u16, owner_addr: String },

    /// Stored bytes could not be decoded back into a typed value.
    #[error("deserialize error for key")]
    DeserializeError,

    /// Persistence writes are failing; engine stopped accepting writes.
    #[error("persistence degraded")]
    PersistenceDegraded,

    /// A handle passed to `MemoryPool::free` was not tracked by the pool.
    #[error("invalid free")]
    InvalidFree,

    /// Gossip transport is unreachable; routing continues with a stale ring.
    #[error("membership transient")]
    MembershipTransient,

    /// Operation was cancelled by a deadline or shutdown signal.
    #[error("cancelled")]
    Cancelled,

    /// Generic I/O failure from the persistence layer or network.
    #[error("io error: {0}")]
    Io(String),
}

impl HkvError {
    /// Returns true when this error should be surfaced to a client verbatim
    /// rather than mapped to a generic internal error.
    pub fn is_client_facing(&self) -> bool {
        matches!(
            self,
            HkvError::InvalidArgument(_)
                | HkvError::NotFound
                | HkvError::Expired
                | HkvError::NoSpace
                | HkvError::Moved { .. }
        )
    }
}

impl From<std::io::Error> for HkvError {
    fn from(err: std::io::Error) -> Self {
        HkvError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_facing_classification() {
        assert!(HkvError::NotFound.is_client_facing());
        assert!(HkvError::NoSpace.is_client_facing());
        assert!(!HkvError::DeserializeError.is_client_facing());
        assert!(!HkvError::PersistenceDegraded.is_client_facing());
    }

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err: HkvError = io_err.into();
        assert!(matches!(err, HkvError::Io(_)));
    }
}
