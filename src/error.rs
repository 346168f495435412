use std::io;

use thiserror::Error;

/// Errors that cross the core's boundary into caller-visible results.
///
/// Descriptor-level I/O failures (would-block, peer close, reset) never show up
/// here; the event loop absorbs them when it tears the channel down.
#[derive(Debug, Error)]
pub enum Error {
    /// A fixed ceiling was hit: select's descriptor width, the channel arena,
    /// the ring's submission queue.
    #[error("{resource} exhausted (limit {limit})")]
    ResourceExhausted { resource: &'static str, limit: usize },

    /// Every backend is warming up or unhealthy. Retriable.
    #[error("no eligible backend")]
    NoEligibleBackend,

    /// Internal or caller bug, e.g. a connection counter released more often
    /// than it was acquired.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("unknown backend id {0}")]
    UnknownBackend(usize),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("transcode failed: {0}")]
    Transcode(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the caller can retry the same operation later.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::NoEligibleBackend | Error::ResourceExhausted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::ResourceExhausted {
            resource: "select fd_set",
            limit: 1024,
        };
        assert_eq!(err.to_string(), "select fd_set exhausted (limit 1024)");
        assert_eq!(Error::NoEligibleBackend.to_string(), "no eligible backend");
    }

    #[test]
    fn test_retriable_classification() {
        assert!(Error::NoEligibleBackend.is_retriable());
        assert!(!Error::InvariantViolation("x".into()).is_retriable());
        let io_err: Error = io::Error::other("boom").into();
        assert!(!io_err.is_retriable());
    }
}
