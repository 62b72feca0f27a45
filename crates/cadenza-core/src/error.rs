//! The engine-wide error kind.
//!
//! Errors form a closed set. Only `Timeout` and `ConnectionClosed` are
//! expected during normal operation (a sidecar missing its deadline, a peer
//! closing its pipe); everything else indicates a logic or environmental
//! fault. Cleanup paths never return errors - they log warnings instead,
//! because they run during teardown when there is nobody left to recover.

use std::io;

/// Result type alias using the engine error kind
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors reported by the engine core
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Generic engine fault with a message
    #[error("{0}")]
    Error(String),

    /// An OS call failed
    #[error("{message} (errno {errno})")]
    Os {
        /// The raw errno captured when the call failed
        errno: i32,
        message: String,
    },

    /// The peer closed its end of a pipe or stream
    #[error("connection closed")]
    ConnectionClosed,

    /// A deadline expired before the peer responded
    #[error("timeout")]
    Timeout,

    /// A pthread call returned a non-zero error code
    #[error("pthread error (code {0})")]
    Pthread(i32),

    /// The operation is not defined for this object
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl EngineError {
    /// Capture `errno` from the last failed OS call, with context.
    pub fn os(context: impl Into<String>) -> Self {
        let err = io::Error::last_os_error();
        Self::Os {
            errno: err.raw_os_error().unwrap_or(0),
            message: format!("{}: {err}", context.into()),
        }
    }
}

impl From<io::Error> for EngineError {
    fn from(err: io::Error) -> Self {
        Self::Os {
            errno: err.raw_os_error().unwrap_or(0),
            message: err.to_string(),
        }
    }
}

impl From<String> for EngineError {
    fn from(message: String) -> Self {
        Self::Error(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_error_carries_errno() {
        let err: EngineError = io::Error::from_raw_os_error(libc_enoent()).into();
        match err {
            EngineError::Os { errno, .. } => assert_eq!(errno, libc_enoent()),
            other => panic!("expected Os error, got {other:?}"),
        }
    }

    fn libc_enoent() -> i32 {
        2
    }

    #[test]
    fn test_display() {
        assert_eq!(EngineError::Timeout.to_string(), "timeout");
        assert_eq!(
            EngineError::InvalidOperation("mix on a condition buffer".into()).to_string(),
            "invalid operation: mix on a condition buffer"
        );
    }
}
