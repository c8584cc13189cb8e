//! Error types for ensemble-client.

use thiserror::Error;

use crate::member::Status;
use crate::protocol::WireFormat;

/// Main error type for all client operations.
#[derive(Debug, Error)]
pub enum EnsembleError {
    /// I/O error on the engine stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while loading configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Protocol error (bad precursor, oversized field, unknown opcode,
    /// unknown member id, frame not fully consumed). Fatal to the connection.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Downcall issued from a status that does not allow it.
    #[error("Cannot {op} while member is {status}")]
    InvalidState {
        /// Downcall name.
        op: &'static str,
        /// Status at the time of the call.
        status: Status,
    },

    /// Destination or suspect rank outside the current view.
    #[error("Rank {rank} out of range for view of {nmembers} members")]
    OutOfRange { rank: usize, nmembers: usize },

    /// Outgoing field exceeds its wire ceiling.
    #[error("{field} is {got} bytes, maximum is {max}")]
    TooLarge {
        field: &'static str,
        max: usize,
        got: usize,
    },

    /// Argument rejected before anything was written.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Downcall has no encoding in the selected wire format.
    #[error("{op} is not supported by the {format} wire format")]
    Unsupported {
        op: &'static str,
        format: WireFormat,
    },

    /// Connection closed or failed earlier.
    #[error("Connection closed")]
    ConnectionClosed,
}

impl EnsembleError {
    /// Whether this error leaves the connection unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EnsembleError::Io(_) | EnsembleError::Protocol(_) | EnsembleError::ConnectionClosed
        )
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        EnsembleError::Protocol(msg.into())
    }
}

/// Result type alias using EnsembleError.
pub type Result<T> = std::result::Result<T, EnsembleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(EnsembleError::protocol("desync").is_fatal());
        assert!(EnsembleError::ConnectionClosed.is_fatal());
        assert!(EnsembleError::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe)).is_fatal());

        let state = EnsembleError::InvalidState {
            op: "cast",
            status: Status::Joining,
        };
        assert!(!state.is_fatal());
        assert!(!EnsembleError::OutOfRange { rank: 3, nmembers: 2 }.is_fatal());
    }

    #[test]
    fn test_display() {
        let err = EnsembleError::InvalidState {
            op: "cast",
            status: Status::Leaving,
        };
        assert_eq!(err.to_string(), "Cannot cast while member is Leaving");

        let err = EnsembleError::TooLarge {
            field: "message",
            max: 32768,
            got: 32769,
        };
        assert_eq!(err.to_string(), "message is 32769 bytes, maximum is 32768");
    }
}
