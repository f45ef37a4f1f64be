//! Error types specific to the reader transport

use thiserror::Error;

/// Transport error type
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The outbound message could not be submitted
    #[error("Failed to submit message to reader")]
    Submit,

    /// The reply could not be received
    #[error("Failed to receive reply from reader")]
    Receive,

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// The underlying bus connection is gone
    #[error("Transport disconnected")]
    Disconnected,

    /// Other error with message
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Create a general other error
    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::Other(message.into())
    }
}
