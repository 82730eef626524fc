//! Error types for transports

use thiserror::Error;

/// Transport operation errors
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Could not establish a connection
    #[error("Failed to connect to {address}: {reason}")]
    ConnectionFailed {
        /// Address that was dialed
        address: String,
        /// Underlying failure
        reason: String,
    },

    /// Connection was closed locally
    #[error("Connection closed")]
    ConnectionClosed,

    /// Address could not be parsed or has an unsupported scheme
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Operation did not complete in time
    #[error("Operation timed out")]
    Timeout,

    /// Outgoing queue is full
    #[error("Send queue full for {0}")]
    QueueFull(String),

    /// Anything else
    #[error("Transport error: {0}")]
    Other(String),
}

/// Result alias for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
