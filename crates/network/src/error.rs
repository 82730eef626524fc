//! Error types for the message-delivery layer

use std::time::Duration;

use pop_protocol::{Method, ProtocolError, RequestId};
use pop_transport::TransportError;
use thiserror::Error;

/// Network operation errors
///
/// Cloneable so that a settled request can hand the same outcome to every
/// holder of its pending answer.
#[derive(Debug, Clone, Error)]
pub enum NetworkError {
    /// Transport layer error
    #[error("Transport error: {0}")]
    Transport(String),

    /// The server answered with an error
    #[error("Remote error {code}: {description}")]
    Remote {
        /// Error code sent by the server
        code: i64,
        /// Description sent by the server
        description: String,
    },

    /// No answer arrived in time
    #[error("Request {0} timed out after {1:?}")]
    Timeout(RequestId, Duration),

    /// The multiplexer was closed
    #[error("Network closed")]
    Closed,

    /// Malformed message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Answer payload does not fit the request
    #[error("Unexpected answer to {method} request")]
    UnexpectedAnswer {
        /// Method of the request
        method: Method,
    },

    /// The manager was already started
    #[error("Network manager already started")]
    AlreadyStarted,
}

impl From<TransportError> for NetworkError {
    fn from(error: TransportError) -> Self {
        Self::Transport(error.to_string())
    }
}

impl From<ProtocolError> for NetworkError {
    fn from(error: ProtocolError) -> Self {
        Self::Protocol(error.to_string())
    }
}

/// Result type alias
pub type NetworkResult<T> = Result<T, NetworkError>;
