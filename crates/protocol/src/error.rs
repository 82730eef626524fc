//! Error types for the wire protocol

use thiserror::Error;

/// Errors raised while encoding, decoding or validating protocol messages
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// JSON encoding or decoding failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Base64 decoding failed
    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Channel path is malformed
    #[error("Invalid channel '{path}': {reason}")]
    InvalidChannel {
        /// The offending path
        path: String,
        /// Why it was rejected
        reason: &'static str,
    },

    /// Public key is not a valid Ed25519 key
    #[error("Invalid public key '{0}'")]
    InvalidPublicKey(String),

    /// JSON-RPC envelope does not match any known shape
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Unknown JSON-RPC method
    #[error("Unknown method '{0}'")]
    UnknownMethod(String),

    /// Data payload could not be decoded for its object/action pair
    #[error("Invalid {object}/{action} data: {reason}")]
    InvalidData {
        /// Data object
        object: String,
        /// Data action
        action: String,
        /// Decoder failure
        reason: String,
    },

    /// Data payload has no object/action header
    #[error("Data payload is missing its '{0}' field")]
    MissingHeader(&'static str),

    /// Signature does not verify against the sender key
    #[error("Signature verification failed for message {0}")]
    InvalidSignature(String),

    /// Message id does not match the hash of data and signature
    #[error("Message id mismatch: expected {expected}, got {actual}")]
    MessageIdMismatch {
        /// Id recomputed from the message contents
        expected: String,
        /// Id carried by the message
        actual: String,
    },
}

/// Result alias for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;
