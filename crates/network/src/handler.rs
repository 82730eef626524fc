//! Application message handling seam

use async_trait::async_trait;
use pop_protocol::{Channel, MessageGeneral};
use thiserror::Error;

/// Why a handler could not process a message
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Something the message depends on has not been seen yet; retry later
    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    /// The message is malformed or not acceptable; drop it
    #[error("Invalid message: {0}")]
    Invalid(String),

    /// The handler itself failed; drop the message
    #[error("Internal handler error: {0}")]
    Internal(String),
}

impl HandlerError {
    /// Whether the message should be handled again later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::MissingDependency(_))
    }
}

/// Type alias for handler results
pub type HandlerResult<T> = Result<T, HandlerError>;

/// Consumer of decoded broadcasts and catchup messages
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one message received on a channel
    async fn handle(&self, channel: &Channel, message: &MessageGeneral) -> HandlerResult<()>;
}

/// Handler that accepts and discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreHandler;

#[async_trait]
impl MessageHandler for IgnoreHandler {
    async fn handle(&self, _channel: &Channel, _message: &MessageGeneral) -> HandlerResult<()> {
        Ok(())
    }
}
