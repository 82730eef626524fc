//! Error types for consensus

use pop_network::{HandlerError, NetworkError};
use pop_protocol::{InstanceId, LaoId, MessageId, ProtocolError};
use thiserror::Error;

/// Result type for consensus operations
pub type ConsensusResult<T> = Result<T, ConsensusError>;

/// Consensus errors
#[derive(Error, Debug)]
pub enum ConsensusError {
    /// Acceptors of the LAO were never initialized
    #[error("No acceptors known for LAO {0}")]
    UnknownLao(LaoId),

    /// No elect was seen for the instance yet
    #[error("Unknown consensus instance {0}")]
    UnknownInstance(InstanceId),

    /// The elect a message refers to was not seen yet
    #[error("Unknown elect {message_id} for instance {instance_id}")]
    UnknownElect {
        /// Instance
        instance_id: InstanceId,
        /// Elect message id the message refers to
        message_id: MessageId,
    },

    /// Invalid argument to a registry operation
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Message rejected by the state machine
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// A learn contradicting the decision already made
    #[error("Conflicting decision for {instance_id}: decided {decided}, learned {learned}")]
    Conflict {
        /// Instance
        instance_id: InstanceId,
        /// Decision that stands
        decided: bool,
        /// Decision carried by the rejected learn
        learned: bool,
    },

    /// Operation not possible in the instance's current state
    #[error("Instance {instance_id} cannot {operation} in its current state")]
    InvalidState {
        /// Instance
        instance_id: InstanceId,
        /// What was attempted
        operation: &'static str,
    },

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Network error
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
}

impl ConsensusError {
    /// Whether the message may succeed once more messages were seen
    pub fn is_missing_dependency(&self) -> bool {
        matches!(
            self,
            Self::UnknownLao(_) | Self::UnknownInstance(_) | Self::UnknownElect { .. }
        )
    }
}

impl From<ConsensusError> for HandlerError {
    fn from(error: ConsensusError) -> Self {
        match error {
            e if e.is_missing_dependency() => HandlerError::MissingDependency(e.to_string()),
            e @ (ConsensusError::InvalidMessage(_)
            | ConsensusError::InvalidArgument(_)
            | ConsensusError::Conflict { .. }
            | ConsensusError::InvalidState { .. }
            | ConsensusError::Protocol(_)) => HandlerError::Invalid(e.to_string()),
            e => HandlerError::Internal(e.to_string()),
        }
    }
}
