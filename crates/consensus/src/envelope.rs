//! Consensus payloads together with the signed message that carried them

use ed25519_dalek::SigningKey;
use pop_protocol::data::{ConsensusMessage, Data, DataRegistry};
use pop_protocol::{Channel, LaoId, MessageGeneral, MessageId, PublicKey};

use crate::error::{ConsensusError, ConsensusResult};

/// A consensus payload and what its envelope says about it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusEnvelope {
    /// LAO the message was published in
    pub lao: LaoId,
    /// Signer of the message
    pub sender: PublicKey,
    /// Id of the signed message
    pub message_id: MessageId,
    /// The payload
    pub message: ConsensusMessage,
}

impl ConsensusEnvelope {
    /// Verify a signed message received on `channel` and decode its consensus payload
    pub fn decode(
        channel: &Channel,
        message: &MessageGeneral,
        registry: &DataRegistry,
    ) -> ConsensusResult<Self> {
        let lao = channel.lao_id().ok_or_else(|| {
            ConsensusError::InvalidMessage(format!("{channel} does not belong to a LAO"))
        })?;
        message.verify()?;

        match message.decoded_data(registry)? {
            Data::Consensus(payload) => Ok(Self {
                lao,
                sender: message.sender.clone(),
                message_id: message.message_id.clone(),
                message: payload,
            }),
            other => {
                let header = other.header();
                Err(ConsensusError::InvalidMessage(format!(
                    "expected a consensus payload, got {}/{}",
                    header.object, header.action
                )))
            }
        }
    }
}

/// Sign a consensus payload
pub fn sign(signing_key: &SigningKey, message: ConsensusMessage) -> ConsensusResult<MessageGeneral> {
    Ok(MessageGeneral::new(signing_key, &Data::Consensus(message))?)
}
