//! Signed application messages

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use serde::{Deserialize, Serialize};

use crate::base64url;
use crate::data::{Data, DataHeader, DataRegistry};
use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::MessageId;
use crate::keys::PublicKey;

/// A witness co-signature of a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WitnessSignature {
    /// Witness key
    pub witness: PublicKey,
    /// Signature over the message id
    pub signature: String,
}

/// A signed message as carried by publish, broadcast and catchup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageGeneral {
    /// URL-safe base64 of the JSON payload
    pub data: String,
    /// Author
    pub sender: PublicKey,
    /// URL-safe base64 of the Ed25519 signature over the payload bytes
    pub signature: String,
    /// `Hash(data, signature)`
    pub message_id: MessageId,
    /// Witness co-signatures
    #[serde(default)]
    pub witness_signatures: Vec<WitnessSignature>,
}

impl MessageGeneral {
    /// Sign a payload
    pub fn new(signing_key: &SigningKey, data: &Data) -> ProtocolResult<Self> {
        let bytes = data.to_bytes()?;
        let signature = signing_key.sign(&bytes);

        let data = base64url::encode(&bytes);
        let signature = base64url::encode(signature.to_bytes());
        let message_id = MessageId::from_parts([data.as_str(), signature.as_str()]);

        Ok(Self {
            data,
            sender: PublicKey::from_verifying_key(&signing_key.verifying_key()),
            signature,
            message_id,
            witness_signatures: Vec::new(),
        })
    }

    /// Check the signature against the sender and the id against the contents
    pub fn verify(&self) -> ProtocolResult<()> {
        let expected = MessageId::from_parts([self.data.as_str(), self.signature.as_str()]);
        if expected != self.message_id {
            return Err(ProtocolError::MessageIdMismatch {
                expected: expected.to_string(),
                actual: self.message_id.to_string(),
            });
        }

        let invalid = || ProtocolError::InvalidSignature(self.message_id.to_string());
        let key = self.sender.to_verifying_key()?;
        let signature_bytes = base64url::decode(&self.signature).map_err(|_| invalid())?;
        let signature = Signature::from_slice(&signature_bytes).map_err(|_| invalid())?;
        key.verify(&self.raw_data()?, &signature)
            .map_err(|_| invalid())
    }

    /// The payload bytes
    pub fn raw_data(&self) -> ProtocolResult<Vec<u8>> {
        base64url::decode(&self.data)
    }

    /// Decode the payload through a registry
    pub fn decoded_data(&self, registry: &DataRegistry) -> ProtocolResult<Data> {
        registry.decode(&self.raw_data()?)
    }

    /// Read only the payload's `(object, action)` header
    pub fn data_header(&self) -> ProtocolResult<DataHeader> {
        let value: serde_json::Value = serde_json::from_slice(&self.raw_data()?)?;
        DataHeader::from_value(&value)
    }
}
