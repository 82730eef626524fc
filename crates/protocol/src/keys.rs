//! Participant identities

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};

use crate::base64url;
use crate::error::{ProtocolError, ProtocolResult};

/// An Ed25519 public key in URL-safe base64, used as a participant identity
///
/// Keys are validated on construction, so a `PublicKey` always decodes to a
/// point on the curve.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicKey(String);

impl PublicKey {
    /// Encode a verifying key
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        Self(base64url::encode(key.as_bytes()))
    }

    /// Decode into a verifying key
    pub fn to_verifying_key(&self) -> ProtocolResult<VerifyingKey> {
        Self::decode(&self.0)
    }

    /// Borrow the encoded key
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn decode(encoded: &str) -> ProtocolResult<VerifyingKey> {
        let bytes = base64url::decode(encoded)
            .map_err(|_| ProtocolError::InvalidPublicKey(encoded.to_owned()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ProtocolError::InvalidPublicKey(encoded.to_owned()))?;
        VerifyingKey::from_bytes(&bytes)
            .map_err(|_| ProtocolError::InvalidPublicKey(encoded.to_owned()))
    }
}

impl FromStr for PublicKey {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(ProtocolError::InvalidPublicKey(s.to_owned()));
        }
        let key = Self::decode(trimmed)?;
        Ok(Self::from_verifying_key(&key))
    }
}

impl TryFrom<String> for PublicKey {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PublicKey> for String {
    fn from(key: PublicKey) -> Self {
        key.0
    }
}

impl From<&VerifyingKey> for PublicKey {
    fn from(key: &VerifyingKey) -> Self {
        Self::from_verifying_key(key)
    }
}

impl AsRef<str> for PublicKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
