//! Application data payloads
//!
//! The decoded `data` field of a signed message is a JSON object tagged by its
//! `object` and `action` fields. Decoding goes through a [`DataRegistry`],
//! a table from `(object, action)` to a decoder. Pairs nobody registered are
//! kept as [`Data::Application`] so the application layer can interpret them.

pub mod consensus;
pub mod lao;

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ProtocolError, ProtocolResult};

pub use consensus::{
    AcceptValue, ConsensusAccept, ConsensusElect, ConsensusElectAccept, ConsensusFailure,
    ConsensusKey, ConsensusLearn, ConsensusMessage, ConsensusPrepare, ConsensusPromise,
    ConsensusPropose, LearnValue, NO_TRY, PrepareValue, PromiseValue, ProposeValue,
};
pub use lao::{GreetLao, LaoMessage, PeerAddress};

/// The `object` value of consensus payloads
pub const CONSENSUS_OBJECT: &str = "consensus";
/// The `object` value of LAO payloads
pub const LAO_OBJECT: &str = "lao";

/// The `(object, action)` tag of a payload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataHeader {
    /// Object family
    pub object: String,
    /// Action within the family
    pub action: String,
}

impl DataHeader {
    /// Read the header out of a raw payload
    pub fn from_value(value: &Value) -> ProtocolResult<Self> {
        let field = |name: &'static str| {
            value
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_owned)
                .ok_or(ProtocolError::MissingHeader(name))
        };
        Ok(Self {
            object: field("object")?,
            action: field("action")?,
        })
    }
}

/// A decoded payload
#[derive(Debug, Clone, PartialEq)]
pub enum Data {
    /// Consensus protocol message
    Consensus(ConsensusMessage),
    /// LAO lifecycle message
    Lao(LaoMessage),
    /// Anything without a registered decoder, left for the application
    Application {
        /// Object family
        object: String,
        /// Action
        action: String,
        /// Full JSON payload, header included
        payload: Value,
    },
}

impl Data {
    /// The payload's header
    pub fn header(&self) -> DataHeader {
        let (object, action) = match self {
            Self::Consensus(message) => (CONSENSUS_OBJECT, message.action()),
            Self::Lao(message) => (LAO_OBJECT, message.action()),
            Self::Application { object, action, .. } => {
                return DataHeader {
                    object: object.clone(),
                    action: action.clone(),
                };
            }
        };
        DataHeader {
            object: object.to_owned(),
            action: action.to_owned(),
        }
    }

    /// Encode as a JSON object carrying `object` and `action`
    pub fn to_value(&self) -> ProtocolResult<Value> {
        let body = match self {
            Self::Consensus(message) => message.to_value()?,
            Self::Lao(message) => message.to_value()?,
            Self::Application { payload, .. } => return Ok(payload.clone()),
        };
        let header = self.header();
        let mut map = match body {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        map.insert("object".to_owned(), Value::String(header.object));
        map.insert("action".to_owned(), Value::String(header.action));
        Ok(Value::Object(map))
    }

    /// Encode as JSON bytes, the form that gets signed
    pub fn to_bytes(&self) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(&self.to_value()?)?)
    }
}

impl From<ConsensusMessage> for Data {
    fn from(message: ConsensusMessage) -> Self {
        Self::Consensus(message)
    }
}

impl From<LaoMessage> for Data {
    fn from(message: LaoMessage) -> Self {
        Self::Lao(message)
    }
}

/// Decoder for one `(object, action)` pair
pub type Decoder = fn(Value) -> serde_json::Result<Data>;

/// Dispatch table from `(object, action)` to a decoder
#[derive(Debug, Clone)]
pub struct DataRegistry {
    decoders: HashMap<(String, String), Decoder>,
}

impl DataRegistry {
    /// A registry with no decoders; every payload decodes as [`Data::Application`]
    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Register or replace the decoder of a pair
    pub fn register(&mut self, object: &str, action: &str, decoder: Decoder) {
        self.decoders
            .insert((object.to_owned(), action.to_owned()), decoder);
    }

    /// Whether a decoder exists for the pair
    pub fn is_registered(&self, object: &str, action: &str) -> bool {
        self.decoders
            .contains_key(&(object.to_owned(), action.to_owned()))
    }

    /// Decode a JSON payload
    pub fn decode_value(&self, value: Value) -> ProtocolResult<Data> {
        let header = DataHeader::from_value(&value)?;
        match self
            .decoders
            .get(&(header.object.clone(), header.action.clone()))
        {
            Some(decoder) => decoder(value).map_err(|e| ProtocolError::InvalidData {
                object: header.object,
                action: header.action,
                reason: e.to_string(),
            }),
            None => Ok(Data::Application {
                object: header.object,
                action: header.action,
                payload: value,
            }),
        }
    }

    /// Decode JSON bytes
    pub fn decode(&self, bytes: &[u8]) -> ProtocolResult<Data> {
        let value: Value = serde_json::from_slice(bytes)?;
        self.decode_value(value)
    }
}

impl Default for DataRegistry {
    fn default() -> Self {
        let consensus_actions: [(&str, Decoder); 11] = [
            ("elect", consensus_decoder::<ConsensusElect>),
            ("elect_accept", consensus_decoder::<ConsensusElectAccept>),
            ("prepare", consensus_decoder::<ConsensusPrepare>),
            ("promise", consensus_decoder::<ConsensusPromise>),
            ("propose", consensus_decoder::<ConsensusPropose>),
            ("accept", consensus_decoder::<ConsensusAccept>),
            ("learn", consensus_decoder::<ConsensusLearn>),
            ("failure", consensus_decoder::<ConsensusFailure>),
            ("phase_1_elect", consensus_decoder::<ConsensusElect>),
            ("phase_1_elect_accept", consensus_decoder::<ConsensusElectAccept>),
            ("phase_1_learn", consensus_decoder::<ConsensusLearn>),
        ];

        let mut registry = Self::empty();
        for (action, decoder) in consensus_actions {
            registry.register(CONSENSUS_OBJECT, action, decoder);
        }
        registry.register(LAO_OBJECT, "greet", greet_decoder);
        registry
    }
}

fn consensus_decoder<T>(value: Value) -> serde_json::Result<Data>
where
    T: DeserializeOwned + Into<ConsensusMessage>,
{
    let message: T = serde_json::from_value(value)?;
    Ok(Data::Consensus(message.into()))
}

fn greet_decoder(value: Value) -> serde_json::Result<Data> {
    let greet: GreetLao = serde_json::from_value(value)?;
    Ok(Data::Lao(LaoMessage::Greet(greet)))
}
