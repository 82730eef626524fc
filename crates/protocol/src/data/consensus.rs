//! Consensus payloads (`object = "consensus"`)
//!
//! Every message after `elect` refers to its instance through `instance_id`
//! and to the `elect` message that opened it through `message_id`.

use serde::{Deserialize, Serialize};

use crate::ids::{InstanceId, MessageId};
use crate::keys::PublicKey;

/// Try number carried when nothing has been accepted yet
pub const NO_TRY: i64 = -1;

/// The `(type, id, property)` triple a consensus instance decides on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsensusKey {
    /// Kind of object, e.g. `election`
    #[serde(rename = "type")]
    pub object_type: String,
    /// Object identifier
    pub id: String,
    /// Property of the object being decided
    #[serde(rename = "name")]
    pub property: String,
}

impl ConsensusKey {
    /// Build a key
    pub fn new(
        object_type: impl Into<String>,
        id: impl Into<String>,
        property: impl Into<String>,
    ) -> Self {
        Self {
            object_type: object_type.into(),
            id: id.into(),
            property: property.into(),
        }
    }
}

/// Opens an instance: a node nominates itself as proposer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusElect {
    /// Hash of `("consensus", created_at, type, id, property, value)`
    pub instance_id: InstanceId,
    /// Unix seconds
    pub created_at: i64,
    /// What is being decided
    pub key: ConsensusKey,
    /// Proposed value for the key
    pub value: String,
}

impl ConsensusElect {
    /// Build an elect message, deriving its instance id
    pub fn new(key: ConsensusKey, value: impl Into<String>, created_at: i64) -> Self {
        let value = value.into();
        let instance_id = Self::derive_instance_id(&key, &value, created_at);
        Self {
            instance_id,
            created_at,
            key,
            value,
        }
    }

    /// Recompute the instance id from the message fields
    pub fn derive_instance_id(key: &ConsensusKey, value: &str, created_at: i64) -> InstanceId {
        let created_at = created_at.to_string();
        InstanceId::from_parts([
            "consensus",
            created_at.as_str(),
            key.object_type.as_str(),
            key.id.as_str(),
            key.property.as_str(),
            value,
        ])
    }

    /// Whether the carried instance id matches the message fields
    pub fn has_valid_instance_id(&self) -> bool {
        self.instance_id == Self::derive_instance_id(&self.key, &self.value, self.created_at)
    }
}

/// An acceptor's answer to an elect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusElectAccept {
    /// Instance
    pub instance_id: InstanceId,
    /// Id of the elect being answered
    pub message_id: MessageId,
    /// Whether the acceptor supports the proposer
    pub accept: bool,
}

/// Value of a prepare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrepareValue {
    /// Try the proposer asks promises for
    pub proposed_try: i64,
}

/// Phase one request from a proposer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusPrepare {
    /// Instance
    pub instance_id: InstanceId,
    /// Elect message id
    pub message_id: MessageId,
    /// Unix seconds
    pub created_at: i64,
    /// Prepared try
    pub value: PrepareValue,
}

/// Value of a promise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PromiseValue {
    /// Highest try this acceptor accepted, or [`NO_TRY`]
    pub accepted_try: i64,
    /// Value accepted at `accepted_try`
    pub accepted_value: bool,
    /// Try being promised
    pub promised_try: i64,
}

impl PromiseValue {
    /// The accepted try and value, if anything was accepted
    pub fn accepted(&self) -> Option<(i64, bool)> {
        (self.accepted_try != NO_TRY).then_some((self.accepted_try, self.accepted_value))
    }
}

/// Phase one answer from an acceptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusPromise {
    /// Instance
    pub instance_id: InstanceId,
    /// Elect message id
    pub message_id: MessageId,
    /// Unix seconds
    pub created_at: i64,
    /// Promise contents
    pub value: PromiseValue,
}

/// Value of a propose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProposeValue {
    /// Try of the proposal
    pub proposed_try: i64,
    /// Proposed decision
    pub proposed_value: bool,
}

/// Phase two request from a proposer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusPropose {
    /// Instance
    pub instance_id: InstanceId,
    /// Elect message id
    pub message_id: MessageId,
    /// Unix seconds
    pub created_at: i64,
    /// Proposal
    pub value: ProposeValue,
    /// Acceptors whose promises back this proposal
    #[serde(rename = "acceptor-signatures", default)]
    pub acceptor_signatures: Vec<PublicKey>,
}

/// Value of an accept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AcceptValue {
    /// Accepted try
    pub accepted_try: i64,
    /// Accepted decision
    pub accepted_value: bool,
}

/// Phase two answer from an acceptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusAccept {
    /// Instance
    pub instance_id: InstanceId,
    /// Elect message id
    pub message_id: MessageId,
    /// Unix seconds
    pub created_at: i64,
    /// Accepted proposal
    pub value: AcceptValue,
}

/// Value of a learn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LearnValue {
    /// Decided value
    pub decision: bool,
}

/// Announces the decision of an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusLearn {
    /// Instance
    pub instance_id: InstanceId,
    /// Elect message id
    pub message_id: MessageId,
    /// Unix seconds
    pub created_at: i64,
    /// Decision
    pub value: LearnValue,
    /// Acceptors that accepted the decided value
    #[serde(rename = "acceptor-signatures", default)]
    pub acceptor_signatures: Vec<PublicKey>,
}

/// Announces that an instance ended without a decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusFailure {
    /// Instance
    pub instance_id: InstanceId,
    /// Elect message id
    pub message_id: MessageId,
    /// Unix seconds
    pub created_at: i64,
}

/// Every consensus payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusMessage {
    /// `elect`
    Elect(ConsensusElect),
    /// `elect_accept`
    ElectAccept(ConsensusElectAccept),
    /// `prepare`
    Prepare(ConsensusPrepare),
    /// `promise`
    Promise(ConsensusPromise),
    /// `propose`
    Propose(ConsensusPropose),
    /// `accept`
    Accept(ConsensusAccept),
    /// `learn`
    Learn(ConsensusLearn),
    /// `failure`
    Failure(ConsensusFailure),
}

impl ConsensusMessage {
    /// Instance the message belongs to
    pub fn instance_id(&self) -> &InstanceId {
        match self {
            Self::Elect(m) => &m.instance_id,
            Self::ElectAccept(m) => &m.instance_id,
            Self::Prepare(m) => &m.instance_id,
            Self::Promise(m) => &m.instance_id,
            Self::Propose(m) => &m.instance_id,
            Self::Accept(m) => &m.instance_id,
            Self::Learn(m) => &m.instance_id,
            Self::Failure(m) => &m.instance_id,
        }
    }

    /// Canonical wire action
    pub fn action(&self) -> &'static str {
        match self {
            Self::Elect(_) => "elect",
            Self::ElectAccept(_) => "elect_accept",
            Self::Prepare(_) => "prepare",
            Self::Promise(_) => "promise",
            Self::Propose(_) => "propose",
            Self::Accept(_) => "accept",
            Self::Learn(_) => "learn",
            Self::Failure(_) => "failure",
        }
    }

    /// Id of the elect message this message refers to, absent for the elect itself
    pub fn elect_message_id(&self) -> Option<&MessageId> {
        match self {
            Self::Elect(_) => None,
            Self::ElectAccept(m) => Some(&m.message_id),
            Self::Prepare(m) => Some(&m.message_id),
            Self::Promise(m) => Some(&m.message_id),
            Self::Propose(m) => Some(&m.message_id),
            Self::Accept(m) => Some(&m.message_id),
            Self::Learn(m) => Some(&m.message_id),
            Self::Failure(m) => Some(&m.message_id),
        }
    }

    pub(crate) fn to_value(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            Self::Elect(m) => serde_json::to_value(m),
            Self::ElectAccept(m) => serde_json::to_value(m),
            Self::Prepare(m) => serde_json::to_value(m),
            Self::Promise(m) => serde_json::to_value(m),
            Self::Propose(m) => serde_json::to_value(m),
            Self::Accept(m) => serde_json::to_value(m),
            Self::Learn(m) => serde_json::to_value(m),
            Self::Failure(m) => serde_json::to_value(m),
        }
    }
}

macro_rules! impl_from_payload {
    ($($variant:ident => $payload:ty),* $(,)?) => {
        $(
            impl From<$payload> for ConsensusMessage {
                fn from(message: $payload) -> Self {
                    Self::$variant(message)
                }
            }
        )*
    };
}

impl_from_payload!(
    Elect => ConsensusElect,
    ElectAccept => ConsensusElectAccept,
    Prepare => ConsensusPrepare,
    Promise => ConsensusPromise,
    Propose => ConsensusPropose,
    Accept => ConsensusAccept,
    Learn => ConsensusLearn,
    Failure => ConsensusFailure,
);
