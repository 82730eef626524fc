//! JSON-RPC envelopes
//!
//! Three shapes travel over a connection: queries sent by the client,
//! answers correlated to them by request id, and broadcasts pushed by the
//! server for subscribed channels. [`GenericMessage`] is the closed union of
//! the three and is what connections decode frames into.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::channel::Channel;
use crate::error::{ProtocolError, ProtocolResult};
use crate::message::MessageGeneral;

/// Protocol version tag carried by every envelope
pub const JSON_RPC_VERSION: &str = "2.0";

const BROADCAST_METHOD: &str = "broadcast";

/// Identifier correlating a query with its answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Query methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    /// Start receiving broadcasts for a channel
    Subscribe,
    /// Stop receiving broadcasts for a channel
    Unsubscribe,
    /// Publish a message on a channel
    Publish,
    /// Fetch the backlog of a channel
    Catchup,
}

impl Method {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Publish => "publish",
            Self::Catchup => "catchup",
        }
    }

    fn parse(method: &str) -> ProtocolResult<Self> {
        match method {
            "subscribe" => Ok(Self::Subscribe),
            "unsubscribe" => Ok(Self::Unsubscribe),
            "publish" => Ok(Self::Publish),
            "catchup" => Ok(Self::Catchup),
            other => Err(ProtocolError::UnknownMethod(other.to_owned())),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of queries and broadcasts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    /// Target channel
    pub channel: Channel,
    /// Carried message, for publish and broadcast
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<MessageGeneral>,
}

/// A client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    /// Correlation id, assigned when the query is sent
    pub id: RequestId,
    /// Method
    pub method: Method,
    /// Parameters
    pub params: Params,
}

impl Query {
    /// Subscribe to a channel
    pub fn subscribe(channel: Channel) -> Self {
        Self::without_message(Method::Subscribe, channel)
    }

    /// Unsubscribe from a channel
    pub fn unsubscribe(channel: Channel) -> Self {
        Self::without_message(Method::Unsubscribe, channel)
    }

    /// Fetch the backlog of a channel
    pub fn catchup(channel: Channel) -> Self {
        Self::without_message(Method::Catchup, channel)
    }

    /// Publish a message on a channel
    pub fn publish(channel: Channel, message: MessageGeneral) -> Self {
        Self {
            id: RequestId(0),
            method: Method::Publish,
            params: Params {
                channel,
                message: Some(message),
            },
        }
    }

    /// The same query under another id
    pub fn with_id(mut self, id: RequestId) -> Self {
        self.id = id;
        self
    }

    fn without_message(method: Method, channel: Channel) -> Self {
        Self {
            id: RequestId(0),
            method,
            params: Params {
                channel,
                message: None,
            },
        }
    }
}

/// Successful answer payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResultValue {
    /// Status code, `0` on success
    Integer(i64),
    /// Messages returned by catchup
    Messages(Vec<MessageGeneral>),
}

/// Error answer payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Error code
    pub code: i64,
    /// Human readable description
    pub description: String,
}

/// The server's reply to a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    /// Id of the query being answered
    pub id: RequestId,
    /// Exactly one of result or error
    pub result: Result<ResultValue, ErrorDetails>,
}

impl Answer {
    /// A successful answer
    pub fn success(id: RequestId, value: ResultValue) -> Self {
        Self {
            id,
            result: Ok(value),
        }
    }

    /// An error answer
    pub fn error(id: RequestId, code: i64, description: impl Into<String>) -> Self {
        Self {
            id,
            result: Err(ErrorDetails {
                code,
                description: description.into(),
            }),
        }
    }
}

/// A message pushed by the server on a subscribed channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broadcast {
    /// Channel the message was published on
    pub channel: Channel,
    /// The message
    pub message: MessageGeneral,
}

/// Any envelope that can travel over a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawMessage", into = "RawMessage")]
pub enum GenericMessage {
    /// Client request
    Query(Query),
    /// Server reply
    Answer(Answer),
    /// Server push
    Broadcast(Broadcast),
}

impl GenericMessage {
    /// Decode a text frame
    pub fn from_json(text: &str) -> ProtocolResult<Self> {
        let raw: RawMessage = serde_json::from_str(text)?;
        raw.try_into()
    }

    /// Encode as a text frame
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(&RawMessage::from(self.clone()))?)
    }
}

impl From<Query> for GenericMessage {
    fn from(query: Query) -> Self {
        Self::Query(query)
    }
}

impl From<Answer> for GenericMessage {
    fn from(answer: Answer) -> Self {
        Self::Answer(answer)
    }
}

impl From<Broadcast> for GenericMessage {
    fn from(broadcast: Broadcast) -> Self {
        Self::Broadcast(broadcast)
    }
}

/// Flat wire form shared by every envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawMessage {
    jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    params: Option<Params>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<ResultValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorDetails>,
}

impl TryFrom<RawMessage> for GenericMessage {
    type Error = ProtocolError;

    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        if raw.jsonrpc != JSON_RPC_VERSION {
            return Err(ProtocolError::InvalidEnvelope(format!(
                "unsupported jsonrpc version '{}'",
                raw.jsonrpc
            )));
        }

        match raw.method {
            Some(method) if method == BROADCAST_METHOD => {
                let params = raw.params.ok_or_else(|| {
                    ProtocolError::InvalidEnvelope("broadcast without params".to_owned())
                })?;
                let message = params.message.ok_or_else(|| {
                    ProtocolError::InvalidEnvelope("broadcast without message".to_owned())
                })?;
                Ok(Self::Broadcast(Broadcast {
                    channel: params.channel,
                    message,
                }))
            }
            Some(method) => {
                let method = Method::parse(&method)?;
                let id = raw.id.ok_or_else(|| {
                    ProtocolError::InvalidEnvelope(format!("{method} query without id"))
                })?;
                let params = raw.params.ok_or_else(|| {
                    ProtocolError::InvalidEnvelope(format!("{method} query without params"))
                })?;
                if method == Method::Publish && params.message.is_none() {
                    return Err(ProtocolError::InvalidEnvelope(
                        "publish query without message".to_owned(),
                    ));
                }
                Ok(Self::Query(Query { id, method, params }))
            }
            None => {
                let id = raw.id.ok_or_else(|| {
                    ProtocolError::InvalidEnvelope("answer without id".to_owned())
                })?;
                let result = match (raw.result, raw.error) {
                    (Some(value), None) => Ok(value),
                    (None, Some(error)) => Err(error),
                    (Some(_), Some(_)) => {
                        return Err(ProtocolError::InvalidEnvelope(
                            "answer carries both result and error".to_owned(),
                        ));
                    }
                    (None, None) => {
                        return Err(ProtocolError::InvalidEnvelope(
                            "answer carries neither result nor error".to_owned(),
                        ));
                    }
                };
                Ok(Self::Answer(Answer { id, result }))
            }
        }
    }
}

impl From<GenericMessage> for RawMessage {
    fn from(message: GenericMessage) -> Self {
        let mut raw = RawMessage {
            jsonrpc: JSON_RPC_VERSION.to_owned(),
            method: None,
            id: None,
            params: None,
            result: None,
            error: None,
        };
        match message {
            GenericMessage::Query(query) => {
                raw.method = Some(query.method.as_str().to_owned());
                raw.id = Some(query.id);
                raw.params = Some(query.params);
            }
            GenericMessage::Answer(answer) => {
                raw.id = Some(answer.id);
                match answer.result {
                    Ok(value) => raw.result = Some(value),
                    Err(error) => raw.error = Some(error),
                }
            }
            GenericMessage::Broadcast(broadcast) => {
                raw.method = Some(BROADCAST_METHOD.to_owned());
                raw.params = Some(Params {
                    channel: broadcast.channel,
                    message: Some(broadcast.message),
                });
            }
        }
        raw
    }
}
