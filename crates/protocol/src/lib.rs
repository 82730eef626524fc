//! Wire protocol for LAO communication
//!
//! This crate defines everything that travels over a connection:
//! - Channels, the hierarchical topic paths messages are published on
//! - The JSON-RPC envelopes (queries, answers and broadcasts)
//! - Signed application messages and the hash used for their identifiers
//! - The `(object, action)` data payloads, decoded through a registry
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod base64url;
pub mod channel;
pub mod data;
pub mod error;
pub mod hash;
pub mod ids;
pub mod jsonrpc;
pub mod keys;
pub mod message;

pub use channel::Channel;
pub use data::{Data, DataHeader, DataRegistry};
pub use error::{ProtocolError, ProtocolResult};
pub use hash::hash;
pub use ids::{InstanceId, LaoId, MessageId};
pub use jsonrpc::{
    Answer, Broadcast, ErrorDetails, GenericMessage, Method, Params, Query, RequestId, ResultValue,
};
pub use keys::PublicKey;
pub use message::{MessageGeneral, WitnessSignature};
