//! LAO payloads (`object = "lao"`)

use serde::{Deserialize, Serialize};

use crate::ids::LaoId;
use crate::keys::PublicKey;

/// Address of another server of the same LAO
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    /// Client-facing WebSocket address
    pub address: String,
}

/// Greeting a server sends on a LAO channel once a client subscribed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreetLao {
    /// LAO being greeted
    pub lao: LaoId,
    /// Key of the server's frontend
    pub frontend: PublicKey,
    /// Canonical address of the greeting server
    pub address: String,
    /// Other servers the client should also connect to
    #[serde(default)]
    pub peers: Vec<PeerAddress>,
}

impl GreetLao {
    /// Peer addresses as plain strings
    pub fn peer_addresses(&self) -> Vec<String> {
        self.peers.iter().map(|peer| peer.address.clone()).collect()
    }
}

/// Every LAO payload this crate understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaoMessage {
    /// `greet`
    Greet(GreetLao),
}

impl LaoMessage {
    /// Wire action
    pub fn action(&self) -> &'static str {
        match self {
            Self::Greet(_) => "greet",
        }
    }

    pub(crate) fn to_value(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            Self::Greet(greet) => serde_json::to_value(greet),
        }
    }
}
