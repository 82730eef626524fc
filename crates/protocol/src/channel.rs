//! Slash-delimited channel paths

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::LaoId;

const ROOT: &str = "/root";
const CONSENSUS: &str = "consensus";

/// A topic path of the form `/root/<laoId>/<subtopic>...`
///
/// Channels are immutable. Sub-channels are formed by appending segments,
/// and two channels are equal when their paths are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Channel(String);

impl Channel {
    /// The root channel
    pub fn root() -> Self {
        Self(ROOT.to_owned())
    }

    /// The channel of a LAO
    pub fn lao(lao_id: &LaoId) -> Self {
        Self(format!("{ROOT}/{lao_id}"))
    }

    /// The consensus channel of a LAO
    pub fn consensus(lao_id: &LaoId) -> Self {
        Self(format!("{ROOT}/{lao_id}/{CONSENSUS}"))
    }

    /// Append a segment
    pub fn subchannel(&self, segment: &str) -> ProtocolResult<Self> {
        if segment.is_empty() || segment.contains('/') {
            return Err(ProtocolError::InvalidChannel {
                path: format!("{}/{}", self.0, segment),
                reason: "segment must be non-empty and contain no '/'",
            });
        }
        Ok(Self(format!("{}/{}", self.0, segment)))
    }

    /// Segments after the leading slash, starting with `root`
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0[1..].split('/')
    }

    /// The LAO this channel belongs to, if any
    pub fn lao_id(&self) -> Option<LaoId> {
        self.segments().nth(1).map(LaoId::from)
    }

    /// Whether this is `/root`
    pub fn is_root(&self) -> bool {
        self.0 == ROOT
    }

    /// Whether this is the consensus channel of some LAO
    pub fn is_consensus(&self) -> bool {
        let segments: Vec<&str> = self.segments().collect();
        segments.len() == 3 && segments[2] == CONSENSUS
    }

    /// Borrow the path
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(path: &str) -> ProtocolResult<()> {
        if path != ROOT && !path.starts_with("/root/") {
            return Err(ProtocolError::InvalidChannel {
                path: path.to_owned(),
                reason: "must start with /root",
            });
        }
        if path[1..].split('/').any(str::is_empty) {
            return Err(ProtocolError::InvalidChannel {
                path: path.to_owned(),
                reason: "empty segment",
            });
        }
        Ok(())
    }
}

impl FromStr for Channel {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::validate(s)?;
        Ok(Self(s.to_owned()))
    }
}

impl TryFrom<String> for Channel {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::validate(&value)?;
        Ok(Self(value))
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
