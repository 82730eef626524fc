//! Network configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the message-delivery layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// How long a request waits for its answer, in milliseconds
    pub request_timeout_ms: u64,
    /// Delay before a message whose handling failed is re-injected, in milliseconds
    pub reprocess_delay_ms: u64,
    /// Failed handling attempts after which a message is quarantined, unbounded if unset
    pub max_reprocess_attempts: Option<u32>,
    /// Inbound envelopes buffered per observer
    ///
    /// An observer falling further behind than this loses the oldest
    /// envelopes: broadcasts are not handled and requests whose answer was
    /// skipped time out. Each loss is logged at `warn` with a running count.
    pub channel_capacity: usize,
}

impl NetworkConfig {
    /// Request timeout as a duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Reprocessing delay as a duration
    pub fn reprocess_delay(&self) -> Duration {
        Duration::from_millis(self.reprocess_delay_ms)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5000, // 5 seconds
            reprocess_delay_ms: 5000, // 5 seconds
            max_reprocess_attempts: None,
            channel_capacity: 1024,
        }
    }
}
