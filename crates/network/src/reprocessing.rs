//! Delayed re-injection of messages whose dependencies were missing

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use pop_protocol::{Broadcast, GenericMessage, MessageId};
use pop_transport::Transport;
use tracing::{debug, error};

use crate::multiplexer::Multiplexer;

/// Re-injects broadcasts into the inbound stream after a delay
///
/// Retries are unbounded unless `max_attempts` is set, in which case a
/// message is quarantined once it failed that many times.
pub struct ReprocessingQueue<T>
where
    T: Transport,
{
    multiplexer: Arc<Multiplexer<T>>,
    delay: Duration,
    max_attempts: Option<u32>,
    /// Failed attempts per message
    attempts: DashMap<MessageId, u32>,
    quarantine: DashMap<MessageId, Broadcast>,
}

impl<T> ReprocessingQueue<T>
where
    T: Transport,
{
    /// Create a queue re-injecting through `multiplexer`
    pub fn new(multiplexer: Arc<Multiplexer<T>>, delay: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            multiplexer,
            delay,
            max_attempts,
            attempts: DashMap::new(),
            quarantine: DashMap::new(),
        }
    }

    /// Record a failed attempt and schedule the broadcast again
    ///
    /// Returns `false` when the message was quarantined instead.
    pub fn requeue(&self, broadcast: Broadcast) -> bool {
        let id = broadcast.message.message_id.clone();
        let attempts = {
            let mut entry = self.attempts.entry(id.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        if let Some(max) = self.max_attempts {
            if attempts >= max {
                error!(
                    "Quarantining message {} on {} after {} failed attempts",
                    id, broadcast.channel, attempts
                );
                self.attempts.remove(&id);
                self.quarantine.insert(id, broadcast);
                return false;
            }
        }

        debug!(
            "Requeueing message {} on {} in {:?} (attempt {})",
            id, broadcast.channel, self.delay, attempts
        );
        let multiplexer = self.multiplexer.clone();
        let delay = self.delay;
        self.multiplexer.spawn(async move {
            tokio::time::sleep(delay).await;
            multiplexer.inject(GenericMessage::Broadcast(broadcast));
        });
        true
    }

    /// Forget the attempts of a message that was handled
    pub fn settle(&self, id: &MessageId) {
        self.attempts.remove(id);
    }

    /// Failed attempts recorded for a message still being retried
    pub fn attempts(&self, id: &MessageId) -> u32 {
        self.attempts.get(id).map(|entry| *entry).unwrap_or(0)
    }

    /// Messages that exhausted their attempts
    pub fn quarantined(&self) -> Vec<Broadcast> {
        self.quarantine
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Re-injection delay
    pub fn delay(&self) -> Duration {
        self.delay
    }
}
