//! Publishing of the consensus replies of the local node

use std::sync::Arc;

use ed25519_dalek::SigningKey;
use pop_network::NetworkManager;
use pop_protocol::Channel;
use pop_transport::Transport;
use tracing::{debug, warn};

use crate::envelope::sign;
use crate::error::ConsensusResult;
use crate::handler::Outgoing;

/// Signs queued consensus payloads and publishes them on their LAO's consensus channel
pub struct ConsensusPublisher<T>
where
    T: Transport,
{
    manager: Arc<NetworkManager<T>>,
    signing_key: SigningKey,
}

impl<T> ConsensusPublisher<T>
where
    T: Transport,
{
    /// Create a publisher signing with `signing_key`
    pub fn new(manager: Arc<NetworkManager<T>>, signing_key: SigningKey) -> Self {
        Self {
            manager,
            signing_key,
        }
    }

    /// Drain `outbox` in the background until the manager shuts down
    pub fn spawn(self, outbox: flume::Receiver<Outgoing>) {
        let manager = self.manager.clone();
        manager.spawn(async move {
            while let Ok(outgoing) = outbox.recv_async().await {
                if let Err(e) = self.publish(outgoing).await {
                    warn!("Failed to publish consensus message: {}", e);
                }
            }
            debug!("Consensus outbox closed");
        });
    }

    /// Sign and publish one payload
    pub async fn publish(&self, outgoing: Outgoing) -> ConsensusResult<()> {
        let action = outgoing.message.action();
        let message = sign(&self.signing_key, outgoing.message)?;
        let channel = Channel::consensus(&outgoing.lao);

        debug!("Publishing {} {} on {}", action, message.message_id, channel);
        self.manager.publish(channel, message).await?;
        Ok(())
    }
}
