//! Message handler routing consensus payloads to the registry

use std::sync::Arc;

use async_trait::async_trait;
use pop_network::{HandlerError, HandlerResult, MessageHandler};
use pop_protocol::data::{CONSENSUS_OBJECT, ConsensusKey, ConsensusMessage, DataRegistry};
use pop_protocol::{Channel, InstanceId, LaoId, MessageGeneral};
use tracing::{debug, warn};

use crate::envelope::ConsensusEnvelope;
use crate::error::ConsensusResult;
use crate::registry::ConsensusRegistry;

/// A consensus payload the local node has to publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    /// LAO whose consensus channel the payload goes to
    pub lao: LaoId,
    /// The payload
    pub message: ConsensusMessage,
}

/// Feeds consensus messages to the registry and everything else to `inner`
///
/// Replies of the registry are pushed to an outbox drained by a
/// [`crate::ConsensusPublisher`].
pub struct ConsensusHandler {
    registry: Arc<ConsensusRegistry>,
    data: DataRegistry,
    inner: Arc<dyn MessageHandler>,
    outbox: flume::Sender<Outgoing>,
}

impl ConsensusHandler {
    /// Create a handler and the receiving end of its outbox
    pub fn new(
        registry: Arc<ConsensusRegistry>,
        inner: Arc<dyn MessageHandler>,
    ) -> (Self, flume::Receiver<Outgoing>) {
        let (outbox, receiver) = flume::unbounded();
        let handler = Self {
            registry,
            data: DataRegistry::default(),
            inner,
            outbox,
        };
        (handler, receiver)
    }

    /// The registry
    pub fn registry(&self) -> &Arc<ConsensusRegistry> {
        &self.registry
    }

    /// Propose `decision` for `key` and queue the elect
    pub fn start(
        &self,
        lao: LaoId,
        key: ConsensusKey,
        value: impl Into<String>,
        created_at: i64,
        decision: bool,
    ) -> ConsensusResult<InstanceId> {
        let elect = self
            .registry
            .start(lao.clone(), key, value, created_at, decision)?;
        let instance_id = elect.instance_id.clone();
        self.submit(&lao, vec![elect.into()]);
        Ok(instance_id)
    }

    /// Prepare a local proposal again and queue the prepare
    pub fn retry(&self, instance_id: &InstanceId) -> ConsensusResult<()> {
        let prepare = self.registry.retry(instance_id)?;
        let lao = self
            .registry
            .with_instance(instance_id, |instance| instance.lao().clone());
        if let Some(lao) = lao {
            self.submit(&lao, vec![prepare.into()]);
        }
        Ok(())
    }

    fn submit(&self, lao: &LaoId, messages: Vec<ConsensusMessage>) {
        for message in messages {
            debug!("Queueing {} for {}", message.action(), message.instance_id());
            let outgoing = Outgoing {
                lao: lao.clone(),
                message,
            };
            if self.outbox.send(outgoing).is_err() {
                warn!("Consensus outbox closed, dropping reply");
            }
        }
    }
}

#[async_trait]
impl MessageHandler for ConsensusHandler {
    async fn handle(&self, channel: &Channel, message: &MessageGeneral) -> HandlerResult<()> {
        let header = message
            .data_header()
            .map_err(|e| HandlerError::Invalid(e.to_string()))?;
        if header.object != CONSENSUS_OBJECT {
            return self.inner.handle(channel, message).await;
        }

        let envelope = ConsensusEnvelope::decode(channel, message, &self.data)?;
        let replies = self.registry.dispatch(&envelope)?;
        self.submit(&envelope.lao, replies);
        Ok(())
    }
}
