//! Consensus instances of every LAO the node takes part in

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use pop_protocol::data::{ConsensusElect, ConsensusKey, ConsensusMessage, ConsensusPrepare};
use pop_protocol::{InstanceId, LaoId, PublicKey};
use tracing::{debug, info};

use crate::envelope::ConsensusEnvelope;
use crate::error::{ConsensusError, ConsensusResult};
use crate::instance::{ApproveAll, ConsensusInstance, ElectApprover, InstanceState, LocalNode};

/// Owns the state machine of every known instance
///
/// Instances are created lazily by the first elect seen for them, or by
/// [`ConsensusRegistry::start`] for a local proposal. Settled instances are
/// kept so that late or duplicated messages find their decision.
pub struct ConsensusRegistry {
    identity: PublicKey,
    approver: Arc<dyn ElectApprover>,
    acceptors: DashMap<LaoId, Arc<BTreeSet<PublicKey>>>,
    instances: DashMap<InstanceId, ConsensusInstance>,
}

impl ConsensusRegistry {
    /// Create a registry for the node identified by `identity`
    pub fn new(identity: PublicKey) -> Self {
        Self {
            identity,
            approver: Arc::new(ApproveAll),
            acceptors: DashMap::new(),
            instances: DashMap::new(),
        }
    }

    /// Use `approver` to answer elects
    pub fn with_approver(mut self, approver: Arc<dyn ElectApprover>) -> Self {
        self.approver = approver;
        self
    }

    /// Identity of the local node
    pub fn identity(&self) -> &PublicKey {
        &self.identity
    }

    /// Set the acceptors of a LAO
    ///
    /// Instances already created keep the acceptors they were created with.
    pub fn init_acceptors<I, S>(&self, lao: LaoId, acceptors: I) -> ConsensusResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let acceptors = acceptors
            .into_iter()
            .map(|key| {
                key.as_ref().parse::<PublicKey>().map_err(|_| {
                    ConsensusError::InvalidArgument(format!(
                        "invalid acceptor identity '{}'",
                        key.as_ref()
                    ))
                })
            })
            .collect::<ConsensusResult<BTreeSet<PublicKey>>>()?;
        if acceptors.is_empty() {
            return Err(ConsensusError::InvalidArgument(format!(
                "no acceptors for LAO {lao}"
            )));
        }

        info!("LAO {} has {} acceptors", lao, acceptors.len());
        self.acceptors.insert(lao, Arc::new(acceptors));
        Ok(())
    }

    /// Acceptors of a LAO
    pub fn acceptors(&self, lao: &LaoId) -> Option<Vec<PublicKey>> {
        self.acceptors
            .get(lao)
            .map(|acceptors| acceptors.iter().cloned().collect())
    }

    /// Begin a local proposal, returning the elect to publish
    pub fn start(
        &self,
        lao: LaoId,
        key: ConsensusKey,
        value: impl Into<String>,
        created_at: i64,
        decision: bool,
    ) -> ConsensusResult<ConsensusElect> {
        let acceptors = self.acceptors_of(&lao)?;
        let elect = ConsensusElect::new(key, value, created_at);

        let mut instance = self
            .instances
            .entry(elect.instance_id.clone())
            .or_insert_with(|| ConsensusInstance::new(lao, elect.clone(), acceptors));
        instance.propose(decision)?;

        info!(
            "Proposing {} for {:?} on {}",
            decision, elect.key, elect.instance_id
        );
        Ok(elect)
    }

    /// Feed a received message to its instance
    ///
    /// Returns the messages the local node has to publish in response.
    pub fn dispatch(&self, envelope: &ConsensusEnvelope) -> ConsensusResult<Vec<ConsensusMessage>> {
        let acceptors = self.acceptors_of(&envelope.lao)?;
        let instance_id = envelope.message.instance_id();

        let mut instance = match &envelope.message {
            ConsensusMessage::Elect(elect) => {
                if !elect.has_valid_instance_id() {
                    return Err(ConsensusError::InvalidMessage(format!(
                        "elect {} carries instance id {} not matching its contents",
                        envelope.message_id, elect.instance_id
                    )));
                }
                self.instances
                    .entry(instance_id.clone())
                    .or_insert_with(|| {
                        debug!("New consensus instance {}", instance_id);
                        ConsensusInstance::new(envelope.lao.clone(), elect.clone(), acceptors)
                    })
            }
            _ => self
                .instances
                .get_mut(instance_id)
                .ok_or_else(|| ConsensusError::UnknownInstance(instance_id.clone()))?,
        };

        let node = LocalNode {
            identity: &self.identity,
            approver: self.approver.as_ref(),
            now: unix_now(),
        };
        let outputs = instance.handle(&node, envelope)?;
        debug!(
            "{} {} from {} on {}: {:?}, {} replies",
            envelope.message.action(),
            envelope.message_id,
            envelope.sender,
            instance_id,
            instance.state(),
            outputs.len()
        );
        Ok(outputs)
    }

    /// Prepare a local proposal again with a higher try
    pub fn retry(&self, instance_id: &InstanceId) -> ConsensusResult<ConsensusPrepare> {
        self.instances
            .get_mut(instance_id)
            .ok_or_else(|| ConsensusError::UnknownInstance(instance_id.clone()))?
            .retry(unix_now())
    }

    /// Decision of an instance, once learned
    pub fn decision(&self, instance_id: &InstanceId) -> Option<bool> {
        self.instances.get(instance_id).and_then(|i| i.decision())
    }

    /// State of an instance
    pub fn state(&self, instance_id: &InstanceId) -> Option<InstanceState> {
        self.instances.get(instance_id).map(|i| i.state())
    }

    /// Inspect an instance
    pub fn with_instance<R>(
        &self,
        instance_id: &InstanceId,
        f: impl FnOnce(&ConsensusInstance) -> R,
    ) -> Option<R> {
        self.instances.get(instance_id).map(|i| f(&i))
    }

    /// Ids of every known instance
    pub fn instances(&self) -> Vec<InstanceId> {
        self.instances.iter().map(|i| i.key().clone()).collect()
    }

    fn acceptors_of(&self, lao: &LaoId) -> ConsensusResult<Arc<BTreeSet<PublicKey>>> {
        self.acceptors
            .get(lao)
            .map(|acceptors| Arc::clone(acceptors.value()))
            .ok_or_else(|| ConsensusError::UnknownLao(lao.clone()))
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}
