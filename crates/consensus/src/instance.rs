//! Single-decree Paxos over one consensus instance
//!
//! Every node is acceptor and learner for each instance it knows of, and
//! proposer for the instances it started itself. Several proposers may race on
//! the same instance: the instance id only depends on what is decided, so two
//! nodes electing themselves for the same key, value and time share it. Each
//! proposer's run is told apart by the id of the `elect` message that opened
//! it.
//!
//! The instance only reacts to the messages it is fed and returns what the
//! local node has to publish in response. Messages may arrive in any order
//! and more than once.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use pop_protocol::data::{
    AcceptValue, ConsensusAccept, ConsensusElect, ConsensusElectAccept, ConsensusFailure,
    ConsensusKey, ConsensusLearn, ConsensusMessage, ConsensusPrepare, ConsensusPromise,
    ConsensusPropose, LearnValue, NO_TRY, PrepareValue, PromiseValue, ProposeValue,
};
use pop_protocol::{InstanceId, LaoId, MessageId, PublicKey};
use tracing::{debug, info, warn};

use crate::envelope::ConsensusEnvelope;
use crate::error::{ConsensusError, ConsensusResult};

/// Lifecycle of an instance as seen from the local node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceState {
    /// An elect was seen or emitted
    Created,
    /// A quorum accepted the local node's elect
    ElectAccepted,
    /// A quorum promised the local node's current try
    Prepared,
    /// A quorum accepted the local proposal, learn emitted
    Proposed,
    /// Decided
    Learned,
    /// Ended without a decision
    Failed,
}

impl InstanceState {
    /// Whether the instance reached its final state
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Learned | Self::Failed)
    }
}

/// Decides whether this node supports an elect
pub trait ElectApprover: Send + Sync + 'static {
    /// Whether to answer the elect with `accept = true`
    fn approve(&self, elect: &ConsensusElect) -> bool;
}

/// Supports every elect
#[derive(Debug, Clone, Copy, Default)]
pub struct ApproveAll;

impl ElectApprover for ApproveAll {
    fn approve(&self, _elect: &ConsensusElect) -> bool {
        true
    }
}

/// What an instance needs to know about the node it runs on
pub struct LocalNode<'a> {
    /// Identity of the local node
    pub identity: &'a PublicKey,
    /// Elect policy of the local node
    pub approver: &'a dyn ElectApprover,
    /// Unix seconds stamped on outgoing messages
    pub now: i64,
}

#[derive(Debug, Clone)]
struct AcceptorState {
    promised_try: i64,
    /// Elect id of the run the promise was made to
    promised_to: Option<MessageId>,
    accepted: Option<(i64, bool)>,
}

impl Default for AcceptorState {
    fn default() -> Self {
        Self {
            promised_try: NO_TRY,
            promised_to: None,
            accepted: None,
        }
    }
}

/// The local node's own run on the instance
#[derive(Debug, Clone)]
struct Proposal {
    decision: bool,
    /// Known once the local elect came back from the server
    elect_id: Option<MessageId>,
    try_number: i64,
    elect_accepts: HashSet<PublicKey>,
    elect_rejects: HashSet<PublicKey>,
    promises: HashMap<PublicKey, PromiseValue>,
    accepts: BTreeSet<PublicKey>,
    proposed: Option<ProposeValue>,
}

impl Proposal {
    fn new(decision: bool) -> Self {
        Self {
            decision,
            elect_id: None,
            try_number: 0,
            elect_accepts: HashSet::new(),
            elect_rejects: HashSet::new(),
            promises: HashMap::new(),
            accepts: BTreeSet::new(),
            proposed: None,
        }
    }

    fn owns(&self, elect_id: &MessageId) -> bool {
        self.elect_id.as_ref() == Some(elect_id)
    }
}

/// State machine of one consensus instance
#[derive(Debug, Clone)]
pub struct ConsensusInstance {
    id: InstanceId,
    lao: LaoId,
    elect: ConsensusElect,
    acceptors: Arc<BTreeSet<PublicKey>>,
    state: InstanceState,
    /// Proposer of every run, by elect message id
    elects: HashMap<MessageId, PublicKey>,
    /// Message ids already handled
    seen: HashSet<MessageId>,
    highest_try: i64,
    acceptor: AcceptorState,
    proposal: Option<Proposal>,
    decision: Option<bool>,
}

impl ConsensusInstance {
    /// Create an instance for `elect` decided by `acceptors`
    pub fn new(lao: LaoId, elect: ConsensusElect, acceptors: Arc<BTreeSet<PublicKey>>) -> Self {
        Self {
            id: elect.instance_id.clone(),
            lao,
            elect,
            acceptors,
            state: InstanceState::Created,
            elects: HashMap::new(),
            seen: HashSet::new(),
            highest_try: NO_TRY,
            acceptor: AcceptorState::default(),
            proposal: None,
            decision: None,
        }
    }

    /// Instance id
    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    /// LAO the instance belongs to
    pub fn lao(&self) -> &LaoId {
        &self.lao
    }

    /// What is being decided
    pub fn key(&self) -> &ConsensusKey {
        &self.elect.key
    }

    /// Value proposed for the key
    pub fn value(&self) -> &str {
        &self.elect.value
    }

    /// Current state
    pub fn state(&self) -> InstanceState {
        self.state
    }

    /// The decision, once learned
    pub fn decision(&self) -> Option<bool> {
        self.decision
    }

    /// Acceptors deciding the instance
    pub fn acceptors(&self) -> &BTreeSet<PublicKey> {
        &self.acceptors
    }

    /// Try of the local proposal, 0 when not proposing
    pub fn try_number(&self) -> i64 {
        self.proposal.as_ref().map_or(0, |p| p.try_number)
    }

    /// Highest try seen on the instance
    pub fn highest_try(&self) -> i64 {
        self.highest_try
    }

    /// Value the local acceptor accepted, if any
    pub fn accepted_value(&self) -> Option<bool> {
        self.acceptor.accepted.map(|(_, value)| value)
    }

    /// Whether the local node proposes on this instance
    pub fn is_proposing(&self) -> bool {
        self.proposal.is_some()
    }

    /// Number of acceptors forming a majority
    pub fn quorum(&self) -> usize {
        self.acceptors.len() / 2 + 1
    }

    /// Start a local run proposing `decision`
    pub fn propose(&mut self, decision: bool) -> ConsensusResult<()> {
        if self.proposal.is_some() || self.state.is_terminal() {
            return Err(ConsensusError::InvalidState {
                instance_id: self.id.clone(),
                operation: "propose",
            });
        }
        self.proposal = Some(Proposal::new(decision));
        Ok(())
    }

    /// Prepare the local run again with a higher try
    pub fn retry(&mut self, now: i64) -> ConsensusResult<ConsensusPrepare> {
        let invalid = || ConsensusError::InvalidState {
            instance_id: self.id.clone(),
            operation: "retry",
        };
        if self.state == InstanceState::Created || self.state.is_terminal() {
            return Err(invalid());
        }
        let Some(proposal) = self.proposal.as_mut() else {
            return Err(invalid());
        };
        let Some(elect_id) = proposal.elect_id.clone() else {
            return Err(invalid());
        };

        proposal.try_number = proposal.try_number.max(self.highest_try) + 1;
        proposal.promises.clear();
        proposal.accepts.clear();
        proposal.proposed = None;
        self.highest_try = proposal.try_number;
        self.state = InstanceState::ElectAccepted;

        info!("Retrying {} at try {}", self.id, proposal.try_number);
        Ok(ConsensusPrepare {
            instance_id: self.id.clone(),
            message_id: elect_id,
            created_at: now,
            value: PrepareValue {
                proposed_try: proposal.try_number,
            },
        })
    }

    /// Feed a message to the instance
    ///
    /// Returns the messages the local node has to publish in response.
    pub fn handle(
        &mut self,
        node: &LocalNode<'_>,
        envelope: &ConsensusEnvelope,
    ) -> ConsensusResult<Vec<ConsensusMessage>> {
        if self.seen.contains(&envelope.message_id) {
            debug!("Ignoring duplicate {} on {}", envelope.message_id, self.id);
            return Ok(Vec::new());
        }
        if envelope.lao != self.lao {
            return Err(ConsensusError::InvalidMessage(format!(
                "{} belongs to LAO {}, not {}",
                self.id, self.lao, envelope.lao
            )));
        }
        if let Some(elect_id) = envelope.message.elect_message_id() {
            if !self.elects.contains_key(elect_id) {
                return Err(ConsensusError::UnknownElect {
                    instance_id: self.id.clone(),
                    message_id: elect_id.clone(),
                });
            }
        }

        let sender = &envelope.sender;
        let outputs = match &envelope.message {
            ConsensusMessage::Elect(m) => self.on_elect(node, envelope, m)?,
            ConsensusMessage::Learn(m) => self.on_learn(sender, m)?,
            ConsensusMessage::Failure(m) => self.on_failure(sender, m)?,
            message if self.state.is_terminal() => {
                debug!("Ignoring {} on settled {}", message.action(), self.id);
                Vec::new()
            }
            ConsensusMessage::ElectAccept(m) => self.on_elect_accept(node, sender, m),
            ConsensusMessage::Prepare(m) => self.on_prepare(node, sender, m)?,
            ConsensusMessage::Promise(m) => self.on_promise(node, sender, m),
            ConsensusMessage::Propose(m) => self.on_propose(node, sender, m)?,
            ConsensusMessage::Accept(m) => self.on_accept(node, sender, m),
        };

        self.seen.insert(envelope.message_id.clone());
        Ok(outputs)
    }

    fn on_elect(
        &mut self,
        node: &LocalNode<'_>,
        envelope: &ConsensusEnvelope,
        elect: &ConsensusElect,
    ) -> ConsensusResult<Vec<ConsensusMessage>> {
        if elect.instance_id != self.id || !elect.has_valid_instance_id() {
            return Err(ConsensusError::InvalidMessage(format!(
                "elect {} does not match instance {}",
                envelope.message_id, self.id
            )));
        }
        self.elects
            .insert(envelope.message_id.clone(), envelope.sender.clone());

        if &envelope.sender == node.identity {
            if let Some(proposal) = self.proposal.as_mut() {
                if proposal.elect_id.is_none() {
                    debug!("Local elect for {} is {}", self.id, envelope.message_id);
                    proposal.elect_id = Some(envelope.message_id.clone());
                }
            }
        }

        if self.state.is_terminal() || !self.acceptors.contains(node.identity) {
            return Ok(Vec::new());
        }
        let accept = node.approver.approve(elect);
        Ok(vec![
            ConsensusElectAccept {
                instance_id: self.id.clone(),
                message_id: envelope.message_id.clone(),
                accept,
            }
            .into(),
        ])
    }

    fn on_elect_accept(
        &mut self,
        node: &LocalNode<'_>,
        sender: &PublicKey,
        m: &ConsensusElectAccept,
    ) -> Vec<ConsensusMessage> {
        if !self.acceptors.contains(sender) {
            warn!("Elect accept on {} from non-acceptor {}", self.id, sender);
            return Vec::new();
        }
        let quorum = self.quorum();
        let total = self.acceptors.len();
        let Some(proposal) = self.proposal.as_mut().filter(|p| p.owns(&m.message_id)) else {
            return Vec::new();
        };
        if self.state != InstanceState::Created {
            return Vec::new();
        }

        if m.accept {
            proposal.elect_accepts.insert(sender.clone());
        } else {
            proposal.elect_rejects.insert(sender.clone());
        }

        if proposal.elect_accepts.len() >= quorum {
            proposal.try_number = proposal.try_number.max(self.highest_try) + 1;
            self.highest_try = self.highest_try.max(proposal.try_number);
            self.state = InstanceState::ElectAccepted;
            info!(
                "Elect on {} accepted by {} acceptors, preparing try {}",
                self.id,
                proposal.elect_accepts.len(),
                proposal.try_number
            );
            return vec![
                ConsensusPrepare {
                    instance_id: self.id.clone(),
                    message_id: m.message_id.clone(),
                    created_at: node.now,
                    value: PrepareValue {
                        proposed_try: proposal.try_number,
                    },
                }
                .into(),
            ];
        }

        if total - proposal.elect_rejects.len() < quorum {
            warn!(
                "Elect on {} rejected by {} of {} acceptors, giving up",
                self.id,
                proposal.elect_rejects.len(),
                total
            );
            self.state = InstanceState::Failed;
            return vec![
                ConsensusFailure {
                    instance_id: self.id.clone(),
                    message_id: m.message_id.clone(),
                    created_at: node.now,
                }
                .into(),
            ];
        }
        Vec::new()
    }

    fn on_prepare(
        &mut self,
        node: &LocalNode<'_>,
        sender: &PublicKey,
        m: &ConsensusPrepare,
    ) -> ConsensusResult<Vec<ConsensusMessage>> {
        self.check_proposer(&m.message_id, sender)?;
        let proposed_try = m.value.proposed_try;
        self.observe_try(proposed_try);

        if !self.acceptors.contains(node.identity) {
            return Ok(Vec::new());
        }
        if proposed_try <= self.acceptor.promised_try {
            debug!(
                "Not promising try {} on {}, already promised {}",
                proposed_try, self.id, self.acceptor.promised_try
            );
            return Ok(Vec::new());
        }

        self.acceptor.promised_try = proposed_try;
        self.acceptor.promised_to = Some(m.message_id.clone());
        let (accepted_try, accepted_value) = self.acceptor.accepted.unwrap_or((NO_TRY, false));

        Ok(vec![
            ConsensusPromise {
                instance_id: self.id.clone(),
                message_id: m.message_id.clone(),
                created_at: node.now,
                value: PromiseValue {
                    accepted_try,
                    accepted_value,
                    promised_try: proposed_try,
                },
            }
            .into(),
        ])
    }

    fn on_promise(
        &mut self,
        node: &LocalNode<'_>,
        sender: &PublicKey,
        m: &ConsensusPromise,
    ) -> Vec<ConsensusMessage> {
        self.observe_try(m.value.promised_try);
        if !self.acceptors.contains(sender) {
            warn!("Promise on {} from non-acceptor {}", self.id, sender);
            return Vec::new();
        }
        let quorum = self.quorum();
        let Some(proposal) = self.proposal.as_mut().filter(|p| p.owns(&m.message_id)) else {
            return Vec::new();
        };
        if self.state != InstanceState::ElectAccepted
            || m.value.promised_try != proposal.try_number
        {
            debug!(
                "Ignoring promise for try {} on {}, at try {}",
                m.value.promised_try, self.id, proposal.try_number
            );
            return Vec::new();
        }

        proposal.promises.insert(sender.clone(), m.value);
        if proposal.promises.len() < quorum {
            return Vec::new();
        }

        // Adopt the value accepted at the highest try, if any
        let proposed_value = proposal
            .promises
            .values()
            .filter_map(PromiseValue::accepted)
            .max_by_key(|(accepted_try, _)| *accepted_try)
            .map_or(proposal.decision, |(_, value)| value);
        let value = ProposeValue {
            proposed_try: proposal.try_number,
            proposed_value,
        };
        proposal.proposed = Some(value);
        self.state = InstanceState::Prepared;

        let acceptor_signatures: BTreeSet<PublicKey> = proposal.promises.keys().cloned().collect();
        info!(
            "Try {} on {} promised by a quorum, proposing {}",
            value.proposed_try, self.id, proposed_value
        );
        vec![
            ConsensusPropose {
                instance_id: self.id.clone(),
                message_id: m.message_id.clone(),
                created_at: node.now,
                value,
                acceptor_signatures: acceptor_signatures.into_iter().collect(),
            }
            .into(),
        ]
    }

    fn on_propose(
        &mut self,
        node: &LocalNode<'_>,
        sender: &PublicKey,
        m: &ConsensusPropose,
    ) -> ConsensusResult<Vec<ConsensusMessage>> {
        self.check_proposer(&m.message_id, sender)?;
        let ProposeValue {
            proposed_try,
            proposed_value,
        } = m.value;
        self.observe_try(proposed_try);

        if !self.acceptors.contains(node.identity) {
            return Ok(Vec::new());
        }
        if let Some((accepted_try, accepted_value)) = self.acceptor.accepted {
            if accepted_try == proposed_try {
                if accepted_value != proposed_value {
                    warn!(
                        "Refusing {} at try {} on {}, already accepted {}",
                        proposed_value, proposed_try, self.id, accepted_value
                    );
                }
                return Ok(Vec::new());
            }
        }

        let promised_try = self.acceptor.promised_try;
        let accept = if proposed_try > promised_try {
            true
        } else if proposed_try == promised_try {
            self.acceptor.promised_to.as_ref() == Some(&m.message_id)
                || self.backed_by_quorum(&m.acceptor_signatures)
        } else {
            false
        };
        if !accept {
            debug!(
                "Not accepting try {} on {}, promised {}",
                proposed_try, self.id, promised_try
            );
            return Ok(Vec::new());
        }

        self.acceptor.promised_try = proposed_try;
        self.acceptor.promised_to = Some(m.message_id.clone());
        self.acceptor.accepted = Some((proposed_try, proposed_value));

        Ok(vec![
            ConsensusAccept {
                instance_id: self.id.clone(),
                message_id: m.message_id.clone(),
                created_at: node.now,
                value: AcceptValue {
                    accepted_try: proposed_try,
                    accepted_value: proposed_value,
                },
            }
            .into(),
        ])
    }

    fn on_accept(
        &mut self,
        node: &LocalNode<'_>,
        sender: &PublicKey,
        m: &ConsensusAccept,
    ) -> Vec<ConsensusMessage> {
        self.observe_try(m.value.accepted_try);
        if !self.acceptors.contains(sender) {
            warn!("Accept on {} from non-acceptor {}", self.id, sender);
            return Vec::new();
        }
        let quorum = self.quorum();
        let Some(proposal) = self.proposal.as_mut().filter(|p| p.owns(&m.message_id)) else {
            return Vec::new();
        };
        let Some(proposed) = proposal.proposed else {
            return Vec::new();
        };
        if self.state != InstanceState::Prepared
            || m.value.accepted_try != proposed.proposed_try
            || m.value.accepted_value != proposed.proposed_value
        {
            return Vec::new();
        }

        proposal.accepts.insert(sender.clone());
        if proposal.accepts.len() < quorum {
            return Vec::new();
        }

        self.state = InstanceState::Proposed;
        info!(
            "{} accepted by a quorum at try {}, learning {}",
            self.id, proposed.proposed_try, proposed.proposed_value
        );
        vec![
            ConsensusLearn {
                instance_id: self.id.clone(),
                message_id: m.message_id.clone(),
                created_at: node.now,
                value: LearnValue {
                    decision: proposed.proposed_value,
                },
                acceptor_signatures: proposal.accepts.iter().cloned().collect(),
            }
            .into(),
        ]
    }

    fn on_learn(
        &mut self,
        sender: &PublicKey,
        m: &ConsensusLearn,
    ) -> ConsensusResult<Vec<ConsensusMessage>> {
        self.check_proposer(&m.message_id, sender)?;
        if !self.backed_by_quorum(&m.acceptor_signatures) {
            return Err(ConsensusError::InvalidMessage(format!(
                "learn on {} is not backed by a quorum of acceptors",
                self.id
            )));
        }

        let learned = m.value.decision;
        match self.decision {
            Some(decided) if decided != learned => {
                return Err(ConsensusError::Conflict {
                    instance_id: self.id.clone(),
                    decided,
                    learned,
                });
            }
            Some(_) => return Ok(Vec::new()),
            None => {}
        }
        if self.state == InstanceState::Failed {
            debug!("Ignoring learn on failed {}", self.id);
            return Ok(Vec::new());
        }

        info!("Learned {} for {}", learned, self.id);
        self.decision = Some(learned);
        self.state = InstanceState::Learned;
        Ok(Vec::new())
    }

    fn on_failure(
        &mut self,
        sender: &PublicKey,
        m: &ConsensusFailure,
    ) -> ConsensusResult<Vec<ConsensusMessage>> {
        self.check_proposer(&m.message_id, sender)?;
        if !self.state.is_terminal() {
            warn!("{} failed", self.id);
            self.state = InstanceState::Failed;
        }
        Ok(Vec::new())
    }

    /// Check that `sender` opened the run `elect_id` refers to
    fn check_proposer(&self, elect_id: &MessageId, sender: &PublicKey) -> ConsensusResult<()> {
        match self.elects.get(elect_id) {
            Some(proposer) if proposer == sender => Ok(()),
            _ => Err(ConsensusError::InvalidMessage(format!(
                "{} did not open run {} of {}",
                sender, elect_id, self.id
            ))),
        }
    }

    /// Whether the distinct signatures name a quorum of acceptors
    fn backed_by_quorum(&self, signatures: &[PublicKey]) -> bool {
        let signers: BTreeSet<&PublicKey> = signatures
            .iter()
            .filter(|key| self.acceptors.contains(*key))
            .collect();
        signers.len() >= self.quorum()
    }

    fn observe_try(&mut self, try_number: i64) {
        self.highest_try = self.highest_try.max(try_number);
    }
}
