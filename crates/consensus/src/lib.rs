//! Consensus among the acceptors of a LAO
//!
//! Decisions on a `(type, id, property)` key are taken with single-decree
//! Paxos. Each decision is one instance, identified by the hash of what is
//! being decided. The crate is split in three layers:
//! - [`ConsensusInstance`], the pure state machine of one instance
//! - [`ConsensusRegistry`], which owns every instance and the acceptor sets
//! - [`ConsensusHandler`] and [`ConsensusPublisher`], which plug the registry
//!   into the network layer
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod envelope;
pub mod error;
pub mod handler;
pub mod instance;
pub mod publisher;
pub mod registry;

pub use envelope::{ConsensusEnvelope, sign};
pub use error::{ConsensusError, ConsensusResult};
pub use handler::{ConsensusHandler, Outgoing};
pub use instance::{ApproveAll, ConsensusInstance, ElectApprover, InstanceState, LocalNode};
pub use publisher::ConsensusPublisher;
pub use registry::ConsensusRegistry;
