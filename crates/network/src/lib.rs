//! Message-delivery layer for LAO clients
//!
//! This crate provides the client side of the LAO protocol on top of any
//! implementation of the `pop_transport::Transport` trait:
//! - Multiplexing a primary connection with peer connections
//! - Correlating queries with their answers
//! - Tracking channel subscriptions and replaying their backlog
//! - Re-injecting messages whose dependencies were not seen yet
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod correlator;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod manager;
pub mod multiplexer;
pub mod reprocessing;
pub mod subscriptions;

// Re-export commonly used types
pub use config::NetworkConfig;
pub use correlator::{PendingAnswer, RequestCorrelator};
pub use dispatch::MessageDispatcher;
pub use error::{NetworkError, NetworkResult};
pub use handler::{HandlerError, HandlerResult, IgnoreHandler, MessageHandler};
pub use manager::NetworkManager;
pub use multiplexer::{ConnectionEvent, Multiplexer};
pub use reprocessing::ReprocessingQueue;
pub use subscriptions::SubscriptionReconciler;
