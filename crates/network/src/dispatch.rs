//! Delivery of broadcasts to the application handler

use std::sync::Arc;

use pop_protocol::Broadcast;
use pop_transport::Transport;
use tracing::{debug, warn};

use crate::handler::{HandlerError, MessageHandler};
use crate::reprocessing::ReprocessingQueue;

/// Hands messages to the handler and requeues those missing a dependency
pub struct MessageDispatcher<T>
where
    T: Transport,
{
    handler: Arc<dyn MessageHandler>,
    queue: Arc<ReprocessingQueue<T>>,
}

impl<T> MessageDispatcher<T>
where
    T: Transport,
{
    /// Create a dispatcher
    pub fn new(handler: Arc<dyn MessageHandler>, queue: Arc<ReprocessingQueue<T>>) -> Self {
        Self { handler, queue }
    }

    /// Handle one broadcast
    pub async fn deliver(&self, broadcast: Broadcast) {
        let id = broadcast.message.message_id.clone();
        match self
            .handler
            .handle(&broadcast.channel, &broadcast.message)
            .await
        {
            Ok(()) => {
                debug!("Handled message {} on {}", id, broadcast.channel);
                self.queue.settle(&id);
            }
            Err(HandlerError::MissingDependency(reason)) => {
                debug!("Message {} is missing a dependency: {}", id, reason);
                self.queue.requeue(broadcast);
            }
            Err(e) => {
                warn!("Dropping message {} on {}: {}", id, broadcast.channel, e);
                self.queue.settle(&id);
            }
        }
    }

    /// The reprocessing queue
    pub fn queue(&self) -> &Arc<ReprocessingQueue<T>> {
        &self.queue
    }
}
