//! Channel subscriptions and their catchup
//!
//! Subscribing asks the server for live broadcasts on a channel and then for
//! the channel's backlog. The backlog is handed to the handler in order before
//! `subscribe` returns. Broadcasts for the channel arriving in the meantime are
//! held back and delivered after the backlog, minus those the backlog already
//! contained.
//!
//! The tracked set is subscribed again, backlog included, whenever a connection
//! (re)opens, so the server side converges back to it after a reconnection and
//! broadcasts published during the outage still reach the handler. Backlog
//! messages handled before the outage are handed to the handler again.
//!
//! Subscribe, unsubscribe and resubscribe of one channel never overlap.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use pop_protocol::{Broadcast, Channel, MessageId, Method, Query};
use pop_transport::{LinkEvent, Transport};
use tokio::sync::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::correlator::{RequestCorrelator, expect_messages, expect_status};
use crate::dispatch::MessageDispatcher;
use crate::error::NetworkResult;
use crate::multiplexer::Multiplexer;

/// Broadcasts held back while a channel catches up
#[derive(Debug, Default)]
struct CatchupBuffer {
    /// Subscribes in progress for the channel
    depth: usize,
    pending: VecDeque<Broadcast>,
    replayed: HashSet<MessageId>,
}

/// Keeps the server-side subscription set in line with the local one
pub struct SubscriptionReconciler<T>
where
    T: Transport,
{
    multiplexer: Arc<Multiplexer<T>>,
    correlator: Arc<RequestCorrelator<T>>,
    dispatcher: Arc<MessageDispatcher<T>>,
    channels: DashSet<Channel>,
    catchups: DashMap<Channel, CatchupBuffer>,
    /// Serializes subscription changes per channel
    locks: DashMap<Channel, Arc<Mutex<()>>>,
}

impl<T> SubscriptionReconciler<T>
where
    T: Transport,
{
    /// Create a reconciler
    pub fn new(
        multiplexer: Arc<Multiplexer<T>>,
        correlator: Arc<RequestCorrelator<T>>,
        dispatcher: Arc<MessageDispatcher<T>>,
    ) -> Self {
        Self {
            multiplexer,
            correlator,
            dispatcher,
            channels: DashSet::new(),
            catchups: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    /// Subscribe to a channel and replay its backlog
    ///
    /// Resolves once the subscription was acknowledged and every backlog
    /// message was handed to the handler.
    pub async fn subscribe(&self, channel: Channel) -> NetworkResult<()> {
        let lock = self.channel_lock(&channel);
        let _guard = lock.lock().await;
        self.subscribe_locked(&channel).await
    }

    async fn subscribe_locked(&self, channel: &Channel) -> NetworkResult<()> {
        self.begin_catchup(channel);
        let result = self.subscribe_and_catch_up(channel).await;
        self.finish_catchup(channel).await;
        result
    }

    async fn subscribe_and_catch_up(&self, channel: &Channel) -> NetworkResult<()> {
        let status = self
            .correlator
            .request(Query::subscribe(channel.clone()))
            .await?;
        expect_status(Method::Subscribe, status)?;
        self.channels.insert(channel.clone());
        info!("Subscribed to {}", channel);

        let backlog = self
            .correlator
            .request(Query::catchup(channel.clone()))
            .await?;
        let messages = expect_messages(Method::Catchup, backlog)?;
        debug!("Catching up {} messages on {}", messages.len(), channel);

        if let Some(mut buffer) = self.catchups.get_mut(channel) {
            buffer
                .replayed
                .extend(messages.iter().map(|m| m.message_id.clone()));
        }

        for message in messages {
            self.dispatcher
                .deliver(Broadcast {
                    channel: channel.clone(),
                    message,
                })
                .await;
        }
        Ok(())
    }

    /// Unsubscribe from a channel
    pub async fn unsubscribe(&self, channel: Channel) -> NetworkResult<()> {
        let lock = self.channel_lock(&channel);
        let _guard = lock.lock().await;
        let status = self
            .correlator
            .request(Query::unsubscribe(channel.clone()))
            .await?;
        expect_status(Method::Unsubscribe, status)?;
        self.channels.remove(&channel);
        info!("Unsubscribed from {}", channel);
        Ok(())
    }

    /// Channels currently tracked
    pub fn subscriptions(&self) -> HashSet<Channel> {
        self.channels.iter().map(|c| c.key().clone()).collect()
    }

    /// Whether a channel is tracked
    pub fn is_subscribed(&self, channel: &Channel) -> bool {
        self.channels.contains(channel)
    }

    /// Hand a live broadcast to the handler, or hold it back during catchup
    pub async fn route(&self, broadcast: Broadcast) {
        if let Some(mut buffer) = self.catchups.get_mut(&broadcast.channel) {
            debug!(
                "Holding back message {} on {} during catchup",
                broadcast.message.message_id, broadcast.channel
            );
            buffer.pending.push_back(broadcast);
            return;
        }
        self.dispatcher.deliver(broadcast).await;
    }

    /// Resubscribe every tracked channel whenever a connection opens
    pub fn watch_reconnections(self: &Arc<Self>) {
        let mut events = self.multiplexer.observe_link_events();
        let reconciler = self.clone();

        self.multiplexer.spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) if event.event == LinkEvent::Opened => {
                        info!("Connection {} opened, resubscribing", event.address);
                        reconciler.resubscribe_all();
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Reconnection watcher lagged, {} events skipped", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    /// Fire one independent subscribe, catchup included, per tracked channel
    fn resubscribe_all(self: &Arc<Self>) {
        for channel in self.subscriptions() {
            let reconciler = self.clone();
            self.multiplexer.spawn(async move {
                reconciler.resubscribe(channel).await;
            });
        }
    }

    async fn resubscribe(&self, channel: Channel) {
        let lock = self.channel_lock(&channel);
        let _guard = lock.lock().await;
        // Unsubscribed while waiting for the lock
        if !self.is_subscribed(&channel) {
            return;
        }

        match self.subscribe_locked(&channel).await {
            Ok(()) => info!("Resubscribed to {}", channel),
            Err(e) => warn!("Failed to resubscribe to {}: {}", channel, e),
        }
    }

    fn channel_lock(&self, channel: &Channel) -> Arc<Mutex<()>> {
        self.locks.entry(channel.clone()).or_default().value().clone()
    }

    fn begin_catchup(&self, channel: &Channel) {
        self.catchups.entry(channel.clone()).or_default().depth += 1;
    }

    /// Deliver held back broadcasts until none are left, then stop buffering
    async fn finish_catchup(&self, channel: &Channel) {
        loop {
            let (batch, replayed) = match self.catchups.get_mut(channel) {
                Some(mut buffer) => {
                    if buffer.pending.is_empty() {
                        if buffer.depth > 1 {
                            buffer.depth -= 1;
                            return;
                        }
                        drop(buffer);
                        // Re-checked under the shard lock, a broadcast or another
                        // subscribe may have come in between
                        let removed = self.catchups.remove_if(channel, |_, buffer| {
                            buffer.pending.is_empty() && buffer.depth <= 1
                        });
                        if removed.is_some() {
                            return;
                        }
                        continue;
                    }
                    let batch = std::mem::take(&mut buffer.pending);
                    (batch, buffer.replayed.clone())
                }
                None => return,
            };

            for broadcast in batch {
                if replayed.contains(&broadcast.message.message_id) {
                    debug!(
                        "Skipping message {} on {}, already replayed",
                        broadcast.message.message_id, broadcast.channel
                    );
                    continue;
                }
                self.dispatcher.deliver(broadcast).await;
            }
        }
    }
}
