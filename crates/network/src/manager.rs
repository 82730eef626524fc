//! Network manager wiring the message-delivery layer together

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use pop_protocol::data::{Data, DataRegistry, LAO_OBJECT, LaoMessage};
use pop_protocol::{Broadcast, Channel, GenericMessage, MessageGeneral, Method, Query};
use pop_transport::Transport;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::correlator::{RequestCorrelator, expect_messages, expect_status};
use crate::dispatch::MessageDispatcher;
use crate::error::{NetworkError, NetworkResult};
use crate::handler::MessageHandler;
use crate::multiplexer::Multiplexer;
use crate::reprocessing::ReprocessingQueue;
use crate::subscriptions::SubscriptionReconciler;

/// Network manager for a client of one or more LAO servers
///
/// Owns the multiplexer and the components built on it, and runs the router
/// loop that feeds inbound broadcasts to the application handler.
pub struct NetworkManager<T>
where
    T: Transport,
{
    config: NetworkConfig,
    multiplexer: Arc<Multiplexer<T>>,
    correlator: Arc<RequestCorrelator<T>>,
    subscriptions: Arc<SubscriptionReconciler<T>>,
    reprocessing: Arc<ReprocessingQueue<T>>,
    registry: DataRegistry,
    /// Inbound envelopes, taken by the router when started
    inbound: Mutex<Option<broadcast::Receiver<GenericMessage>>>,
}

impl<T> NetworkManager<T>
where
    T: Transport,
{
    /// Connect to a server and create a manager around the connection
    pub async fn connect(
        transport: Arc<T>,
        address: &str,
        handler: Arc<dyn MessageHandler>,
        config: NetworkConfig,
    ) -> NetworkResult<Arc<Self>> {
        let multiplexer =
            Multiplexer::connect(transport, address, config.channel_capacity).await?;
        Ok(Self::new(Arc::new(multiplexer), handler, config))
    }

    /// Create a manager around an existing multiplexer
    pub fn new(
        multiplexer: Arc<Multiplexer<T>>,
        handler: Arc<dyn MessageHandler>,
        config: NetworkConfig,
    ) -> Arc<Self> {
        let inbound = multiplexer.observe_messages();
        let correlator = Arc::new(RequestCorrelator::new(
            multiplexer.clone(),
            config.request_timeout(),
        ));
        let reprocessing = Arc::new(ReprocessingQueue::new(
            multiplexer.clone(),
            config.reprocess_delay(),
            config.max_reprocess_attempts,
        ));
        let dispatcher = Arc::new(MessageDispatcher::new(handler, reprocessing.clone()));
        let subscriptions = Arc::new(SubscriptionReconciler::new(
            multiplexer.clone(),
            correlator.clone(),
            dispatcher,
        ));

        Arc::new(Self {
            config,
            multiplexer,
            correlator,
            subscriptions,
            reprocessing,
            registry: DataRegistry::default(),
            inbound: Mutex::new(Some(inbound)),
        })
    }

    /// Start the router loop and the reconnection watcher
    pub fn start(self: &Arc<Self>) -> NetworkResult<()> {
        let inbound = self
            .inbound
            .lock()
            .take()
            .ok_or(NetworkError::AlreadyStarted)?;

        let manager = self.clone();
        self.multiplexer.spawn(async move {
            manager.router_loop(inbound).await;
        });
        self.subscriptions.watch_reconnections();

        info!(
            "Network manager started for {}",
            self.multiplexer.primary_address()
        );
        Ok(())
    }

    /// Configuration in use
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// The multiplexer
    pub fn multiplexer(&self) -> &Arc<Multiplexer<T>> {
        &self.multiplexer
    }

    /// The request correlator
    pub fn correlator(&self) -> &Arc<RequestCorrelator<T>> {
        &self.correlator
    }

    /// The reprocessing queue
    pub fn reprocessing(&self) -> &Arc<ReprocessingQueue<T>> {
        &self.reprocessing
    }

    /// Subscribe to a channel and replay its backlog
    pub async fn subscribe(&self, channel: Channel) -> NetworkResult<()> {
        self.subscriptions.subscribe(channel).await
    }

    /// Unsubscribe from a channel
    pub async fn unsubscribe(&self, channel: Channel) -> NetworkResult<()> {
        self.subscriptions.unsubscribe(channel).await
    }

    /// Channels currently subscribed to
    pub fn subscriptions(&self) -> HashSet<Channel> {
        self.subscriptions.subscriptions()
    }

    /// Publish a message on a channel, once
    pub async fn publish(&self, channel: Channel, message: MessageGeneral) -> NetworkResult<()> {
        debug!("Publishing {} on {}", message.message_id, channel);
        let status = self
            .correlator
            .request(Query::publish(channel, message))
            .await?;
        expect_status(Method::Publish, status)?;
        Ok(())
    }

    /// Fetch the backlog of a channel without subscribing
    pub async fn catchup(&self, channel: Channel) -> NetworkResult<Vec<MessageGeneral>> {
        let backlog = self.correlator.request(Query::catchup(channel)).await?;
        expect_messages(Method::Catchup, backlog)
    }

    /// Spawn a background task stopped on shutdown
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.multiplexer.spawn(task);
    }

    /// Close every connection, fail in-flight requests and stop background tasks
    pub async fn shutdown(&self) {
        info!(
            "Shutting down network manager for {}",
            self.multiplexer.primary_address()
        );
        self.multiplexer.close().await;
    }

    async fn router_loop(self: Arc<Self>, mut inbound: broadcast::Receiver<GenericMessage>) {
        debug!("Message router loop started");
        let mut dropped = 0u64;
        loop {
            match inbound.recv().await {
                Ok(GenericMessage::Broadcast(broadcast)) => {
                    self.check_greeting(&broadcast);
                    self.subscriptions.route(broadcast).await;
                }
                Ok(GenericMessage::Query(query)) => {
                    debug!("Ignoring {} query {} from server", query.method, query.id);
                }
                // Answers are routed by the correlator
                Ok(GenericMessage::Answer(_)) => {}
                Err(RecvError::Lagged(skipped)) => {
                    dropped += skipped;
                    warn!(
                        skipped,
                        dropped, "Router lagged, broadcasts lost until a catchup replays them"
                    );
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Message router loop exited");
    }

    /// Connect to the peers a server greeting lists
    fn check_greeting(self: &Arc<Self>, broadcast: &Broadcast) {
        let Ok(header) = broadcast.message.data_header() else {
            return;
        };
        if header.object != LAO_OBJECT || header.action != "greet" {
            return;
        }

        let greet = match broadcast.message.decoded_data(&self.registry) {
            Ok(Data::Lao(LaoMessage::Greet(greet))) => greet,
            Ok(_) => return,
            Err(e) => {
                warn!("Malformed greeting on {}: {}", broadcast.channel, e);
                return;
            }
        };

        let peers = greet.peer_addresses();
        if peers.is_empty() {
            return;
        }

        info!("Greeting for LAO {} lists {} peers", greet.lao, peers.len());
        let multiplexer = self.multiplexer.clone();
        self.multiplexer.spawn(async move {
            if multiplexer.connect_to_peers(&peers).await {
                debug!("New peers connected");
            }
        });
    }
}
