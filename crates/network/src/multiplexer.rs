//! Fan-in/fan-out over one primary connection and any number of peers

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use futures::Stream;
use pop_protocol::GenericMessage;
use pop_transport::{Connection, LinkEvent, Transport};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{NetworkError, NetworkResult};

/// A link event tagged with the connection that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// Address of the connection
    pub address: String,
    /// What happened
    pub event: LinkEvent,
}

/// Multiplexes a primary connection and the peers a server told us about
///
/// Outgoing envelopes go to every connection. Inbound envelopes and link
/// events of every connection are merged into one stream each, observed
/// through [`Multiplexer::observe_messages`] and
/// [`Multiplexer::observe_link_events`]. Every background task of the
/// network layer is spawned through [`Multiplexer::spawn`] so that
/// [`Multiplexer::close`] stops all of them.
pub struct Multiplexer<T>
where
    T: Transport,
{
    /// Transport used to open peer connections
    transport: Arc<T>,
    /// Connection the multiplexer was built around
    primary: Arc<dyn Connection>,
    /// Peer connections by address
    peers: DashMap<String, Arc<dyn Connection>>,
    /// Serializes peer additions
    peer_lock: Mutex<()>,
    /// Merged inbound envelopes
    messages: broadcast::Sender<GenericMessage>,
    /// Merged link events
    events: broadcast::Sender<ConnectionEvent>,
    /// Cancellation token for graceful shutdown
    cancellation_token: CancellationToken,
    /// Task tracker for background tasks
    task_tracker: TaskTracker,
    closed: AtomicBool,
}

impl<T> Multiplexer<T>
where
    T: Transport,
{
    /// Open the primary connection and build a multiplexer around it
    pub async fn connect(transport: Arc<T>, address: &str, capacity: usize) -> NetworkResult<Self> {
        let primary = transport.connect(address).await?;
        info!("Primary connection opened to {}", address);
        Ok(Self::new(transport, primary, capacity))
    }

    /// Build a multiplexer around an open connection
    pub fn new(transport: Arc<T>, primary: Arc<dyn Connection>, capacity: usize) -> Self {
        let (messages, _) = broadcast::channel(capacity);
        let (events, _) = broadcast::channel(capacity);

        let multiplexer = Self {
            transport,
            primary,
            peers: DashMap::new(),
            peer_lock: Mutex::new(()),
            messages,
            events,
            cancellation_token: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
            closed: AtomicBool::new(false),
        };
        multiplexer.attach(multiplexer.primary.clone());
        multiplexer
    }

    /// Address of the primary connection
    pub fn primary_address(&self) -> &str {
        self.primary.address()
    }

    /// Addresses of every connection, primary first
    pub fn addresses(&self) -> Vec<String> {
        let mut addresses = vec![self.primary.address().to_string()];
        let mut peers: Vec<String> = self.peers.iter().map(|p| p.key().clone()).collect();
        peers.sort();
        addresses.extend(peers);
        addresses
    }

    /// Send an envelope over every connection
    ///
    /// Succeeds when at least one connection accepted the frame.
    pub async fn send(&self, message: &GenericMessage) -> NetworkResult<()> {
        if self.is_closed() {
            return Err(NetworkError::Closed);
        }

        let frame = message.to_json()?;
        let mut connections = vec![self.primary.clone()];
        connections.extend(self.peers.iter().map(|p| p.value().clone()));

        let mut first_error = None;
        let mut delivered = false;
        for connection in connections {
            match connection.send(frame.clone()).await {
                Ok(()) => delivered = true,
                Err(e) => {
                    warn!("Failed to send to {}: {}", connection.address(), e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) if !delivered => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Open a connection to every address not connected yet
    ///
    /// Returns whether at least one new peer was added.
    pub async fn connect_to_peers(&self, addresses: &[String]) -> bool {
        let _guard = self.peer_lock.lock().await;
        let mut added = false;

        for address in addresses {
            if self.is_closed() {
                break;
            }
            if address == self.primary.address() || self.peers.contains_key(address) {
                debug!("Peer {} already connected", address);
                continue;
            }

            match self.transport.connect(address).await {
                Ok(connection) => {
                    info!("Connected to peer {}", address);
                    self.attach(connection.clone());
                    self.peers.insert(address.clone(), connection);
                    added = true;
                }
                Err(e) => warn!("Failed to connect to peer {}: {}", address, e),
            }
        }

        added
    }

    /// Observe every inbound envelope from now on
    pub fn observe_messages(&self) -> broadcast::Receiver<GenericMessage> {
        self.messages.subscribe()
    }

    /// Inbound envelopes as a stream, skipping over lagged items
    pub fn message_stream(&self) -> impl Stream<Item = GenericMessage> + Send + 'static {
        BroadcastStream::new(self.messages.subscribe()).filter_map(|item| match item {
            Ok(message) => Some(message),
            Err(e) => {
                warn!("Message stream lagged: {}", e);
                None
            }
        })
    }

    /// Observe link events of every connection from now on
    pub fn observe_link_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Re-enter an envelope into the inbound stream
    pub fn inject(&self, message: GenericMessage) {
        if self.messages.send(message).is_err() {
            debug!("Injected message dropped, no observers");
        }
    }

    /// Spawn a background task that stops when the multiplexer closes
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.cancellation_token.clone();
        self.task_tracker.spawn(async move {
            tokio::select! {
                () = task => {}
                () = token.cancelled() => {}
            }
        });
    }

    /// Token cancelled when the multiplexer closes
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Whether [`Multiplexer::close`] was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close every connection and wait for background tasks
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Closing multiplexer for {}", self.primary.address());
        self.cancellation_token.cancel();

        let mut connections = vec![self.primary.clone()];
        connections.extend(self.peers.iter().map(|p| p.value().clone()));
        for connection in connections {
            if let Err(e) = connection.close().await {
                warn!("Failed to close {}: {}", connection.address(), e);
            }
        }

        self.task_tracker.close();
        self.task_tracker.wait().await;
        debug!("Multiplexer closed");
    }

    /// Forward a connection's frames and events into the merged streams
    fn attach(&self, connection: Arc<dyn Connection>) {
        // Subscribe before spawning so nothing sent after attach is missed
        let frames = connection.frames();
        let events = connection.link_events();

        let forwarder = Forwarder {
            address: connection.address().to_string(),
            messages: self.messages.clone(),
            events: self.events.clone(),
        };
        self.spawn(forwarder.run(frames, events));
    }
}

struct Forwarder {
    address: String,
    messages: broadcast::Sender<GenericMessage>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Forwarder {
    async fn run(
        self,
        mut frames: broadcast::Receiver<String>,
        mut events: broadcast::Receiver<LinkEvent>,
    ) {
        loop {
            tokio::select! {
                frame = frames.recv() => match frame {
                    Ok(frame) => self.forward_frame(&frame),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Dropped {} frames from {}", skipped, self.address);
                    }
                    Err(RecvError::Closed) => break,
                },
                event = events.recv() => match event {
                    Ok(event) => {
                        info!("Link event from {}: {:?}", self.address, event);
                        let _ = self.events.send(ConnectionEvent {
                            address: self.address.clone(),
                            event,
                        });
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Dropped {} link events from {}", skipped, self.address);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("Forwarder for {} stopped", self.address);
    }

    fn forward_frame(&self, frame: &str) {
        match GenericMessage::from_json(frame) {
            Ok(message) => {
                let _ = self.messages.send(message);
            }
            Err(e) => warn!("Dropping malformed frame from {}: {}", self.address, e),
        }
    }
}
