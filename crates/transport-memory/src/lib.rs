//! In-memory transport implementation for testing
//!
//! This transport routes frames between a client and a scripted server within
//! the same process. The server side of each connection is a [`ServerLink`],
//! which can also simulate the link dropping and coming back.
#![warn(missing_docs)]
#![warn(clippy::all)]

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use pop_transport::{Config, Connection, LinkChannels, LinkEvent, Transport, TransportError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What the server side pushes to a client
#[derive(Debug)]
enum ServerSignal {
    Frame(String),
    Link(LinkEvent),
}

/// Memory transport implementation
///
/// Listeners are scoped to one transport value; clones share them.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    listeners: Arc<DashMap<String, flume::Sender<ServerLink>>>,
    config: Config,
}

impl MemoryTransport {
    /// Create a new memory transport
    pub fn new(config: Config) -> Self {
        Self {
            listeners: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Accept connections for an address
    pub fn listen(&self, address: &str) -> Result<MemoryListener, TransportError> {
        if self.listeners.contains_key(address) {
            return Err(TransportError::Other(format!(
                "Address {address} already has a listener"
            )));
        }

        let (incoming_tx, incoming_rx) = flume::unbounded();
        self.listeners.insert(address.to_string(), incoming_tx);

        info!("Memory listener created for {}", address);

        Ok(MemoryListener {
            address: address.to_string(),
            incoming: incoming_rx,
            listeners: self.listeners.clone(),
        })
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, address: &str) -> Result<Arc<dyn Connection>, TransportError> {
        debug!("Connecting to memory address {}", address);

        let listener = self
            .listeners
            .get(address)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::ConnectionFailed {
                address: address.to_string(),
                reason: "no listener".to_string(),
            })?;

        let (client_tx, server_rx) = flume::bounded(self.config.send_queue_size);
        let (server_tx, client_rx) = flume::unbounded();

        let channels = LinkChannels::new(self.config.channel_capacity);
        let token = CancellationToken::new();
        tokio::spawn(pump(
            address.to_string(),
            client_rx,
            channels.clone(),
            token.clone(),
        ));

        let server_link = ServerLink {
            address: address.to_string(),
            incoming: server_rx,
            outgoing: server_tx,
            link_up: Arc::new(AtomicBool::new(true)),
        };

        listener
            .send_async(server_link)
            .await
            .map_err(|_| TransportError::ConnectionFailed {
                address: address.to_string(),
                reason: "listener closed".to_string(),
            })?;

        info!("Memory connection established to {}", address);

        Ok(Arc::new(MemoryConnection {
            address: address.to_string(),
            outgoing: Mutex::new(Some(client_tx)),
            channels,
            closed: AtomicBool::new(false),
            token,
        }))
    }
}

/// Forward server signals to the client's observers until either side goes away
async fn pump(
    address: String,
    signals: flume::Receiver<ServerSignal>,
    channels: LinkChannels,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            signal = signals.recv_async() => match signal {
                Ok(ServerSignal::Frame(frame)) => channels.emit_frame(frame),
                Ok(ServerSignal::Link(event)) => channels.emit_event(event),
                Err(_) => {
                    debug!("Server side of {} went away", address);
                    channels.emit_event(LinkEvent::Closed);
                    break;
                }
            }
        }
    }
}

/// Client side of an in-memory connection
struct MemoryConnection {
    address: String,
    outgoing: Mutex<Option<flume::Sender<String>>>,
    channels: LinkChannels,
    closed: AtomicBool,
    token: CancellationToken,
}

impl Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("address", &self.address)
            .field("closed", &self.closed)
            .finish()
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn address(&self) -> &str {
        &self.address
    }

    async fn send(&self, frame: String) -> Result<(), TransportError> {
        let sender = self
            .outgoing
            .lock()
            .clone()
            .ok_or(TransportError::ConnectionClosed)?;

        debug!(
            "Memory connection {} sending {} bytes",
            self.address,
            frame.len()
        );

        sender.try_send(frame).map_err(|e| match e {
            flume::TrySendError::Full(_) => TransportError::QueueFull(self.address.clone()),
            flume::TrySendError::Disconnected(_) => TransportError::ConnectionClosed,
        })
    }

    fn frames(&self) -> tokio::sync::broadcast::Receiver<String> {
        self.channels.subscribe_frames()
    }

    fn link_events(&self) -> tokio::sync::broadcast::Receiver<LinkEvent> {
        self.channels.subscribe_events()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        debug!("Closing memory connection {}", self.address);
        self.outgoing.lock().take();
        self.token.cancel();
        self.channels.emit_event(LinkEvent::Closed);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Accepts in-memory connections for one address
#[derive(Debug)]
pub struct MemoryListener {
    address: String,
    incoming: flume::Receiver<ServerLink>,
    listeners: Arc<DashMap<String, flume::Sender<ServerLink>>>,
}

impl MemoryListener {
    /// Address being listened on
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Wait for the next client
    pub async fn accept(&self) -> Result<ServerLink, TransportError> {
        let link = self
            .incoming
            .recv_async()
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;

        info!("Memory listener accepted connection for {}", self.address);
        Ok(link)
    }

    /// Stop accepting connections for this address
    pub fn close(self) {
        debug!("Closing memory listener for {}", self.address);
        self.listeners.remove(&self.address);
    }
}

/// Server side of an in-memory connection
#[derive(Debug, Clone)]
pub struct ServerLink {
    address: String,
    incoming: flume::Receiver<String>,
    outgoing: flume::Sender<ServerSignal>,
    link_up: Arc<AtomicBool>,
}

impl ServerLink {
    /// Address the client dialed
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Next frame from the client, `None` once the client closed
    pub async fn recv(&self) -> Option<String> {
        self.incoming.recv_async().await.ok()
    }

    /// Push a frame to the client
    pub fn send(&self, frame: String) -> Result<(), TransportError> {
        if !self.link_up.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        self.outgoing
            .send(ServerSignal::Frame(frame))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Whether the link is currently up
    pub fn is_up(&self) -> bool {
        self.link_up.load(Ordering::SeqCst)
    }

    /// Simulate the link dropping cleanly
    pub fn drop_link(&self) {
        self.set_down(LinkEvent::Closed);
    }

    /// Simulate the link failing
    pub fn fail_link(&self, reason: &str) {
        self.set_down(LinkEvent::Failed(reason.to_string()));
    }

    /// Simulate the link coming back
    pub fn restore_link(&self) {
        if !self.link_up.swap(true, Ordering::SeqCst) {
            debug!("Restoring memory link {}", self.address);
            let _ = self.outgoing.send(ServerSignal::Link(LinkEvent::Opened));
        }
    }

    fn set_down(&self, event: LinkEvent) {
        if self.link_up.swap(false, Ordering::SeqCst) {
            debug!("Dropping memory link {}: {:?}", self.address, event);
            let _ = self.outgoing.send(ServerSignal::Link(event));
        }
    }
}
