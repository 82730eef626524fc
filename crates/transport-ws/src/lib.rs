//! WebSocket transport implementation
//!
//! Connections are client-side WebSocket links that survive drops: a driver
//! task owns the socket and, when it goes away, keeps redialing with
//! exponential backoff. Frames sent while the link is down wait in a bounded
//! queue and are flushed once it is back.
#![warn(missing_docs)]
#![warn(clippy::all)]

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use pop_transport::{Config, Connection, LinkChannels, LinkEvent, Transport, TransportError};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport implementation
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport {
    config: Config,
}

impl WebSocketTransport {
    /// Create a new WebSocket transport
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Normalize an address to a `ws`/`wss` URL
    pub fn parse_address(address: &str) -> Result<Url, TransportError> {
        let mut url = Url::parse(address)
            .map_err(|e| TransportError::InvalidAddress(format!("Invalid URL {address}: {e}")))?;

        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => {
                return Err(TransportError::InvalidAddress(format!(
                    "Unsupported scheme '{other}' in {address}"
                )));
            }
        };
        url.set_scheme(scheme)
            .map_err(|()| TransportError::InvalidAddress(address.to_string()))?;

        Ok(url)
    }

    async fn dial(&self, url: &Url) -> Result<WsStream, TransportError> {
        let timeout = Duration::from_millis(self.config.connection_timeout_ms);
        match tokio::time::timeout(timeout, connect_async(url.as_str())).await {
            Ok(Ok((stream, _))) => Ok(stream),
            Ok(Err(e)) => Err(TransportError::ConnectionFailed {
                address: url.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(TransportError::Timeout),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, address: &str) -> Result<Arc<dyn Connection>, TransportError> {
        let url = Self::parse_address(address)?;

        debug!("Connecting to WebSocket at {}", url);
        let stream = self.dial(&url).await?;
        info!("WebSocket connection established to {}", url);

        let (outgoing_tx, outgoing_rx) = mpsc::channel(self.config.send_queue_size);
        let channels = LinkChannels::new(self.config.channel_capacity);
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();

        let driver = Driver {
            transport: self.clone(),
            url,
            outgoing: outgoing_rx,
            channels: channels.clone(),
            token: token.clone(),
        };
        tracker.spawn(driver.run(stream));
        tracker.close();

        Ok(Arc::new(WebSocketConnection {
            address: address.to_string(),
            outgoing: outgoing_tx,
            channels,
            closed: AtomicBool::new(false),
            token,
            tracker,
        }))
    }
}

/// How a socket session ended
enum SessionEnd {
    /// Local shutdown, do not reconnect
    Shutdown,
    /// Remote closed the socket
    Closed,
    /// Socket error
    Failed(String),
}

/// Owns the socket and redials it until shut down
struct Driver {
    transport: WebSocketTransport,
    url: Url,
    outgoing: mpsc::Receiver<String>,
    channels: LinkChannels,
    token: CancellationToken,
}

impl Driver {
    async fn run(mut self, initial: WsStream) {
        let base_delay = Duration::from_millis(self.transport.config.reconnect_delay_ms);
        let max_delay = Duration::from_millis(self.transport.config.max_reconnect_delay_ms);

        let mut next = Some(initial);
        let mut delay = base_delay;

        loop {
            let stream = match next.take() {
                Some(stream) => stream,
                None => {
                    tokio::select! {
                        () = self.token.cancelled() => return,
                        () = tokio::time::sleep(delay) => {}
                    }

                    match self.transport.dial(&self.url).await {
                        Ok(stream) => {
                            info!("Reconnected to {}", self.url);
                            delay = base_delay;
                            self.channels.emit_event(LinkEvent::Opened);
                            stream
                        }
                        Err(e) => {
                            warn!("Reconnection to {} failed: {}", self.url, e);
                            self.channels.emit_event(LinkEvent::Failed(e.to_string()));
                            delay = (delay * 2).min(max_delay);
                            continue;
                        }
                    }
                }
            };

            match self.session(stream).await {
                SessionEnd::Shutdown => {
                    debug!("WebSocket driver for {} stopped", self.url);
                    return;
                }
                SessionEnd::Closed => {
                    info!("WebSocket {} closed by remote", self.url);
                    self.channels.emit_event(LinkEvent::Closed);
                }
                SessionEnd::Failed(reason) => {
                    warn!("WebSocket {} failed: {}", self.url, reason);
                    self.channels.emit_event(LinkEvent::Failed(reason));
                }
            }
        }
    }

    async fn session(&mut self, stream: WsStream) -> SessionEnd {
        let (mut sink, mut source) = stream.split();

        loop {
            tokio::select! {
                () = self.token.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
                frame = self.outgoing.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = sink.send(Message::text(frame)).await {
                            return SessionEnd::Failed(e.to_string());
                        }
                    }
                    None => {
                        let _ = sink.close().await;
                        return SessionEnd::Shutdown;
                    }
                },
                message = source.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        self.channels.emit_frame(text.as_str().to_owned());
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => self.channels.emit_frame(text),
                        Err(_) => warn!("Dropping non UTF-8 binary frame from {}", self.url),
                    },
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Closed,
                    Some(Ok(_)) => {
                        // Ping/pong are answered by tungstenite
                    }
                    Some(Err(e)) => return SessionEnd::Failed(e.to_string()),
                },
            }
        }
    }
}

/// Client-side WebSocket connection
struct WebSocketConnection {
    address: String,
    outgoing: mpsc::Sender<String>,
    channels: LinkChannels,
    closed: AtomicBool,
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Debug for WebSocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnection")
            .field("address", &self.address)
            .field("closed", &self.closed)
            .finish()
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    fn address(&self) -> &str {
        &self.address
    }

    async fn send(&self, frame: String) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }

        self.outgoing.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull(self.address.clone()),
            mpsc::error::TrySendError::Closed(_) => TransportError::ConnectionClosed,
        })
    }

    fn frames(&self) -> broadcast::Receiver<String> {
        self.channels.subscribe_frames()
    }

    fn link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.channels.subscribe_events()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        debug!("Closing WebSocket connection to {}", self.address);
        self.token.cancel();
        self.tracker.wait().await;
        self.channels.emit_event(LinkEvent::Closed);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
