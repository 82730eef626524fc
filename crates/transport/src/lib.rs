//! Generic transport abstraction for LAO connections
//!
//! This crate provides a transport-agnostic interface to a long-lived duplex
//! link carrying text frames. Specific transports (WebSocket, in-memory) are
//! provided in separate crates.
//!
//! Connections handle:
//! - Fire-and-forget sending of frames
//! - Multicast delivery of inbound frames to any number of observers
//! - Reporting link state changes as [`LinkEvent`]s
//! - Graceful, idempotent shutdown
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

pub use error::{TransportError, TransportResult};

/// Change of state of the underlying link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The link is (again) usable
    Opened,
    /// The link went away cleanly
    Closed,
    /// The link went away because of an error
    Failed(String),
}

/// A duplex link carrying text frames
///
/// Observers obtained through [`Connection::frames`] and
/// [`Connection::link_events`] only see what happens after they subscribe.
#[async_trait]
pub trait Connection: Debug + Send + Sync + 'static {
    /// Address this connection was opened for
    fn address(&self) -> &str;

    /// Queue a frame for delivery
    async fn send(&self, frame: String) -> TransportResult<()>;

    /// Subscribe to inbound frames
    fn frames(&self) -> broadcast::Receiver<String>;

    /// Subscribe to link state changes
    fn link_events(&self) -> broadcast::Receiver<LinkEvent>;

    /// Close the connection; calling it again has no effect
    async fn close(&self) -> TransportResult<()>;

    /// Whether [`Connection::close`] was called
    fn is_closed(&self) -> bool;
}

/// Opens connections to addresses
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a connection
    async fn connect(&self, address: &str) -> TransportResult<Arc<dyn Connection>>;
}

/// Fan-out for the inbound side of a connection
#[derive(Debug, Clone)]
pub struct LinkChannels {
    frames: broadcast::Sender<String>,
    events: broadcast::Sender<LinkEvent>,
}

impl LinkChannels {
    /// Create channels buffering up to `capacity` items per observer
    pub fn new(capacity: usize) -> Self {
        let (frames, _) = broadcast::channel(capacity);
        let (events, _) = broadcast::channel(capacity);
        Self { frames, events }
    }

    /// Deliver an inbound frame to every observer
    pub fn emit_frame(&self, frame: String) {
        if self.frames.send(frame).is_err() {
            trace!("Dropping frame, no observers");
        }
    }

    /// Deliver a link event to every observer
    pub fn emit_event(&self, event: LinkEvent) {
        if self.events.send(event).is_err() {
            trace!("Dropping link event, no observers");
        }
    }

    /// New frame observer
    pub fn subscribe_frames(&self) -> broadcast::Receiver<String> {
        self.frames.subscribe()
    }

    /// New link event observer
    pub fn subscribe_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }
}

/// Configuration for transports
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Connection timeout in milliseconds
    pub connection_timeout_ms: u64,
    /// Delay before the first reconnection attempt in milliseconds
    pub reconnect_delay_ms: u64,
    /// Upper bound of the reconnection backoff in milliseconds
    pub max_reconnect_delay_ms: u64,
    /// Outgoing frames queued while the link is down
    pub send_queue_size: usize,
    /// Inbound frames buffered per observer
    pub channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection_timeout_ms: 5000,   // 5 seconds
            reconnect_delay_ms: 1000,      // 1 second
            max_reconnect_delay_ms: 30000, // 30 seconds
            send_queue_size: 1000,
            channel_capacity: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_link_channels_fan_out() {
        let channels = LinkChannels::new(8);
        let mut first = channels.subscribe_frames();
        let mut second = channels.subscribe_frames();
        let mut events = channels.subscribe_events();

        channels.emit_frame("hello".to_string());
        channels.emit_event(LinkEvent::Opened);

        assert_eq!(first.recv().await.unwrap(), "hello");
        assert_eq!(second.recv().await.unwrap(), "hello");
        assert_eq!(events.recv().await.unwrap(), LinkEvent::Opened);
    }

    #[test]
    fn test_emit_without_observers_is_harmless() {
        let channels = LinkChannels::new(1);
        channels.emit_frame("lost".to_string());
        channels.emit_event(LinkEvent::Closed);
    }

    #[test]
    fn test_config_defaults_fill_missing_fields() {
        let config: Config = serde_json::from_str(r#"{"reconnect_delay_ms": 10}"#).unwrap();
        assert_eq!(config.reconnect_delay_ms, 10);
        assert_eq!(config.connection_timeout_ms, 5000);
    }
}
