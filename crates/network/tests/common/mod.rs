//! Scripted LAO server over the memory transport

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use parking_lot::Mutex;
use pop_network::{HandlerError, HandlerResult, MessageHandler};
use pop_protocol::data::{Data, GreetLao, LaoMessage, PeerAddress};
use pop_protocol::{
    Answer, Broadcast, Channel, GenericMessage, LaoId, MessageGeneral, MessageId, Method, PublicKey,
    Query, ResultValue,
};
use pop_transport_memory::{MemoryListener, MemoryTransport, ServerLink};
use serde_json::json;

/// Server-side state of one client link
struct LinkState {
    link: ServerLink,
    subscriptions: HashSet<Channel>,
}

#[derive(Default)]
struct ServerState {
    backlog: Mutex<HashMap<Channel, Vec<MessageGeneral>>>,
    links: Mutex<Vec<LinkState>>,
    queries: Mutex<Vec<Query>>,
    errors: Mutex<HashMap<Method, (i64, String)>>,
    silent: AtomicBool,
}

/// A server answering subscribe, unsubscribe, catchup and publish
///
/// Publishing stores the message in the channel's backlog and broadcasts it
/// to every link subscribed to the channel, the publisher included.
#[derive(Clone)]
pub struct MockServer {
    address: String,
    state: Arc<ServerState>,
}

impl MockServer {
    /// Listen on `address` and serve every client that connects
    pub fn start(transport: &MemoryTransport, address: &str) -> Self {
        let listener = transport.listen(address).expect("listen");
        let server = Self {
            address: address.to_string(),
            state: Arc::new(ServerState::default()),
        };
        tokio::spawn(server.clone().accept_loop(listener));
        server
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn accept_loop(self, listener: MemoryListener) {
        while let Ok(link) = listener.accept().await {
            let index = {
                let mut links = self.state.links.lock();
                links.push(LinkState {
                    link: link.clone(),
                    subscriptions: HashSet::new(),
                });
                links.len() - 1
            };
            let server = self.clone();
            tokio::spawn(async move {
                while let Some(frame) = link.recv().await {
                    server.handle_frame(index, &frame);
                }
            });
        }
    }

    fn handle_frame(&self, index: usize, frame: &str) {
        let Ok(GenericMessage::Query(query)) = GenericMessage::from_json(frame) else {
            return;
        };
        self.state.queries.lock().push(query.clone());

        if self.state.silent.load(Ordering::SeqCst) {
            return;
        }

        let error = self.state.errors.lock().get(&query.method).cloned();
        if let Some((code, description)) = error {
            self.send_to(index, Answer::error(query.id, code, description).into());
            return;
        }

        let channel = query.params.channel.clone();
        let result = match query.method {
            Method::Subscribe => {
                self.state.links.lock()[index]
                    .subscriptions
                    .insert(channel);
                ResultValue::Integer(0)
            }
            Method::Unsubscribe => {
                self.state.links.lock()[index]
                    .subscriptions
                    .remove(&channel);
                ResultValue::Integer(0)
            }
            Method::Catchup => ResultValue::Messages(
                self.state
                    .backlog
                    .lock()
                    .get(&channel)
                    .cloned()
                    .unwrap_or_default(),
            ),
            Method::Publish => {
                let Some(message) = query.params.message.clone() else {
                    return;
                };
                self.send_to(index, Answer::success(query.id, ResultValue::Integer(0)).into());
                self.state
                    .backlog
                    .lock()
                    .entry(channel.clone())
                    .or_default()
                    .push(message.clone());
                self.broadcast(&channel, message);
                return;
            }
        };
        self.send_to(index, Answer::success(query.id, result).into());
    }

    fn send_to(&self, index: usize, message: GenericMessage) {
        let link = self.state.links.lock()[index].link.clone();
        let _ = link.send(message.to_json().expect("encode"));
    }

    /// Broadcast to every link subscribed to `channel`
    pub fn broadcast(&self, channel: &Channel, message: MessageGeneral) {
        let frame = GenericMessage::Broadcast(Broadcast {
            channel: channel.clone(),
            message,
        })
        .to_json()
        .expect("encode");

        let links: Vec<ServerLink> = self
            .state
            .links
            .lock()
            .iter()
            .filter(|state| state.subscriptions.contains(channel))
            .map(|state| state.link.clone())
            .collect();
        for link in links {
            let _ = link.send(frame.clone());
        }
    }

    /// Push a broadcast on a link regardless of its subscriptions
    pub fn push(&self, index: usize, channel: &Channel, message: MessageGeneral) {
        self.send_to(
            index,
            GenericMessage::Broadcast(Broadcast {
                channel: channel.clone(),
                message,
            }),
        );
    }

    /// Add messages to a channel's backlog
    pub fn add_backlog(&self, channel: &Channel, messages: Vec<MessageGeneral>) {
        self.state
            .backlog
            .lock()
            .entry(channel.clone())
            .or_default()
            .extend(messages);
    }

    /// Answer every query of `method` with an error
    pub fn fail_method(&self, method: Method, code: i64, description: &str) {
        self.state
            .errors
            .lock()
            .insert(method, (code, description.to_string()));
    }

    /// Stop answering queries
    pub fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::SeqCst);
    }

    /// Subscriptions the server holds for a link
    pub fn subscriptions(&self, index: usize) -> HashSet<Channel> {
        self.state.links.lock()[index].subscriptions.clone()
    }

    /// Queries received so far
    pub fn queries(&self) -> Vec<Query> {
        self.state.queries.lock().clone()
    }

    pub fn link_count(&self) -> usize {
        self.state.links.lock().len()
    }

    pub fn link(&self, index: usize) -> ServerLink {
        self.state.links.lock()[index].link.clone()
    }

    /// Drop a link; the server forgets its subscriptions like a restarted server would
    pub fn drop_link(&self, index: usize) {
        let link = {
            let mut links = self.state.links.lock();
            links[index].subscriptions.clear();
            links[index].link.clone()
        };
        link.drop_link();
    }

    pub fn restore_link(&self, index: usize) {
        self.link(index).restore_link();
    }

    /// Wait until `count` clients are connected
    pub async fn wait_for_links(&self, count: usize) {
        wait_until(|| self.link_count() >= count).await;
    }
}

/// Poll a condition every few milliseconds, panicking after two seconds
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub fn signing_key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

pub fn lao_channel() -> Channel {
    Channel::lao(&LaoId::new("fzJSZjKf-2cbXH7kds9H8NORuuFIRLkevJlN7qQemjo="))
}

/// A signed application message carrying `text`
pub fn chirp(text: &str) -> MessageGeneral {
    let data = Data::Application {
        object: "chirp".to_string(),
        action: "add".to_string(),
        payload: json!({"object": "chirp", "action": "add", "text": text}),
    };
    MessageGeneral::new(&signing_key(1), &data).expect("sign")
}

/// A signed greeting listing `peers`
pub fn greeting(peers: &[&str]) -> MessageGeneral {
    let frontend = PublicKey::from_verifying_key(&signing_key(9).verifying_key());
    let data = Data::Lao(LaoMessage::Greet(GreetLao {
        lao: LaoId::new("fzJSZjKf-2cbXH7kds9H8NORuuFIRLkevJlN7qQemjo="),
        frontend,
        address: "memory://primary".to_string(),
        peers: peers
            .iter()
            .map(|address| PeerAddress {
                address: address.to_string(),
            })
            .collect(),
    }));
    MessageGeneral::new(&signing_key(9), &data).expect("sign")
}

/// Records the ids of handled messages in order
#[derive(Default)]
pub struct RecordingHandler {
    seen: Mutex<Vec<MessageId>>,
    /// Messages failing with a missing dependency until released
    blocked: Mutex<HashSet<MessageId>>,
    failures: Mutex<Vec<MessageId>>,
}

impl RecordingHandler {
    pub fn seen(&self) -> Vec<MessageId> {
        self.seen.lock().clone()
    }

    pub fn failures(&self) -> Vec<MessageId> {
        self.failures.lock().clone()
    }

    pub fn block(&self, id: &MessageId) {
        self.blocked.lock().insert(id.clone());
    }

    pub fn release(&self, id: &MessageId) {
        self.blocked.lock().remove(id);
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, _channel: &Channel, message: &MessageGeneral) -> HandlerResult<()> {
        if self.blocked.lock().contains(&message.message_id) {
            self.failures.lock().push(message.message_id.clone());
            return Err(HandlerError::MissingDependency(format!(
                "{} is blocked",
                message.message_id
            )));
        }
        self.seen.lock().push(message.message_id.clone());
        Ok(())
    }
}
