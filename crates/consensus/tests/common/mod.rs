//! Test helpers shared by the consensus integration tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use parking_lot::Mutex;
use pop_protocol::{
    Answer, Broadcast, Channel, GenericMessage, LaoId, MessageGeneral, Method, PublicKey, Query,
    ResultValue,
};
use pop_transport_memory::{MemoryListener, MemoryTransport, ServerLink};

pub fn signing_key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

pub fn identity(key: &SigningKey) -> PublicKey {
    PublicKey::from_verifying_key(&key.verifying_key())
}

pub fn lao() -> LaoId {
    LaoId::new("fzJSZjKf-2cbXH7kds9H8NORuuFIRLkevJlN7qQemjo=")
}

/// Poll a condition every few milliseconds, panicking after five seconds
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[derive(Default)]
struct HubState {
    links: Mutex<Vec<(ServerLink, HashSet<Channel>)>>,
    backlog: Mutex<HashMap<Channel, Vec<MessageGeneral>>>,
}

/// A server relaying every publish to the links subscribed to its channel
#[derive(Clone)]
pub struct Hub {
    state: Arc<HubState>,
}

impl Hub {
    pub fn start(transport: &MemoryTransport, address: &str) -> Self {
        let listener = transport.listen(address).expect("listen");
        let hub = Self {
            state: Arc::new(HubState::default()),
        };
        tokio::spawn(hub.clone().accept_loop(listener));
        hub
    }

    async fn accept_loop(self, listener: MemoryListener) {
        while let Ok(link) = listener.accept().await {
            let index = {
                let mut links = self.state.links.lock();
                links.push((link.clone(), HashSet::new()));
                links.len() - 1
            };
            let hub = self.clone();
            tokio::spawn(async move {
                while let Some(frame) = link.recv().await {
                    if let Ok(GenericMessage::Query(query)) = GenericMessage::from_json(&frame) {
                        hub.handle(index, &link, query);
                    }
                }
            });
        }
    }

    fn handle(&self, index: usize, link: &ServerLink, query: Query) {
        let channel = query.params.channel.clone();
        let result = match query.method {
            Method::Subscribe => {
                self.state.links.lock()[index].1.insert(channel);
                ResultValue::Integer(0)
            }
            Method::Unsubscribe => {
                self.state.links.lock()[index].1.remove(&channel);
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
                let answer = Answer::success(query.id, ResultValue::Integer(0));
                let _ = link.send(GenericMessage::from(answer).to_json().expect("encode"));
                self.relay(&channel, message);
                return;
            }
        };
        let answer = Answer::success(query.id, result);
        let _ = link.send(GenericMessage::from(answer).to_json().expect("encode"));
    }

    fn relay(&self, channel: &Channel, message: MessageGeneral) {
        self.state
            .backlog
            .lock()
            .entry(channel.clone())
            .or_default()
            .push(message.clone());

        let frame = GenericMessage::from(Broadcast {
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
            .filter(|(_, subscriptions)| subscriptions.contains(channel))
            .map(|(link, _)| link.clone())
            .collect();
        for link in links {
            let _ = link.send(frame.clone());
        }
    }

    /// Messages published on a channel so far
    pub fn published(&self, channel: &Channel) -> Vec<MessageGeneral> {
        self.state
            .backlog
            .lock()
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }
}
