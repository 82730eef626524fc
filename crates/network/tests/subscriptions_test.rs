//! Subscription reconciliation end to end

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::{MockServer, RecordingHandler, chirp, lao_channel, wait_until};
use pop_network::{NetworkConfig, NetworkError, NetworkManager};
use pop_protocol::{Answer, Broadcast, Channel, GenericMessage, Method, ResultValue};
use pop_transport_memory::MemoryTransport;
use pretty_assertions::assert_eq;

const PRIMARY: &str = "memory://primary";

async fn manager(
    transport: &Arc<MemoryTransport>,
    handler: Arc<RecordingHandler>,
) -> Arc<NetworkManager<MemoryTransport>> {
    let manager = NetworkManager::connect(
        transport.clone(),
        PRIMARY,
        handler,
        NetworkConfig::default(),
    )
    .await
    .expect("connect");
    manager.start().expect("start");
    manager
}

#[tokio::test]
async fn test_subscribe_replays_backlog_before_returning() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let transport = Arc::new(MemoryTransport::default());
    let server = MockServer::start(&transport, PRIMARY);
    let handler = Arc::new(RecordingHandler::default());
    let manager = manager(&transport, handler.clone()).await;

    let channel = lao_channel();
    let (m1, m2) = (chirp("first"), chirp("second"));
    server.add_backlog(&channel, vec![m1.clone(), m2.clone()]);

    manager.subscribe(channel.clone()).await.unwrap();

    assert_eq!(handler.seen(), vec![m1.message_id, m2.message_id]);
    let methods: Vec<Method> = server.queries().iter().map(|q| q.method).collect();
    assert_eq!(methods, vec![Method::Subscribe, Method::Catchup]);
    assert_eq!(manager.subscriptions(), HashSet::from([channel.clone()]));
    assert_eq!(server.subscriptions(0), manager.subscriptions());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_live_broadcasts_are_delivered_after_subscribe() {
    let transport = Arc::new(MemoryTransport::default());
    let server = MockServer::start(&transport, PRIMARY);
    let handler = Arc::new(RecordingHandler::default());
    let manager = manager(&transport, handler.clone()).await;

    let channel = lao_channel();
    manager.subscribe(channel.clone()).await.unwrap();

    let live = chirp("live");
    server.broadcast(&channel, live.clone());

    wait_until(|| handler.seen() == vec![live.message_id.clone()]).await;
    manager.shutdown().await;
}

#[tokio::test]
async fn test_broadcasts_during_catchup_are_held_back_and_deduplicated() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let transport = Arc::new(MemoryTransport::default());
    let listener = transport.listen(PRIMARY).unwrap();
    let handler = Arc::new(RecordingHandler::default());
    let manager = manager(&transport, handler.clone()).await;
    let link = listener.accept().await.unwrap();

    let channel = lao_channel();
    let (m1, m2, m3) = (chirp("one"), chirp("two"), chirp("three"));

    let server = {
        let (channel, m1, m2, m3) = (channel.clone(), m1.clone(), m2.clone(), m3.clone());
        tokio::spawn(async move {
            let next_query = || async {
                match GenericMessage::from_json(&link.recv().await.unwrap()).unwrap() {
                    GenericMessage::Query(query) => query,
                    other => panic!("unexpected envelope {other:?}"),
                }
            };
            let send = |message: GenericMessage| link.send(message.to_json().unwrap()).unwrap();

            let subscribe = next_query().await;
            assert_eq!(subscribe.method, Method::Subscribe);
            send(Answer::success(subscribe.id, ResultValue::Integer(0)).into());

            // Live traffic racing the catchup, one of them also in the backlog
            for message in [m3, m2.clone()] {
                send(
                    Broadcast {
                        channel: channel.clone(),
                        message,
                    }
                    .into(),
                );
            }

            let catchup = next_query().await;
            assert_eq!(catchup.method, Method::Catchup);
            tokio::time::sleep(Duration::from_millis(50)).await;
            send(Answer::success(catchup.id, ResultValue::Messages(vec![m1, m2])).into());
        })
    };

    manager.subscribe(channel).await.unwrap();
    server.await.unwrap();

    assert_eq!(
        handler.seen(),
        vec![m1.message_id, m2.message_id, m3.message_id]
    );
    manager.shutdown().await;
}

#[tokio::test]
async fn test_resubscribes_after_reconnection() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let transport = Arc::new(MemoryTransport::default());
    let server = MockServer::start(&transport, PRIMARY);
    let handler = Arc::new(RecordingHandler::default());
    let manager = manager(&transport, handler.clone()).await;

    let lao = lao_channel();
    let consensus: Channel = lao.subchannel("consensus").unwrap();
    manager.subscribe(lao.clone()).await.unwrap();
    manager.subscribe(consensus.clone()).await.unwrap();
    assert_eq!(server.subscriptions(0), manager.subscriptions());

    server.drop_link(0);
    assert!(server.subscriptions(0).is_empty());
    // Published while the link is down, only reachable through catchup
    let missed = chirp("missed");
    server.add_backlog(&lao, vec![missed.clone()]);
    let before = server.queries().len();
    server.restore_link(0);

    wait_until(|| server.subscriptions(0) == manager.subscriptions()).await;
    assert_eq!(manager.subscriptions(), HashSet::from([lao.clone(), consensus]));
    wait_until(|| handler.seen().contains(&missed.message_id)).await;

    let replayed: Vec<(Method, Channel)> = server.queries()[before..]
        .iter()
        .filter(|q| q.params.channel == lao)
        .map(|q| (q.method, q.params.channel.clone()))
        .collect();
    assert_eq!(
        replayed,
        vec![(Method::Subscribe, lao.clone()), (Method::Catchup, lao)]
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_subscribe_and_unsubscribe_agree_with_server() {
    let transport = Arc::new(MemoryTransport::default());
    let server = MockServer::start(&transport, PRIMARY);
    let manager = manager(&transport, Arc::new(RecordingHandler::default())).await;
    let channel = lao_channel();

    for _ in 0..20 {
        let (subscribed, unsubscribed) = tokio::join!(
            manager.subscribe(channel.clone()),
            manager.unsubscribe(channel.clone()),
        );
        subscribed.unwrap();
        unsubscribed.unwrap();
        assert_eq!(server.subscriptions(0), manager.subscriptions());
    }

    manager.shutdown().await;
}

#[tokio::test]
async fn test_unsubscribe_removes_channel() {
    let transport = Arc::new(MemoryTransport::default());
    let server = MockServer::start(&transport, PRIMARY);
    let manager = manager(&transport, Arc::new(RecordingHandler::default())).await;

    let channel = lao_channel();
    manager.subscribe(channel.clone()).await.unwrap();
    manager.unsubscribe(channel).await.unwrap();

    assert!(manager.subscriptions().is_empty());
    assert!(server.subscriptions(0).is_empty());
    manager.shutdown().await;
}

#[tokio::test]
async fn test_rejected_subscribe_is_not_tracked() {
    let transport = Arc::new(MemoryTransport::default());
    let server = MockServer::start(&transport, PRIMARY);
    server.fail_method(Method::Subscribe, -3, "unknown channel");
    let manager = manager(&transport, Arc::new(RecordingHandler::default())).await;

    let result = manager.subscribe(lao_channel()).await;

    assert!(matches!(result, Err(NetworkError::Remote { code: -3, .. })));
    assert!(manager.subscriptions().is_empty());
    manager.shutdown().await;
}

#[tokio::test]
async fn test_publish_and_catchup() {
    let transport = Arc::new(MemoryTransport::default());
    let server = MockServer::start(&transport, PRIMARY);
    let manager = manager(&transport, Arc::new(RecordingHandler::default())).await;

    let channel = lao_channel();
    let message = chirp("published");
    manager.publish(channel.clone(), message.clone()).await.unwrap();

    assert_eq!(manager.catchup(channel).await.unwrap(), vec![message]);
    let methods: Vec<Method> = server.queries().iter().map(|q| q.method).collect();
    assert_eq!(methods, vec![Method::Publish, Method::Catchup]);
    manager.shutdown().await;
}
