//! Request correlation against a scripted server

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{MockServer, lao_channel};
use pop_network::{Multiplexer, NetworkError, RequestCorrelator};
use pop_protocol::{Answer, GenericMessage, Method, Query, RequestId, ResultValue};
use pop_transport_memory::MemoryTransport;
use tokio::time::Instant;

const PRIMARY: &str = "memory://primary";

async fn multiplexer(transport: &Arc<MemoryTransport>) -> Arc<Multiplexer<MemoryTransport>> {
    Arc::new(
        Multiplexer::connect(transport.clone(), PRIMARY, 64)
            .await
            .expect("connect"),
    )
}

#[tokio::test]
async fn test_request_ids_strictly_increase() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let transport = Arc::new(MemoryTransport::default());
    let server = MockServer::start(&transport, PRIMARY);
    let correlator = RequestCorrelator::new(multiplexer(&transport).await, Duration::from_secs(5));

    let mut ids = Vec::new();
    for _ in 0..5 {
        let pending = correlator.submit(Query::subscribe(lao_channel())).await;
        ids.push(pending.id());
        assert_eq!(pending.await.unwrap(), ResultValue::Integer(0));
    }

    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(ids[0], RequestId(1));

    let seen: Vec<RequestId> = server.queries().iter().map(|q| q.id).collect();
    assert_eq!(seen, ids);
    assert_eq!(correlator.pending_requests(), 0);
}

#[tokio::test]
async fn test_answers_in_reverse_order_reach_their_requests() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let transport = Arc::new(MemoryTransport::default());
    let listener = transport.listen(PRIMARY).unwrap();
    let multiplexer = multiplexer(&transport).await;
    let link = listener.accept().await.unwrap();
    let correlator = RequestCorrelator::new(multiplexer, Duration::from_secs(5));

    const N: usize = 8;
    let mut pending = Vec::new();
    for _ in 0..N {
        pending.push(correlator.submit(Query::catchup(lao_channel())).await);
    }

    let mut queries = Vec::new();
    for _ in 0..N {
        let frame = link.recv().await.unwrap();
        match GenericMessage::from_json(&frame).unwrap() {
            GenericMessage::Query(query) => queries.push(query),
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    for query in queries.iter().rev() {
        let answer = Answer::success(query.id, ResultValue::Integer(query.id.0 as i64 * 10));
        link.send(GenericMessage::Answer(answer).to_json().unwrap())
            .unwrap();
    }

    for handle in pending {
        let expected = ResultValue::Integer(handle.id().0 as i64 * 10);
        assert_eq!(handle.await.unwrap(), expected);
    }
}

#[tokio::test(start_paused = true)]
async fn test_timeout_fires_after_configured_delay() {
    let transport = Arc::new(MemoryTransport::default());
    let server = MockServer::start(&transport, PRIMARY);
    server.set_silent(true);
    let correlator = RequestCorrelator::new(multiplexer(&transport).await, Duration::from_secs(5));

    let start = Instant::now();
    let result = correlator.request(Query::subscribe(lao_channel())).await;

    assert!(matches!(result, Err(NetworkError::Timeout(RequestId(1), _))));
    assert_eq!(start.elapsed(), Duration::from_secs(5));
    assert_eq!(correlator.pending_requests(), 0);
}

#[tokio::test]
async fn test_error_answer_surfaces_as_remote_error() {
    let transport = Arc::new(MemoryTransport::default());
    let server = MockServer::start(&transport, PRIMARY);
    server.fail_method(Method::Subscribe, -4, "access denied");
    let correlator = RequestCorrelator::new(multiplexer(&transport).await, Duration::from_secs(5));

    let result = correlator.request(Query::subscribe(lao_channel())).await;
    match result {
        Err(NetworkError::Remote { code, description }) => {
            assert_eq!(code, -4);
            assert_eq!(description, "access denied");
        }
        other => panic!("expected remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_settled_answer_is_cached() {
    let transport = Arc::new(MemoryTransport::default());
    let server = MockServer::start(&transport, PRIMARY);
    let correlator = RequestCorrelator::new(multiplexer(&transport).await, Duration::from_secs(5));

    let pending = correlator.submit(Query::subscribe(lao_channel())).await;
    let copy = pending.clone();

    assert_eq!(pending.await.unwrap(), ResultValue::Integer(0));
    assert_eq!(copy.clone().await.unwrap(), ResultValue::Integer(0));
    assert_eq!(copy.await.unwrap(), ResultValue::Integer(0));
    assert_eq!(server.queries().len(), 1);
}

#[tokio::test]
async fn test_close_fails_in_flight_requests() {
    let transport = Arc::new(MemoryTransport::default());
    let server = MockServer::start(&transport, PRIMARY);
    server.set_silent(true);
    let multiplexer = multiplexer(&transport).await;
    let correlator = RequestCorrelator::new(multiplexer.clone(), Duration::from_secs(60));

    let first = correlator.submit(Query::subscribe(lao_channel())).await;
    let second = correlator.submit(Query::catchup(lao_channel())).await;

    multiplexer.close().await;

    assert!(matches!(first.await, Err(NetworkError::Closed)));
    assert!(matches!(second.await, Err(NetworkError::Closed)));

    // Nothing is sent once closed
    let late = correlator.request(Query::subscribe(lao_channel())).await;
    assert!(matches!(late, Err(NetworkError::Closed)));
}

#[tokio::test]
async fn test_close_drops_requests_nobody_awaits() {
    let transport = Arc::new(MemoryTransport::default());
    let server = MockServer::start(&transport, PRIMARY);
    server.set_silent(true);
    let multiplexer = multiplexer(&transport).await;
    let correlator = RequestCorrelator::new(multiplexer.clone(), Duration::from_secs(60));

    for _ in 0..3 {
        drop(correlator.submit(Query::catchup(lao_channel())).await);
    }
    assert_eq!(correlator.pending_requests(), 3);

    multiplexer.close().await;

    assert_eq!(correlator.pending_requests(), 0);
    drop(correlator.submit(Query::catchup(lao_channel())).await);
    assert_eq!(correlator.pending_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unawaited_request_expires_at_its_deadline() {
    let transport = Arc::new(MemoryTransport::default());
    let server = MockServer::start(&transport, PRIMARY);
    server.set_silent(true);
    let correlator = RequestCorrelator::new(multiplexer(&transport).await, Duration::from_secs(5));

    drop(correlator.submit(Query::subscribe(lao_channel())).await);
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(correlator.pending_requests(), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(correlator.pending_requests(), 0);
}
