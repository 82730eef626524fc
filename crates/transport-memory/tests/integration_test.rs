//! Integration tests for memory transport

use std::time::Duration;

use pop_transport::{LinkEvent, Transport};
use pop_transport_memory::MemoryTransport;
use tokio::time::timeout;
use tracing::info;

#[tokio::test]
async fn test_memory_echo_server() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let transport = MemoryTransport::default();
    let listener = transport
        .listen("memory://echo")
        .expect("Failed to create listener");

    // Start echo server
    let server_task = tokio::spawn(async move {
        while let Ok(link) = listener.accept().await {
            info!("Server accepted connection");
            tokio::spawn(async move {
                while let Some(frame) = link.recv().await {
                    info!("Server echoing {} bytes", frame.len());
                    if let Err(e) = link.send(frame) {
                        info!("Server send error: {}", e);
                        break;
                    }
                }
            });
        }
    });

    let client = transport
        .connect("memory://echo")
        .await
        .expect("Failed to connect");
    let mut frames = client.frames();

    for message in ["Hello, Memory!", "Test message 2", "🦀 Rust is awesome!"] {
        client
            .send(message.to_string())
            .await
            .expect("Failed to send");

        let response = timeout(Duration::from_secs(1), frames.recv())
            .await
            .expect("Timeout")
            .expect("Failed to receive");

        assert_eq!(response, message);
    }

    client.close().await.expect("Failed to close client");
    server_task.abort();
}

#[tokio::test]
async fn test_multiple_clients() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let transport = MemoryTransport::default();
    let listener = transport
        .listen("memory://multi")
        .expect("Failed to create listener");

    let server_task = tokio::spawn(async move {
        let mut connection_count = 0;
        while let Ok(link) = listener.accept().await {
            connection_count += 1;
            let conn_id = connection_count;
            tokio::spawn(async move {
                while let Some(frame) = link.recv().await {
                    if link.send(format!("{frame} [from conn #{conn_id}]")).is_err() {
                        break;
                    }
                }
            });
        }
    });

    let mut clients = vec![];
    for i in 0..3 {
        let client = transport
            .connect("memory://multi")
            .await
            .expect("Failed to connect");
        let frames = client.frames();
        clients.push((i, client, frames));
    }

    for (id, client, frames) in &mut clients {
        let message = format!("Hello from client {id}");
        client.send(message.clone()).await.expect("Failed to send");

        let response = timeout(Duration::from_secs(1), frames.recv())
            .await
            .expect("Timeout")
            .expect("Failed to receive");

        assert!(response.starts_with(&message));
    }

    for (_, client, _) in clients {
        let _ = client.close().await;
    }
    server_task.abort();
}

#[tokio::test]
async fn test_simulated_link_loss() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let transport = MemoryTransport::default();
    let listener = transport.listen("memory://flaky").unwrap();

    let client = transport.connect("memory://flaky").await.unwrap();
    let link = listener.accept().await.unwrap();
    let mut events = client.link_events();

    link.drop_link();
    assert!(!link.is_up());
    assert!(link.send("lost".to_string()).is_err());
    assert_eq!(events.recv().await.unwrap(), LinkEvent::Closed);

    // Dropping twice reports once
    link.drop_link();
    link.restore_link();
    assert_eq!(events.recv().await.unwrap(), LinkEvent::Opened);

    link.fail_link("reset by peer");
    assert_eq!(
        events.recv().await.unwrap(),
        LinkEvent::Failed("reset by peer".to_string())
    );
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let transport = MemoryTransport::default();
    let listener = transport.listen("memory://close").unwrap();

    let client = transport.connect("memory://close").await.unwrap();
    let link = listener.accept().await.unwrap();
    let mut events = client.link_events();

    client.close().await.unwrap();
    client.close().await.unwrap();

    assert!(client.is_closed());
    assert!(client.send("late".to_string()).await.is_err());
    assert_eq!(link.recv().await, None);
    assert_eq!(events.recv().await.unwrap(), LinkEvent::Closed);
}
