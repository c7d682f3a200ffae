//! Integration tests for heartbeat eviction, shutdown, and server isolation.

mod helpers;

use std::time::{Duration, Instant};

use futures::StreamExt;

use helpers::{Event, Recorder};
use wshub_realtime::ServerConfig;
use wshub_realtime::server::SHUTDOWN_REASON;

#[tokio::test]
async fn test_heartbeat_evicts_unresponsive_client() {
    let recorder = Recorder::default();
    let config = recorder.install(ServerConfig::new().with_timeout(Some(Duration::from_millis(300))));
    let (server, url) = helpers::start_server(config).await;

    let started = Instant::now();
    // Never polled, so pings go unanswered.
    let _client = helpers::connect(&server, &url).await;

    recorder
        .wait_for(|events| events.iter().any(|e| matches!(e, Event::Closed(..))))
        .await;
    let elapsed = started.elapsed();

    assert_eq!(recorder.closes()[0].0, 1006);
    assert!(elapsed >= Duration::from_millis(300), "evicted after {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1000), "evicted after {elapsed:?}");
    assert_eq!(server.metrics().evictions, 1);
    assert_eq!(server.connection_count(), 0);
}

#[tokio::test]
async fn test_eviction_interrupts_stalled_write() {
    let recorder = Recorder::default();
    let config = recorder.install(ServerConfig::new().with_timeout(Some(Duration::from_millis(300))));
    let (server, url) = helpers::start_server(config).await;

    // Never read, so the socket buffers fill and the writer stalls.
    let _client = helpers::connect(&server, &url).await;
    let chunk = vec![0u8; 1 << 20];
    for _ in 0..32 {
        assert_eq!(server.broadcast(chunk.clone(), None), 1);
    }

    recorder
        .wait_for(|events| events.iter().any(|e| matches!(e, Event::Closed(..))))
        .await;

    assert_eq!(recorder.closes(), vec![(1006, String::new())]);
    assert_eq!(server.metrics().evictions, 1);
    assert_eq!(server.connection_count(), 0);
}

#[tokio::test]
async fn test_heartbeat_keeps_responsive_client() {
    let config = ServerConfig::new().with_timeout(Some(Duration::from_millis(100)));
    let (server, url) = helpers::start_server(config).await;
    let mut client = helpers::connect(&server, &url).await;

    // Reading lets the client answer pings.
    let reader = tokio::spawn(async move { while client.next().await.is_some() {} });

    tokio::time::sleep(Duration::from_millis(450)).await;
    let metrics = server.metrics();
    assert!(metrics.pings_sent >= 2, "{metrics:?}");
    assert_eq!(metrics.evictions, 0);
    assert_eq!(server.connection_count(), 1);

    server.shutdown().await;
    tokio::time::timeout(helpers::WAIT, reader).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_clients_with_going_away() {
    let recorder = Recorder::default();
    let config = recorder.install(ServerConfig::new().with_timeout(Some(Duration::from_millis(200))));
    let (server, url) = helpers::start_server(config).await;
    let mut first = helpers::connect(&server, &url).await;
    let mut second = helpers::connect(&server, &url).await;

    let closing = tokio::spawn({
        let server = server.clone();
        async move { server.shutdown().await }
    });

    for client in [&mut first, &mut second] {
        let frame = helpers::next_close(client).await.unwrap();
        assert_eq!(u16::from(frame.code), 1001);
        assert_eq!(frame.reason.as_str(), SHUTDOWN_REASON);
    }
    tokio::time::timeout(helpers::WAIT, closing).await.unwrap().unwrap();

    assert!(server.is_shut_down());
    assert_eq!(server.connection_count(), 0);
    assert_eq!(
        recorder.closes(),
        vec![
            (1001, SHUTDOWN_REASON.to_string()),
            (1001, SHUTDOWN_REASON.to_string())
        ]
    );

    // Heartbeat stopped with the server.
    let pings = server.metrics().pings_sent;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(server.metrics().pings_sent, pings);

    // Idempotent.
    tokio::time::timeout(helpers::WAIT, server.shutdown())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_shutdown_releases_listener() {
    let (server, url) = helpers::start_server(ServerConfig::new()).await;
    server.shutdown().await;

    let attempt = tokio::time::timeout(helpers::WAIT, tokio_tungstenite::connect_async(url.as_str()))
        .await
        .unwrap();
    assert!(attempt.is_err());
}

#[tokio::test]
async fn test_servers_are_isolated() {
    let config = ServerConfig::new();
    let (server_a, url_a) = helpers::start_server(config.clone()).await;
    let (server_b, url_b) = helpers::start_server(config).await;

    let mut client_a = helpers::connect(&server_a, &url_a).await;
    let mut client_b = helpers::connect(&server_b, &url_b).await;

    assert_eq!(server_a.broadcast("only a", None), 1);
    assert_eq!(helpers::next_text(&mut client_a).await, "only a");
    assert!(helpers::stays_quiet(&mut client_b, Duration::from_millis(100)).await);

    let closing = tokio::spawn({
        let server_a = server_a.clone();
        async move { server_a.shutdown().await }
    });
    assert!(helpers::next_close(&mut client_a).await.is_some());
    closing.await.unwrap();

    assert!(!server_b.is_shut_down());
    assert_eq!(server_b.connection_count(), 1);
    assert_eq!(server_b.broadcast("still b", None), 1);
    assert_eq!(helpers::next_text(&mut client_b).await, "still b");
}
