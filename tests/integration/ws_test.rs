//! Integration tests for WebSocket connection and messaging.

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Message;

use helpers::{Event, Recorder};
use wshub_realtime::{Payload, ServerConfig};

#[tokio::test]
async fn test_protocol_negotiation() {
    let config = ServerConfig::new().on_protocols(|offers| offers.first().cloned());
    let (server, url) = helpers::start_server(config).await;

    let (_client, protocol) = helpers::connect_with_protocols(&url, &["test-protocol"]).await;
    assert_eq!(protocol.as_deref(), Some("test-protocol"));

    helpers::eventually(|| server.connection_count() == 1).await;
    assert_eq!(server.connections()[0].protocol(), Some("test-protocol"));
}

#[tokio::test]
async fn test_first_offer_wins_without_handler() {
    let (server, url) = helpers::start_server(ServerConfig::new()).await;

    let (_client, protocol) = helpers::connect_with_protocols(&url, &["json", "text"]).await;
    assert_eq!(protocol.as_deref(), Some("json"));
    helpers::eventually(|| server.connection_count() == 1).await;
}

#[tokio::test]
async fn test_message_round_trip() {
    let recorder = Recorder::default();
    let (server, url) = helpers::start_server(recorder.install(ServerConfig::new())).await;
    let mut client = helpers::connect(&server, &url).await;

    client.send(Message::Text("test!".into())).await.unwrap();
    recorder.wait_for(|events| events.len() >= 2).await;

    assert_eq!(recorder.messages(), vec![Payload::from("test!")]);
    assert_eq!(server.metrics().messages_received, 1);
}

#[tokio::test]
async fn test_binary_message_round_trip() {
    let recorder = Recorder::default();
    let (server, url) = helpers::start_server(recorder.install(ServerConfig::new())).await;
    let mut client = helpers::connect(&server, &url).await;

    client
        .send(Message::Binary(vec![0xde, 0xad, 0xbe, 0xef].into()))
        .await
        .unwrap();
    recorder.wait_for(|events| events.len() >= 2).await;

    let messages = recorder.messages();
    assert_eq!(messages[0].as_bytes(), &[0xde, 0xad, 0xbe, 0xef]);
    assert!(messages[0].as_text().is_none());
}

#[tokio::test]
async fn test_handshake_metadata_is_captured() {
    let (server, url) = helpers::start_server(ServerConfig::new()).await;
    let _client = helpers::connect(&server, &format!("{url}room/42?x=1")).await;

    let conn = server.connections().remove(0);
    assert_eq!(conn.metadata().path, "/room/42?x=1");
    assert!(conn.remote_addr().is_some_and(|addr| addr.ip().is_loopback()));
    assert!(conn.metadata().header("sec-websocket-key").is_some());
}

#[tokio::test]
async fn test_send_json_round_trip() {
    let (server, url) = helpers::start_server(ServerConfig::new()).await;
    let mut client = helpers::connect(&server, &url).await;

    let conn = server.connections().remove(0);
    server
        .send_json(&conn, &json!({"foo": "bar", "baz": 42}))
        .unwrap();

    let value: Value = serde_json::from_str(&helpers::next_text(&mut client).await).unwrap();
    assert_eq!(value, json!({"foo": "bar", "baz": 42}));
}

#[tokio::test]
async fn test_broadcast_exclusion() {
    let recorder = Recorder::default();
    let (server, url) = helpers::start_server(recorder.install(ServerConfig::new())).await;
    let mut client_a = helpers::connect(&server, &url).await;
    let mut client_b = helpers::connect(&server, &url).await;
    let conn_b = recorder.connected()[1].clone();

    assert_eq!(server.broadcast("foo", Some(&conn_b)), 1);
    assert_eq!(server.broadcast("bar", None), 2);

    assert_eq!(helpers::next_text(&mut client_a).await, "foo");
    assert_eq!(helpers::next_text(&mut client_a).await, "bar");
    assert_eq!(helpers::next_text(&mut client_b).await, "bar");
    assert!(helpers::stays_quiet(&mut client_b, Duration::from_millis(100)).await);
}

#[tokio::test]
async fn test_broadcast_json_reaches_everyone() {
    let (server, url) = helpers::start_server(ServerConfig::new()).await;
    let mut first = helpers::connect(&server, &url).await;
    let mut second = helpers::connect(&server, &url).await;

    let sent = server
        .broadcast_json(&json!({"event": "tick", "n": 1}), None)
        .unwrap();
    assert_eq!(sent, 2);

    for client in [&mut first, &mut second] {
        let value: Value = serde_json::from_str(&helpers::next_text(client).await).unwrap();
        assert_eq!(value["event"], "tick");
    }
}

#[tokio::test]
async fn test_connection_identity_across_handlers() {
    let recorder = Recorder::default();
    let (server, url) = helpers::start_server(recorder.install(ServerConfig::new())).await;
    let mut client = helpers::connect(&server, &url).await;

    client.send(Message::Text("hi".into())).await.unwrap();
    client.close(None).await.unwrap();
    recorder
        .wait_for(|events| events.iter().any(|e| matches!(e, Event::Closed(..))))
        .await;

    let events = recorder.events();
    let Event::Connected(first) = &events[0] else {
        panic!("expected connect first, got {events:?}");
    };
    for event in &events {
        let conn = match event {
            Event::Connected(conn)
            | Event::Message(conn, _)
            | Event::Error(conn, _)
            | Event::Closed(conn, ..) => conn,
        };
        assert!(Arc::ptr_eq(conn, first));
    }
}

#[tokio::test]
async fn test_client_close_code_reaches_close_handler() {
    let recorder = Recorder::default();
    let (server, url) = helpers::start_server(recorder.install(ServerConfig::new())).await;
    let mut client = helpers::connect(&server, &url).await;

    client
        .close(Some(tokio_tungstenite::tungstenite::protocol::CloseFrame {
            code: 4100.into(),
            reason: "done".into(),
        }))
        .await
        .unwrap();
    recorder.wait_for(|events| events.len() >= 2).await;

    assert_eq!(recorder.closes(), vec![(4100, "done".to_string())]);
    helpers::eventually(|| server.connection_count() == 0).await;
}

#[tokio::test]
async fn test_server_close_code_and_reason() {
    let recorder = Recorder::default();
    let config = recorder
        .install(ServerConfig::new())
        .on_connection(|conn| conn.close(4000, "Test reason"));
    let (server, url) = helpers::start_server(config).await;
    let (mut client, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    let frame = helpers::next_close(&mut client).await.unwrap();
    assert_eq!(u16::from(frame.code), 4000);
    assert_eq!(frame.reason.as_str(), "Test reason");

    recorder.wait_for(|events| !events.is_empty()).await;
    assert_eq!(recorder.closes(), vec![(4000, "Test reason".to_string())]);
    helpers::eventually(|| server.connection_count() == 0).await;
}

#[tokio::test]
async fn test_dropped_client_closes_abnormally() {
    let recorder = Recorder::default();
    let (server, url) = helpers::start_server(recorder.install(ServerConfig::new())).await;
    let client = helpers::connect(&server, &url).await;

    drop(client);
    recorder
        .wait_for(|events| events.iter().any(|e| matches!(e, Event::Closed(..))))
        .await;

    assert_eq!(recorder.closes()[0].0, 1006);
    assert_eq!(server.connection_count(), 0);
}
