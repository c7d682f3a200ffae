//! Shared test helpers for integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use wshub_realtime::{Connection, Payload, ServerConfig, TungsteniteTransport, WsServer};

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(3);

/// Client side of a test connection.
pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A callback invocation seen by the server.
#[derive(Debug, Clone)]
pub enum Event {
    Connected(Arc<Connection>),
    Message(Arc<Connection>, Payload),
    Error(Arc<Connection>, String),
    Closed(Arc<Connection>, u16, String),
}

/// Records every callback a server makes.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Recorder {
    /// Install recording handlers on `config`.
    pub fn install(&self, config: ServerConfig) -> ServerConfig {
        let (a, b, c, d) = (
            self.events.clone(),
            self.events.clone(),
            self.events.clone(),
            self.events.clone(),
        );
        config
            .on_connection(move |conn| a.lock().unwrap().push(Event::Connected(conn.clone())))
            .on_message(move |payload, conn| {
                b.lock()
                    .unwrap()
                    .push(Event::Message(conn.clone(), payload))
            })
            .on_error(move |error, conn| {
                c.lock()
                    .unwrap()
                    .push(Event::Error(conn.clone(), error.to_string()))
            })
            .on_close(move |code, reason, conn| {
                d.lock()
                    .unwrap()
                    .push(Event::Closed(conn.clone(), code, reason))
            })
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn connected(&self) -> Vec<Arc<Connection>> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Connected(conn) => Some(conn),
                _ => None,
            })
            .collect()
    }

    pub fn messages(&self) -> Vec<Payload> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Message(_, payload) => Some(payload),
                _ => None,
            })
            .collect()
    }

    pub fn closes(&self) -> Vec<(u16, String)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Closed(_, code, reason) => Some((code, reason)),
                _ => None,
            })
            .collect()
    }

    /// Wait until `condition` holds for the recorded events.
    pub async fn wait_for(&self, condition: impl Fn(&[Event]) -> bool) {
        eventually(|| condition(&self.events.lock().unwrap())).await;
    }
}

/// Poll `condition` until it holds, failing the test after [`WAIT`].
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Start a server on an ephemeral loopback port. Returns it with its URL.
pub async fn start_server(config: ServerConfig) -> (WsServer, String) {
    let transport = TungsteniteTransport::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test listener");
    let addr = transport.local_addr().expect("Failed to read local addr");
    let server = WsServer::create(Arc::new(transport), config);
    (server, format!("ws://{addr}/"))
}

/// Connect a client and wait until the server has registered it.
pub async fn connect(server: &WsServer, url: &str) -> Client {
    let before = server.metrics().connections_total;
    let (client, _response) = connect_async(url).await.expect("Failed to connect");
    eventually(|| server.metrics().connections_total > before).await;
    client
}

/// Connect offering `protocols`. Returns the client and the negotiated protocol.
pub async fn connect_with_protocols(url: &str, protocols: &[&str]) -> (Client, Option<String>) {
    let mut request = url.into_client_request().expect("Invalid URL");
    request.headers_mut().insert(
        SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_str(&protocols.join(", ")).expect("Invalid protocol list"),
    );
    let (client, response) = connect_async(request).await.expect("Failed to connect");
    let protocol = response
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    (client, protocol)
}

/// Next text frame, skipping control frames.
pub async fn next_text(client: &mut Client) -> String {
    loop {
        let message = tokio::time::timeout(WAIT, client.next())
            .await
            .expect("Timed out waiting for a frame")
            .expect("Stream ended")
            .expect("Read failed");
        match message {
            Message::Text(text) => return text.as_str().to_string(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("Expected text, got {other:?}"),
        }
    }
}

/// Read until the server's close frame arrives, then drain the stream so the
/// close handshake completes.
pub async fn next_close(client: &mut Client) -> Option<CloseFrame> {
    let mut close = None;
    tokio::time::timeout(WAIT, async {
        while let Some(message) = client.next().await {
            match message {
                Ok(Message::Close(frame)) => close = frame,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    })
    .await
    .expect("Timed out waiting for close");
    close
}

/// Whether no data frame arrives within `window`.
pub async fn stays_quiet(client: &mut Client, window: Duration) -> bool {
    match tokio::time::timeout(window, client.next()).await {
        Err(_) => true,
        Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => true,
        Ok(_) => false,
    }
}
