//! TCP transport speaking RFC 6455 through `tokio-tungstenite`.
//!
//! Each accepted socket gets one driver task that owns the stream: it
//! forwards queued frames to the peer, turns inbound frames into
//! [`SocketEvent`]s, and emits exactly one `Close` event when it exits.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Sleep};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{
    ABNORMAL_CLOSURE, AcceptedSocket, HandshakeMetadata, NO_STATUS, Payload, PendingSocket,
    ProtocolHandler, ReadyState, Socket, SocketEvent, SocketState, Transport, TransportError,
    negotiate_protocol, parse_protocol_offer,
};

/// Upper bound for the HTTP upgrade exchange.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a server-initiated close waits for the peer's close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

impl From<tungstenite::Error> for TransportError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Io(io) => Self::Io(io.to_string()),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<Payload> for Message {
    fn from(payload: Payload) -> Self {
        match payload {
            Payload::Text(text) => Message::Text(text.into()),
            Payload::Binary(data) => Message::Binary(data),
        }
    }
}

/// WebSocket transport over a TCP listener.
///
/// One listener may back several servers; each `accept` call takes the next
/// TCP connection.
#[derive(Debug)]
pub struct TungsteniteTransport {
    listener: TcpListener,
    handshake_timeout: Duration,
    close_timeout: Duration,
}

impl TungsteniteTransport {
    /// Bind a new listener.
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::from_listener(listener))
    }

    /// Wrap an already bound listener.
    pub fn from_listener(listener: TcpListener) -> Self {
        Self {
            listener,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            close_timeout: CLOSE_TIMEOUT,
        }
    }

    /// Override how long a graceful close may wait for the peer.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }
}

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn accept(
        &self,
        protocols: Option<ProtocolHandler>,
    ) -> Result<PendingSocket, TransportError> {
        let (stream, remote_addr) = self.listener.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            trace!(%remote_addr, error = %e, "Failed to set TCP_NODELAY");
        }

        let handshake_timeout = self.handshake_timeout;
        let close_timeout = self.close_timeout;
        Ok(Box::pin(async move {
            match time::timeout(
                handshake_timeout,
                upgrade(stream, remote_addr, protocols, close_timeout),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::Handshake(format!(
                    "no upgrade from {remote_addr} within {handshake_timeout:?}"
                ))),
            }
        }))
    }
}

/// Request fields captured inside the handshake callback.
struct CapturedRequest {
    path: String,
    headers: Vec<(String, String)>,
    protocol: Option<String>,
}

async fn upgrade(
    stream: TcpStream,
    remote_addr: SocketAddr,
    protocols: Option<ProtocolHandler>,
    close_timeout: Duration,
) -> Result<AcceptedSocket, TransportError> {
    let (captured_tx, captured_rx) = oneshot::channel();

    let callback = move |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        let offered: Vec<String> = request
            .headers()
            .get_all(SEC_WEBSOCKET_PROTOCOL)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(parse_protocol_offer)
            .collect();

        let mut protocol = negotiate_protocol(&offered, protocols.as_ref());
        if let Some(name) = protocol.as_deref() {
            match HeaderValue::from_str(name) {
                Ok(value) => {
                    response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
                }
                Err(_) => {
                    debug!(%remote_addr, protocol = name, "Selected protocol is not a valid header value");
                    protocol = None;
                }
            }
        }

        let headers = request
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        let _ = captured_tx.send(CapturedRequest {
            path: request.uri().to_string(),
            headers,
            protocol,
        });
        Ok(response)
    };

    let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .map_err(|e| TransportError::Handshake(e.to_string()))?;
    let captured = captured_rx
        .await
        .map_err(|_| TransportError::Handshake("upgrade request was not captured".to_string()))?;

    let state = Arc::new(SocketState::new(ReadyState::Open));
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let kill = CancellationToken::new();

    tokio::spawn(drive(
        ws,
        Driver {
            state: state.clone(),
            outbound: outbound_rx,
            events: events_tx,
            kill: kill.clone(),
            close_timeout,
            remote_addr,
        },
    ));

    Ok(AcceptedSocket {
        socket: Arc::new(WsSocket {
            state,
            outbound: outbound_tx,
            kill,
        }),
        metadata: HandshakeMetadata {
            remote_addr: Some(remote_addr),
            path: captured.path,
            protocol: captured.protocol,
            headers: captured.headers,
        },
        events: events_rx,
    })
}

/// Handle to a tungstenite-backed socket.
#[derive(Debug)]
pub struct WsSocket {
    state: Arc<SocketState>,
    outbound: mpsc::UnboundedSender<Message>,
    kill: CancellationToken,
}

impl WsSocket {
    fn enqueue(&self, message: Message) -> Result<(), TransportError> {
        if self.state.get() != ReadyState::Open {
            return Err(TransportError::NotOpen);
        }
        self.outbound
            .send(message)
            .map_err(|_| TransportError::NotOpen)
    }
}

impl Socket for WsSocket {
    fn send(&self, payload: Payload) -> Result<(), TransportError> {
        self.enqueue(payload.into())
    }

    fn ping(&self) -> Result<(), TransportError> {
        self.enqueue(Message::Ping(Bytes::new()))
    }

    fn close(&self, code: u16, reason: &str) {
        if !self.state.transition(ReadyState::Open, ReadyState::Closing) {
            return;
        }
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        let _ = self.outbound.send(Message::Close(Some(frame)));
    }

    fn terminate(&self) {
        let _ = self.state.replace(ReadyState::Closed);
        self.kill.cancel();
    }

    fn ready_state(&self) -> ReadyState {
        self.state.get()
    }
}

/// State owned by a socket's driver task.
struct Driver {
    state: Arc<SocketState>,
    outbound: mpsc::UnboundedReceiver<Message>,
    events: mpsc::UnboundedSender<SocketEvent>,
    kill: CancellationToken,
    close_timeout: Duration,
    remote_addr: SocketAddr,
}

async fn drive(ws: WebSocketStream<TcpStream>, mut driver: Driver) {
    let (mut sink, mut stream) = ws.split();
    let mut received_close: Option<(u16, String)> = None;
    let mut close_deadline: Option<Pin<Box<Sleep>>> = None;
    let remote_addr = driver.remote_addr;

    let (code, reason) = loop {
        tokio::select! {
            () = driver.kill.cancelled() => {
                trace!(%remote_addr, "Socket terminated");
                break (ABNORMAL_CLOSURE, String::new());
            }
            () = expire(&mut close_deadline) => {
                debug!(%remote_addr, "Peer did not acknowledge close in time");
                break (ABNORMAL_CLOSURE, String::new());
            }
            Some(message) = driver.outbound.recv() => {
                if matches!(message, Message::Close(_)) && close_deadline.is_none() {
                    close_deadline = Some(Box::pin(time::sleep(driver.close_timeout)));
                }
                // A peer that stopped reading can stall the write indefinitely.
                let written = tokio::select! {
                    biased;
                    () = driver.kill.cancelled() => {
                        trace!(%remote_addr, "Socket terminated during write");
                        break (ABNORMAL_CLOSURE, String::new());
                    }
                    () = expire(&mut close_deadline) => {
                        debug!(%remote_addr, "Peer did not acknowledge close in time");
                        break (ABNORMAL_CLOSURE, String::new());
                    }
                    written = sink.send(message) => written,
                };
                if let Err(e) = written {
                    let _ = driver.events.send(SocketEvent::Error(e.into()));
                    break (ABNORMAL_CLOSURE, String::new());
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let _ = driver
                        .events
                        .send(SocketEvent::Message(Payload::Text(text.as_str().to_string())));
                }
                Some(Ok(Message::Binary(data))) => {
                    let _ = driver.events.send(SocketEvent::Message(Payload::Binary(data)));
                }
                Some(Ok(Message::Pong(_))) => {
                    let _ = driver.events.send(SocketEvent::Pong);
                }
                // Pings are answered by tungstenite itself.
                Some(Ok(Message::Ping(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    let _ = driver.state.transition(ReadyState::Open, ReadyState::Closing);
                    received_close = Some(
                        frame
                            .map(|f| (u16::from(f.code), f.reason.as_str().to_string()))
                            .unwrap_or((NO_STATUS, String::new())),
                    );
                }
                Some(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed))
                | None => {
                    break received_close
                        .take()
                        .unwrap_or((ABNORMAL_CLOSURE, String::new()));
                }
                Some(Err(e)) => {
                    let _ = driver.events.send(SocketEvent::Error(e.into()));
                    break (ABNORMAL_CLOSURE, String::new());
                }
            }
        }
    };

    let _ = driver.state.replace(ReadyState::Closed);
    drop(sink);
    drop(stream);
    trace!(%remote_addr, code, "Socket driver finished");
    let _ = driver.events.send(SocketEvent::Close { code, reason });
}

async fn expire(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
