//! Socket ownership: connect, classify rejections, and pump outbound records.
//!
//! The socket is split after connect. The read half goes to the dispatcher's
//! read loop; the write half is owned by [`run_writer`], which drains the
//! [`TransportHandle`] queue. Every other task talks to the socket only through
//! a cloned handle, so closing the handle is the single way to end a connection.

use crate::protocol;
use futures_util::{Sink, SinkExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::ORIGIN, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub use tokio_tungstenite::tungstenite::Error as WsError;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const OUTBOUND_BUFFER: usize = 64;

/// Why the socket could not be opened, classified by the status the server
/// answered the upgrade with.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("connection id not found (HTTP 404)")]
    NotFound,
    #[error("socket rejected as unauthorized (HTTP 401)")]
    Unauthorized,
    #[error("connection id already in use (HTTP 409)")]
    Conflict,
    #[error("socket rejected with HTTP {0}")]
    Rejected(u16),
    #[error("socket error: {0}")]
    Other(String),
}

impl ConnectError {
    pub fn from_status(status: u16) -> Self {
        match status {
            404 => Self::NotFound,
            401 => Self::Unauthorized,
            409 => Self::Conflict,
            other => Self::Rejected(other),
        }
    }

    pub fn classify(err: &WsError) -> Self {
        match err {
            WsError::Http(response) => Self::from_status(response.status().as_u16()),
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
}

/// Where the socket lives and which origin it expects.
#[derive(Debug, Clone)]
pub struct SocketEndpoint {
    pub ws_url: String,
    pub origin: String,
}

impl SocketEndpoint {
    pub fn url(&self, connection_id: &str, envelope_json: &str) -> String {
        build_socket_url(&self.ws_url, connection_id, envelope_json)
    }
}

pub fn build_socket_url(ws_url: &str, connection_id: &str, envelope_json: &str) -> String {
    format!(
        "{}/api/Control?id={}&access_token={}",
        ws_url.trim_end_matches('/'),
        urlencoding::encode(connection_id),
        urlencoding::encode(envelope_json)
    )
}

pub async fn open_socket(url: &str, origin: &str, timeout: Duration) -> Result<WsStream, ConnectError> {
    let mut request = url
        .into_client_request()
        .map_err(|err| ConnectError::Other(err.to_string()))?;
    let origin = HeaderValue::from_str(origin).map_err(|err| ConnectError::Other(err.to_string()))?;
    request.headers_mut().insert(ORIGIN, origin);

    match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request)).await {
        Ok(Ok((stream, response))) => {
            tracing::debug!(status = response.status().as_u16(), "socket upgraded");
            Ok(stream)
        }
        Ok(Err(err)) => Err(ConnectError::classify(&err)),
        Err(_) => Err(ConnectError::Other(format!(
            "connect timed out after {}s",
            timeout.as_secs()
        ))),
    }
}

/// Cloneable sender side of one open connection.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    outbound: mpsc::Sender<String>,
    closed: Arc<watch::Sender<bool>>,
}

impl TransportHandle {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<String>) {
        let (outbound, rx) = mpsc::channel(buffer);
        let (closed, _) = watch::channel(false);
        (
            Self {
                outbound,
                closed: Arc::new(closed),
            },
            rx,
        )
    }

    pub async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(text)
            .await
            .map_err(|_| TransportError::Closed)
    }

    pub async fn send_handshake(&self) -> Result<(), TransportError> {
        self.send_text(protocol::handshake()).await
    }

    pub async fn send_ping(&self) -> Result<(), TransportError> {
        self.send_text(protocol::ping()).await
    }

    /// Marks the connection closed. Returns `true` for the call that closed it.
    pub fn close(&self) -> bool {
        !self.closed.send_replace(true)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

/// Drains the outbound queue into the socket until the handle is closed or a
/// write fails, then sends a close frame.
pub async fn run_writer<S>(mut sink: S, mut outbound: mpsc::Receiver<String>, handle: TransportHandle)
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let mut closed = handle.closed_signal();
    loop {
        if *closed.borrow_and_update() {
            break;
        }
        tokio::select! {
            next = outbound.recv() => match next {
                Some(text) => {
                    if let Err(err) = sink.send(Message::Text(text)).await {
                        tracing::warn!(error = %err, "socket write failed");
                        handle.close();
                        return;
                    }
                }
                None => break,
            },
            changed = closed.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    if let Err(err) = sink.send(Message::Close(None)).await {
        tracing::debug!(error = %err, "close frame not sent");
    }
    let _ = sink.close().await;
}

/// Proactive keepalive; stops at the first failed send.
pub async fn run_keepalive(handle: TransportHandle, interval: Duration) {
    let start = tokio::time::Instant::now() + interval;
    let mut ticker = tokio::time::interval_at(start, interval);
    loop {
        ticker.tick().await;
        if handle.send_ping().await.is_err() {
            tracing::debug!("keepalive stopped, transport closed");
            return;
        }
        tracing::debug!("keepalive ping sent");
    }
}
