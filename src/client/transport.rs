//! Client transport — the message-framed connection contract.
//!
//! DESIGN
//! ======
//! The session manager talks to transport traits so its state machine is
//! testable without sockets. A connection comes up as separate send/receive
//! halves: the receive half feeds a reader task while the session loop keeps
//! the send half, mirroring the split-socket shape of the production
//! websocket. `WsConnector` is the production implementation over
//! tokio-tungstenite, authenticating with the access token as an upgrade
//! query parameter.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::protocol::{ClientMsg, ServerMsg};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("connection closed")]
    Closed,
    #[error("invalid server message: {0}")]
    Decode(String),
    #[error("invalid endpoint url: {0}")]
    InvalidUrl(String),
}

// =============================================================================
// CONTRACTS
// =============================================================================

/// Send half of a live connection.
#[async_trait]
pub trait TransportTx: Send {
    async fn send(&mut self, msg: &ClientMsg) -> Result<(), TransportError>;

    /// Best-effort graceful shutdown.
    async fn close(&mut self);
}

/// Receive half of a live connection.
#[async_trait]
pub trait TransportRx: Send {
    /// Receive the next server message. `Closed` once the peer goes away.
    async fn recv(&mut self) -> Result<ServerMsg, TransportError>;
}

/// Opens a fresh transport per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        access_token: &str,
    ) -> Result<(Box<dyn TransportTx>, Box<dyn TransportRx>), TransportError>;
}

// =============================================================================
// WEBSOCKET IMPLEMENTATION
// =============================================================================

pub struct WsConnector {
    base_url: String,
}

impl WsConnector {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into() }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        access_token: &str,
    ) -> Result<(Box<dyn TransportTx>, Box<dyn TransportRx>), TransportError> {
        let url = ws_url(&self.base_url, access_token)?;
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (sink, stream) = stream.split();
        Ok((Box::new(WsTx { sink }), Box::new(WsRx { stream })))
    }
}

/// Map an http(s) base URL onto the websocket endpoint.
fn ws_url(base_url: &str, access_token: &str) -> Result<String, TransportError> {
    let trimmed = base_url.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("http://") {
        return Ok(format!("ws://{rest}/api/ws?token={access_token}"));
    }
    if let Some(rest) = trimmed.strip_prefix("https://") {
        return Ok(format!("wss://{rest}/api/ws?token={access_token}"));
    }
    Err(TransportError::InvalidUrl(base_url.to_owned()))
}

struct WsTx {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl TransportTx for WsTx {
    async fn send(&mut self, msg: &ClientMsg) -> Result<(), TransportError> {
        let json = serde_json::to_string(msg).map_err(|e| TransportError::Send(e.to_string()))?;
        self.sink
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
    }
}

struct WsRx {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl TransportRx for WsRx {
    async fn recv(&mut self) -> Result<ServerMsg, TransportError> {
        loop {
            let Some(message) = self.stream.next().await else {
                return Err(TransportError::Closed);
            };
            match message.map_err(|e| TransportError::Decode(e.to_string()))? {
                Message::Text(text) => {
                    return serde_json::from_str(&text).map_err(|e| TransportError::Decode(e.to_string()));
                }
                Message::Close(_) => return Err(TransportError::Closed),
                // Pings are answered by the library on the next flush.
                _ => {}
            }
        }
    }
}
