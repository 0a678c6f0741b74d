//! Socket layer under the gateway session.
//!
//! The session talks to a `GatewayTransport` so its protocol logic can be
//! exercised against scripted transports in tests; `WsConnector` is the
//! production implementation over a websocket.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::warn;

use crate::wire::GatewayMessage;

/// Close code the platform sends when it rejects our credentials. Terminal:
/// reconnecting with the same token would loop forever.
const CLOSE_AUTH_FAILED: u16 = 4004;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Gateway connection error: {0}")]
    Connection(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Gateway frame error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The platform refused our credentials. Not retried.
    #[error("Gateway rejected authentication: {0}")]
    AuthRejected(String),

    #[error("Gateway protocol violation: {0}")]
    Protocol(String),

    /// The peer closed the socket without an auth rejection.
    #[error("Gateway connection closed")]
    Closed,
}

/// One live gateway connection.
#[async_trait]
pub trait GatewayTransport: Send {
    async fn send(&mut self, msg: GatewayMessage) -> Result<(), GatewayError>;

    /// Next frame, or `None` when the peer closed cleanly.
    async fn recv(&mut self) -> Result<Option<GatewayMessage>, GatewayError>;
}

/// Dials new gateway connections for the session's reconnect loop.
#[async_trait]
pub trait GatewayConnector: Send + Sync {
    type Transport: GatewayTransport;

    async fn connect(&self) -> Result<Self::Transport, GatewayError>;
}

/// Production connector: one websocket per connection attempt.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl GatewayConnector for WsConnector {
    type Transport = WsTransport;

    async fn connect(&self) -> Result<WsTransport, GatewayError> {
        let (stream, _) = connect_async(&self.url).await?;
        Ok(WsTransport { stream })
    }
}

pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl GatewayTransport for WsTransport {
    async fn send(&mut self, msg: GatewayMessage) -> Result<(), GatewayError> {
        let text = serde_json::to_string(&msg)?;
        self.stream.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<GatewayMessage>, GatewayError> {
        while let Some(frame) = self.stream.next().await {
            match frame? {
                Message::Text(text) => {
                    return Ok(Some(serde_json::from_str(&text)?));
                }
                Message::Close(Some(close)) if u16::from(close.code) == CLOSE_AUTH_FAILED => {
                    return Err(GatewayError::AuthRejected(close.reason.to_string()));
                }
                Message::Close(_) => return Ok(None),
                Message::Ping(_) | Message::Pong(_) => {
                    // tungstenite answers pings itself.
                }
                other => {
                    warn!(frame = ?other, "Ignoring non-text gateway frame");
                }
            }
        }
        Ok(None)
    }
}
