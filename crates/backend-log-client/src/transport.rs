//! Socket and timer seams of the client.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::errors::{ClientError, ClientResult};

/// An open text-frame channel to the hub.
#[async_trait]
pub trait Connection: Send {
    async fn send(&mut self, text: String) -> ClientResult<()>;

    /// Next text frame. `None` once the peer closed the socket.
    async fn recv(&mut self) -> Option<ClientResult<String>>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> ClientResult<Box<dyn Connection>>;
}

/// Source of reconnect delays.
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn sleep(&self, delay: Duration);
}

pub struct TokioScheduler;

#[async_trait]
impl Scheduler for TokioScheduler {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> ClientResult<Box<dyn Connection>> {
        let (stream, _response) =
            connect_async(url)
                .await
                .map_err(|err| ClientError::Connect {
                    url: url.to_string(),
                    reason: err.to_string(),
                })?;
        Ok(Box::new(WsConnection { stream }))
    }
}

struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&mut self, text: String) -> ClientResult<()> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|err| ClientError::Socket(err.to_string()))
    }

    async fn recv(&mut self) -> Option<ClientResult<String>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Close(_)) => return None,
                // Protocol-level pings are answered by tungstenite itself.
                Ok(_) => continue,
                Err(err) => return Some(Err(ClientError::Socket(err.to_string()))),
            }
        }
    }
}
