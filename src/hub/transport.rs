// Transport seam for hub connections
// A transport opens links; a link exchanges text frames until either side closes it

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{ClientError, Result};

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Box<dyn Link>>;
}

/// One established link. `recv` must be cancel-safe since the connection driver
/// selects on it alongside outbound work.
#[async_trait]
pub trait Link: Send {
    async fn send(&mut self, frame: String) -> Result<()>;

    /// Next inbound text frame; `None` once the peer has closed the link.
    async fn recv(&mut self) -> Option<Result<String>>;

    async fn close(&mut self);
}

/// Production transport over WebSocket.
#[derive(Debug, Default, Clone)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn Link>> {
        debug!("Opening WebSocket to {}", redact(url));
        let (stream, response) = connect_async(url)
            .await
            .map_err(|e| ClientError::Transport(format!("WebSocket connect failed: {}", e)))?;
        debug!("WebSocket upgrade answered with HTTP {}", response.status());
        Ok(Box::new(WebSocketLink { stream }))
    }
}

struct WebSocketLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Link for WebSocketLink {
    async fn send(&mut self, frame: String) -> Result<()> {
        self.stream
            .send(WsMessage::Text(frame))
            .await
            .map_err(|e| ClientError::Transport(format!("WebSocket send failed: {}", e)))
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            match self.stream.next().await? {
                Ok(WsMessage::Text(text)) => return Some(Ok(text)),
                Ok(WsMessage::Binary(bytes)) => {
                    return Some(String::from_utf8(bytes).map_err(|e| {
                        ClientError::Protocol(format!("binary frame is not UTF-8: {}", e))
                    }))
                }
                Ok(WsMessage::Close(frame)) => {
                    debug!("WebSocket closed by peer: {:?}", frame);
                    return None;
                }
                // Control frames are answered by tungstenite itself
                Ok(_) => continue,
                Err(e) => return Some(Err(ClientError::Transport(format!("WebSocket receive failed: {}", e)))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            warn!("Error closing WebSocket: {}", e);
        }
    }
}

/// Strip the query string so access tokens never reach the log.
pub(crate) fn redact(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_drops_query() {
        assert_eq!(redact("wss://host/chatHub?access_token=secret"), "wss://host/chatHub");
        assert_eq!(redact("ws://host/statusHub"), "ws://host/statusHub");
    }
}
