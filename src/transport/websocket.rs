/// WebSocket transport for real-time message delivery.
/// Opens one connection per session to `{base}/ws/{user_id}?token=…` and
/// exchanges JSON frames over it.

use crate::error::{ChatError, Result};
use crate::identity::Identity;
use crate::protocol::{ClientFrame, ServerFrame};
use crate::transport::{ChatTransport, TransportLink};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

/// Default time allowed for the TCP + WebSocket handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    base_url: String,
    connect_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new(base_url: &str) -> Self {
        WebSocketTransport {
            base_url: base_url.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// WebSocket URL for this identity (http → ws, https → wss)
    pub fn endpoint(&self, identity: &Identity) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(ChatError::ConfigError(format!(
                    "unsupported URL scheme: {}",
                    other
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| ChatError::ConfigError(format!("cannot use scheme {}", scheme)))?;

        url.path_segments_mut()
            .map_err(|_| ChatError::ConfigError("server URL cannot be a base".to_string()))?
            .pop_if_empty()
            .push("ws")
            .push(&identity.user_id);
        url.query_pairs_mut()
            .clear()
            .append_pair("token", &identity.token);
        Ok(url)
    }
}

#[async_trait]
impl ChatTransport for WebSocketTransport {
    async fn open(&self, identity: &Identity) -> Result<TransportLink> {
        let url = self.endpoint(identity)?;
        log::debug!("Opening WebSocket for {}", identity.user_id);

        let (ws_stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| {
                ChatError::ConnectionError(format!(
                    "handshake timed out after {:?}",
                    self.connect_timeout
                ))
            })?
            .map_err(|e| ChatError::ConnectionError(format!("Connection failed: {}", e)))?;

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ServerFrame>();

        // Outgoing frames; ends when the session drops its sender
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let json = match serde_json::to_string(&frame) {
                    Ok(json) => json,
                    Err(e) => {
                        log::error!("Failed to encode frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = ws_sender.send(Message::Text(json.into())).await {
                    log::error!("Failed to send WebSocket message: {}", e);
                    return;
                }
            }
            let _ = ws_sender.send(Message::Close(None)).await;
        });

        // Incoming frames; dropping `inbound_tx` signals the link is gone
        tokio::spawn(async move {
            while let Some(result) = ws_receiver.next().await {
                match result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(frame) => {
                            if inbound_tx.send(frame).is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Ignoring malformed frame: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        log::info!("WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        log::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            log::info!("WebSocket connection closed");
        });

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_url_conversion() {
        let transport = WebSocketTransport::new("http://localhost:4000");
        let url = transport.endpoint(&Identity::new("alice", "t0k")).unwrap();
        assert_eq!(url.as_str(), "ws://localhost:4000/ws/alice?token=t0k");
    }

    #[test]
    fn test_wss_url_keeps_base_path() {
        let transport = WebSocketTransport::new("https://chat.example.com/api/");
        let url = transport.endpoint(&Identity::new("u 1", "a&b")).unwrap();
        assert_eq!(
            url.as_str(),
            "wss://chat.example.com/api/ws/u%201?token=a%26b"
        );
    }

    #[test]
    fn test_unsupported_scheme_is_rejected() {
        let transport = WebSocketTransport::new("ftp://localhost");
        let result = transport.endpoint(&Identity::new("alice", "tok"));
        assert!(matches!(result, Err(ChatError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_open_refused_reports_connection_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = WebSocketTransport::new(&format!("http://{}", addr))
            .with_connect_timeout(Duration::from_secs(2));
        let result = transport.open(&Identity::new("alice", "tok")).await;
        assert!(matches!(result, Err(ChatError::ConnectionError(_))));
    }
}
