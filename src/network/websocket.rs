//! WebSocket transport to the agent
//!
//! One socket per session. After the handshake the client announces its
//! outbound format with a `setup` message, then a writer task drains the
//! outbound queue while a reader task turns agent messages into events.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::transport::{Transport, TransportEvent, TransportSession};
use crate::config::TransportConfig;
use crate::constants::INBOUND_QUEUE_EVENTS;
use crate::error::NetworkError;
use crate::protocol::{ClientMessage, ServerMessage};

pub struct WebSocketTransport {
    config: TransportConfig,
    sample_rate: u32,
    channels: u16,
}

impl WebSocketTransport {
    /// `sample_rate` and `channels` describe the audio this client sends
    pub fn new(config: TransportConfig, sample_rate: u32, channels: u16) -> Self {
        Self {
            config,
            sample_rate,
            channels,
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self) -> Result<TransportSession, NetworkError> {
        let timeout = self.config.connect_timeout();
        let (socket, _response) =
            match tokio::time::timeout(timeout, connect_async(self.config.url.as_str())).await {
                Ok(Ok(connected)) => connected,
                Ok(Err(e)) => return Err(NetworkError::ConnectionFailed(e.to_string())),
                Err(_) => return Err(NetworkError::Timeout(self.config.connect_timeout_ms)),
            };

        let session_id = Uuid::new_v4().to_string();
        info!("Connected to {} (session {})", self.config.url, session_id);

        let (mut write, mut read) = socket.split();

        let setup = ClientMessage::Setup {
            session_id,
            sample_rate: self.sample_rate,
            channels: self.channels,
        };
        let setup = setup
            .to_json()
            .map_err(|e| NetworkError::InvalidMessage(e.to_string()))?;
        write
            .send(Message::Text(setup))
            .await
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;

        let (out_tx, mut out_rx) = mpsc::channel(self.config.outbound_queue.max(1));
        let (in_tx, in_rx) = mpsc::channel(INBOUND_QUEUE_EVENTS);

        let writer = tokio::spawn(async move {
            while let Some(chunk) = out_rx.recv().await {
                let text = match ClientMessage::Audio(chunk).to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to serialize audio chunk: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(text)).await {
                    debug!("Writer stopped: {}", e);
                    return;
                }
            }
            // Outbound side dropped: close politely
            let _ = write.send(Message::Close(None)).await;
            let _ = write.close().await;
        });

        let reader = tokio::spawn(async move {
            let terminal = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => match ServerMessage::from_json(&text) {
                        Ok(msg) => {
                            let event = TransportEvent::from(msg);
                            let terminal = event.is_terminal();
                            if in_tx.send(event).await.is_err() || terminal {
                                return;
                            }
                        }
                        Err(e) => warn!("Ignoring unparseable agent message: {}", e),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        debug!("Agent closed the channel: {:?}", frame);
                        break TransportEvent::Closed;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break TransportEvent::Error(e.to_string()),
                    None => break TransportEvent::Closed,
                }
            };
            let _ = in_tx.send(terminal).await;
        });

        Ok(TransportSession::new(
            out_tx,
            in_rx,
            vec![writer, reader],
            self.config.close_timeout(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_agent_fails() {
        let config = TransportConfig {
            url: "ws://127.0.0.1:1/live".into(),
            connect_timeout_ms: 2000,
            ..Default::default()
        };
        let transport = WebSocketTransport::new(config, 16_000, 1);
        assert!(matches!(
            transport.open().await,
            Err(NetworkError::ConnectionFailed(_)) | Err(NetworkError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_url_fails() {
        let config = TransportConfig {
            url: "not a url".into(),
            ..Default::default()
        };
        let transport = WebSocketTransport::new(config, 16_000, 1);
        assert!(transport.open().await.is_err());
    }
}
