//! WebSocket signaling transport
//!
//! Connects to a relay speaking the JSON event protocol over text frames. A read task
//! decodes frames into an inbox and a write task drains an outbox, so the session never
//! blocks on the socket itself. Malformed frames are logged and skipped.

use crate::signaling::{SignalingMessage, SignalingTransport};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// WebSocket transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WebSocketError {
    /// WebSocket connection failed
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected to the relay
    #[error("Not connected to relay")]
    NotConnected,

    /// Message could not be encoded
    #[error("Failed to encode message: {0}")]
    Encode(String),
}

/// Signaling transport over a WebSocket connection
pub struct WebSocketTransport {
    url: String,
    outbox: mpsc::Sender<String>,
    inbox: Mutex<mpsc::Receiver<SignalingMessage>>,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
}

impl WebSocketTransport {
    /// Connect to the relay at `url`
    ///
    /// # Errors
    ///
    /// Returns error if the WebSocket handshake fails
    pub async fn connect(url: &str) -> Result<Self, WebSocketError> {
        tracing::info!(url, "Connecting to signaling relay");

        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| WebSocketError::ConnectionFailed(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let (in_tx, in_rx) = mpsc::channel::<SignalingMessage>(100);
        let (out_tx, mut out_rx) = mpsc::channel::<String>(100);

        let read_task = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match SignalingMessage::from_json(&text) {
                        Ok(message) => {
                            if in_tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "Skipping malformed relay frame"),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by relay");
                        break;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        });

        let write_task = tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = write.send(Message::Text(text)).await {
                    tracing::error!(error = %e, "Failed to send WebSocket message");
                    break;
                }
            }
            let _ = write.close().await;
        });

        Ok(Self {
            url: url.to_string(),
            outbox: out_tx,
            inbox: Mutex::new(in_rx),
            read_task,
            write_task,
        })
    }

    /// Relay URL
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether both socket tasks are still running
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.read_task.is_finished() && !self.write_task.is_finished()
    }
}

#[async_trait]
impl SignalingTransport for WebSocketTransport {
    type Error = WebSocketError;

    async fn send_message(&self, message: SignalingMessage) -> Result<(), WebSocketError> {
        let text = message
            .to_json()
            .map_err(|e| WebSocketError::Encode(e.to_string()))?;
        self.outbox
            .send(text)
            .await
            .map_err(|_| WebSocketError::NotConnected)
    }

    async fn receive_message(&self) -> Result<SignalingMessage, WebSocketError> {
        self.inbox
            .lock()
            .await
            .recv()
            .await
            .ok_or(WebSocketError::NotConnected)
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.read_task.abort();
        self.write_task.abort();
    }
}
