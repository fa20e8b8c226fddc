//! Client side of the signal channel.
//!
//! Bridges the WebSocket into typed mpsc channels so the room session never
//! touches the transport directly.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::{ClientMessage, ServerMessage};

/// Cloneable handle for sending client messages; each peer link's
/// negotiation task holds one.
#[derive(Clone)]
pub struct SignalSender {
    tx: mpsc::Sender<ClientMessage>,
}

impl SignalSender {
    /// Wraps a raw channel; lets a room session run over any transport
    /// that can carry [`ClientMessage`]s.
    pub fn new(tx: mpsc::Sender<ClientMessage>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, msg: ClientMessage) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| Error::Signaling("signal channel closed".into()))
    }
}

pub struct SignalChannel {
    tx: SignalSender,
    rx: mpsc::Receiver<ServerMessage>,
}

impl SignalChannel {
    /// Connects to the signaling server and spawns the forwarding tasks.
    /// Both tasks exit on their own when either side of the socket closes.
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (incoming_tx, incoming_rx) = mpsc::channel::<ServerMessage>(64);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<ClientMessage>(64);

        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                match serde_json::to_string(&msg) {
                    Ok(json) => {
                        if write.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to encode client message"),
                }
            }
            // Dropping the sender half ends the session; tell the server.
            let _ = write.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(parsed) => {
                        if incoming_tx.send(parsed).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "ignoring malformed server message"),
                }
            }
            debug!("signal channel reader finished");
        });

        Ok(Self {
            tx: SignalSender { tx: outgoing_tx },
            rx: incoming_rx,
        })
    }

    /// Splits into the cloneable sender and the server-message stream the
    /// room session consumes.
    pub fn split(self) -> (SignalSender, mpsc::Receiver<ServerMessage>) {
        (self.tx, self.rx)
    }

    pub async fn send(&self, msg: ClientMessage) -> Result<()> {
        self.tx.send(msg).await
    }

    pub async fn receive(&mut self) -> Option<ServerMessage> {
        self.rx.recv().await
    }
}
