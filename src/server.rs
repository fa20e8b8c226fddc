//! Signaling server: WebSocket endpoint, presence fan-out, and the
//! store-less signal relay.
//!
//! Each connection gets a server-assigned participant id for its lifetime.
//! All membership mutation and relay routing happens under one lock; actual
//! socket writes go through per-participant queues so nothing blocks while
//! the lock is held.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::{ClientMessage, ParticipantId, ServerMessage, SignalEnvelope};
use crate::registry::RoomRegistry;

type Outbox = mpsc::UnboundedSender<ServerMessage>;

#[derive(Default)]
struct ServerState {
    registry: RoomRegistry,
    peers: HashMap<ParticipantId, Outbox>,
}

impl ServerState {
    fn deliver(&self, to: &ParticipantId, msg: ServerMessage) {
        if let Some(outbox) = self.peers.get(to) {
            // A closed outbox means the peer is mid-disconnect; the
            // envelope is dropped the same way an unknown address is.
            let _ = outbox.send(msg);
        } else {
            debug!(%to, "dropping message for absent participant");
        }
    }

    /// Forwards an envelope to its addressee. `from` is always stamped by
    /// the caller with the sender's server-side identity, so it cannot be
    /// spoofed; the payload passes through uninspected.
    fn relay(&self, envelope: SignalEnvelope) {
        let SignalEnvelope { to, from, payload } = envelope;
        debug!(%from, %to, kind = payload.kind(), "relaying signal");
        self.deliver(&to, ServerMessage::Signal { from, payload });
    }

    fn handle_join(&mut self, participant: &ParticipantId, room_id: &str) {
        if self.registry.room_of(participant).is_some() {
            warn!(%participant, "join ignored: already in a room");
            return;
        }
        match self.registry.join(participant, &room_id.to_string()) {
            Ok(admission) => {
                info!(%participant, %room_id, "participant joined");
                self.deliver(
                    participant,
                    ServerMessage::Roster {
                        participants: admission.others.clone(),
                    },
                );
                for other in &admission.others {
                    self.deliver(
                        other,
                        ServerMessage::Joined {
                            participant: participant.clone(),
                        },
                    );
                }
                if admission.at_capacity {
                    for member in self.registry.members(&room_id.to_string()) {
                        self.deliver(&member, ServerMessage::RoomFull);
                    }
                }
            }
            Err(Error::RoomFull) => {
                info!(%participant, %room_id, "join rejected: room full");
                self.deliver(participant, ServerMessage::RoomFull);
            }
            Err(e) => warn!(%participant, %room_id, error = %e, "join failed"),
        }
    }

    fn handle_disconnect(&mut self, participant: &ParticipantId) {
        self.peers.remove(participant);
        if let Some(departure) = self.registry.leave(participant) {
            info!(%participant, room_id = %departure.room_id, "participant left");
            for other in &departure.remaining {
                self.deliver(
                    other,
                    ServerMessage::Left {
                        participant: participant.clone(),
                    },
                );
            }
        }
    }
}

pub struct SignalServer {
    listener: TcpListener,
    state: Arc<Mutex<ServerState>>,
}

impl SignalServer {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Signaling(format!("bind {} failed: {}", addr, e)))?;
        Ok(Self {
            listener,
            state: Arc::new(Mutex::new(ServerState::default())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| Error::Signaling(format!("local_addr failed: {}", e)))
    }

    /// Accept loop. Runs until the listener fails.
    pub async fn run(self) -> Result<()> {
        info!(addr = %self.local_addr()?, "signaling server listening");
        loop {
            let (stream, remote) = self
                .listener
                .accept()
                .await
                .map_err(|e| Error::Signaling(format!("accept failed: {}", e)))?;
            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(state, stream).await {
                    debug!(%remote, error = %e, "connection ended with error");
                }
            });
        }
    }
}

async fn handle_connection(state: Arc<Mutex<ServerState>>, stream: TcpStream) -> Result<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_write, mut ws_read) = ws_stream.split();

    // Identity is assigned here and lives exactly as long as this socket.
    let participant: ParticipantId = Uuid::new_v4().to_string();
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<ServerMessage>();
    state
        .lock()
        .await
        .peers
        .insert(participant.clone(), outbox_tx);
    debug!(%participant, "participant connected");

    let writer = tokio::spawn(async move {
        while let Some(msg) = outbox_rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_write.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode server message"),
            }
        }
        let _ = ws_write.close().await;
    });

    while let Some(msg) = ws_read.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(_) => break,
        };
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            // Pings are answered by tungstenite itself.
            _ => continue,
        };
        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Join { room_id }) => {
                state.lock().await.handle_join(&participant, &room_id);
            }
            Ok(ClientMessage::Signal { to, payload }) => {
                state.lock().await.relay(SignalEnvelope {
                    to,
                    from: participant.clone(),
                    payload,
                });
            }
            Err(e) => {
                // Malformed input is dropped, never fatal.
                warn!(%participant, error = %e, "ignoring malformed client message");
            }
        }
    }

    state.lock().await.handle_disconnect(&participant);
    writer.abort();
    Ok(())
}
