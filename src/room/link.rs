//! One peer link: the connection object and negotiation state for a single
//! remote participant.
//!
//! Links never talk to the signal channel or the view binder directly;
//! everything the connection object raises comes back to the room session
//! as a [`LinkEvent`], and the session applies events to a link one at a
//! time.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{Error, Result};
use crate::media::LocalMediaSession;
use crate::metrics::{LinkQualityMonitor, QualityBoard};
use crate::protocol::{ClientMessage, NegotiationPayload, ParticipantId};
use crate::signaling::SignalSender;
use crate::status::LinkState;

/// Which side proposes the offer. The side that already knew about the
/// other (from the roster) always initiates, so exactly one offer exists
/// per pair and glare cannot happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Events raised by a link's connection object or by spawned negotiation
/// work, consumed by the room session loop.
pub enum LinkEvent {
    CandidateDiscovered {
        peer: ParticipantId,
        candidate: RTCIceCandidateInit,
    },
    ConnectionChanged {
        peer: ParticipantId,
        state: RTCPeerConnectionState,
    },
    TrackReceived {
        peer: ParticipantId,
        track: Arc<TrackRemote>,
    },
    /// Offer created, applied locally, and handed to the relay.
    OfferSent {
        peer: ParticipantId,
    },
    /// Remote offer applied and our answer sent back.
    AnswerSent {
        peer: ParticipantId,
    },
    /// Remote answer applied; the description exchange is complete.
    AnswerApplied {
        peer: ParticipantId,
    },
    NegotiationFailed {
        peer: ParticipantId,
        reason: String,
    },
}

pub struct PeerLink {
    remote: ParticipantId,
    role: Role,
    state: LinkState,
    pc: Arc<RTCPeerConnection>,
    /// Remote candidates that arrived before the remote description.
    pending_candidates: Vec<RTCIceCandidateInit>,
    has_remote_description: bool,
    /// Set once remote-description work has been dispatched. The relay
    /// forwards anything, so duplicated offers and answers must be dropped
    /// here instead of racing the task already applying the description.
    remote_description_started: bool,
    quality: Option<LinkQualityMonitor>,
}

impl PeerLink {
    /// Creates the connection object for `remote`, attaches every local
    /// track, and wires its callbacks into the session event channel.
    pub async fn connect(
        remote: ParticipantId,
        role: Role,
        media: &LocalMediaSession,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_owned()],
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);

        for track in media.outbound_tracks() {
            let sender = pc.add_track(track).await?;
            // The sender must be read for RTCP handling to run.
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
        }

        let peer = remote.clone();
        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let peer = peer.clone();
            let tx = tx.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = tx.send(LinkEvent::CandidateDiscovered {
                                peer,
                                candidate: init,
                            });
                        }
                        Err(e) => warn!(%peer, error = %e, "failed to serialize candidate"),
                    }
                }
            })
        }));

        let peer = remote.clone();
        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let peer = peer.clone();
            let tx = tx.clone();
            Box::pin(async move {
                debug!(%peer, %state, "connection state changed");
                let _ = tx.send(LinkEvent::ConnectionChanged { peer, state });
            })
        }));

        let peer = remote.clone();
        let tx = events.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let peer = peer.clone();
            let tx = tx.clone();
            Box::pin(async move {
                debug!(%peer, kind = %track.kind(), "remote track received");
                let _ = tx.send(LinkEvent::TrackReceived { peer, track });
            })
        }));

        Ok(Self {
            remote,
            role,
            state: LinkState::New,
            pc,
            pending_candidates: Vec::new(),
            has_remote_description: false,
            remote_description_started: false,
            quality: None,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn set_state(&mut self, state: LinkState) {
        self.state = state;
    }

    pub fn pc(&self) -> Arc<RTCPeerConnection> {
        Arc::clone(&self.pc)
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Claims the one remote-description slot this link has. Returns false
    /// when description work was already dispatched, in which case the
    /// caller must drop the duplicate instead of spawning a second apply.
    pub fn begin_remote_description(&mut self) -> bool {
        if self.remote_description_started {
            return false;
        }
        self.remote_description_started = true;
        true
    }

    /// Spawned by the session for initiator links so description work never
    /// blocks the event loop. Completion re-enters the loop as an event.
    pub async fn run_offer(
        pc: Arc<RTCPeerConnection>,
        peer: ParticipantId,
        signals: SignalSender,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) {
        let result = async {
            let offer = pc.create_offer(None).await?;
            let sdp = offer.sdp.clone();
            pc.set_local_description(offer).await?;
            signals
                .send(ClientMessage::Signal {
                    to: peer.clone(),
                    payload: NegotiationPayload::Offer { sdp },
                })
                .await
        }
        .await;

        let event = match result {
            Ok(()) => LinkEvent::OfferSent { peer },
            Err(e) => LinkEvent::NegotiationFailed {
                peer,
                reason: e.to_string(),
            },
        };
        let _ = events.send(event);
    }

    /// Responder counterpart of [`run_offer`]: applies the remote offer,
    /// produces the answer, and sends it back to the offerer.
    pub async fn run_answer(
        pc: Arc<RTCPeerConnection>,
        peer: ParticipantId,
        offer_sdp: String,
        signals: SignalSender,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) {
        let result = async {
            let offer = RTCSessionDescription::offer(offer_sdp)?;
            pc.set_remote_description(offer).await?;
            let answer = pc.create_answer(None).await?;
            let sdp = answer.sdp.clone();
            pc.set_local_description(answer).await?;
            signals
                .send(ClientMessage::Signal {
                    to: peer.clone(),
                    payload: NegotiationPayload::Answer { sdp },
                })
                .await
        }
        .await;

        let event = match result {
            Ok(()) => LinkEvent::AnswerSent { peer },
            Err(e) => LinkEvent::NegotiationFailed {
                peer,
                reason: e.to_string(),
            },
        };
        let _ = events.send(event);
    }

    /// Applies the remote answer on an initiator link.
    pub async fn run_apply_answer(
        pc: Arc<RTCPeerConnection>,
        peer: ParticipantId,
        answer_sdp: String,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) {
        let result = async {
            let answer = RTCSessionDescription::answer(answer_sdp)?;
            pc.set_remote_description(answer).await?;
            Ok::<(), webrtc::Error>(())
        }
        .await;

        let event = match result {
            Ok(()) => LinkEvent::AnswerApplied { peer },
            Err(e) => LinkEvent::NegotiationFailed {
                peer,
                reason: e.to_string(),
            },
        };
        let _ = events.send(event);
    }

    /// Queues `candidate` until the remote description exists, then applies
    /// it directly. Candidates must never touch the connection object
    /// before the description exchange has given it a remote session.
    pub async fn add_remote_candidate(&mut self, candidate: RTCIceCandidateInit) -> Result<()> {
        if !self.has_remote_description {
            debug!(peer = %self.remote, "queueing candidate until remote description");
            self.pending_candidates.push(candidate);
            return Ok(());
        }
        self.pc
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| Error::Negotiation {
                peer: self.remote.clone(),
                reason: e.to_string(),
            })
    }

    /// Marks the remote description applied and flushes queued candidates.
    pub async fn remote_description_applied(&mut self) -> Result<()> {
        self.has_remote_description = true;
        for candidate in std::mem::take(&mut self.pending_candidates) {
            self.pc
                .add_ice_candidate(candidate)
                .await
                .map_err(|e| Error::Negotiation {
                    peer: self.remote.clone(),
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }

    pub fn start_quality_monitor(&mut self, board: &QualityBoard) {
        if self.quality.is_none() {
            self.quality = Some(LinkQualityMonitor::start(
                self.pc(),
                self.remote.clone(),
                board.clone(),
            ));
        }
    }

    /// Releases the connection object. Terminal; the session drops the link
    /// right after.
    pub async fn close(&mut self) {
        self.quality = None;
        self.state = LinkState::Closed;
        if let Err(e) = self.pc.close().await {
            debug!(peer = %self.remote, error = %e, "error closing connection");
        }
    }
}
