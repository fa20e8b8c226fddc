//! Room session: the peer-connection orchestrator.
//!
//! One session per joined room. The session owns one [`PeerLink`] per
//! remote participant and runs a single event loop over server messages,
//! link events, and user commands, so events for any one link are applied
//! strictly one at a time while separate links progress independently.
//! Anything slow (description creation, answer production) runs in spawned
//! tasks and re-enters the loop as a [`LinkEvent`].

mod link;

pub use link::{LinkEvent, PeerLink, Role};

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use crate::error::{Error, Result};
use crate::media::{CaptureSource, LocalMediaSession};
use crate::metrics::{QualityBoard, QualityReports};
use crate::protocol::{ClientMessage, NegotiationPayload, ParticipantId, RoomId, ServerMessage};
use crate::signaling::{SignalChannel, SignalSender};
use crate::status::{LinkState, StatusBoard};
use crate::view::{Slots, ViewBinder};

enum SessionCommand {
    Leave,
}

/// Handle to a running room session. The operational surface the
/// surrounding UI calls: join, leave, and the media toggles.
pub struct RoomClient {
    media: Arc<LocalMediaSession>,
    status: StatusBoard,
    quality: QualityBoard,
    view_rx: watch::Receiver<Slots>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    task: JoinHandle<Result<()>>,
}

impl RoomClient {
    /// Connects to the signaling server, acquires local media, and joins
    /// `room_id`. Capture denial fails the join before any signaling
    /// happens.
    pub async fn join(url: &str, room_id: &RoomId, capture: &dyn CaptureSource) -> Result<Self> {
        let media = LocalMediaSession::acquire(capture).await?;
        let channel = SignalChannel::connect(url).await?;
        channel
            .send(ClientMessage::Join {
                room_id: room_id.clone(),
            })
            .await?;
        let (signals, messages) = channel.split();
        Ok(Self::start(signals, messages, media))
    }

    /// Starts a session over an already-established message channel. The
    /// join request must have been sent by the caller.
    pub fn start(
        signals: SignalSender,
        messages: mpsc::Receiver<ServerMessage>,
        media: LocalMediaSession,
    ) -> Self {
        let media = Arc::new(media);
        let status = StatusBoard::new();
        let quality = QualityBoard::new();
        let view = ViewBinder::new();
        let view_rx = view.subscribe();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();

        let session = RoomSession {
            media: Arc::clone(&media),
            signals,
            links: HashMap::new(),
            view,
            status: status.clone(),
            quality: quality.clone(),
            link_tx,
            admitted: false,
        };
        let task = tokio::spawn(session.run(messages, link_rx, command_rx));

        Self {
            media,
            status,
            quality,
            view_rx,
            commands: command_tx,
            task,
        }
    }

    /// Flips the outbound video track on or off. Takes effect on every
    /// link at once, with no renegotiation.
    pub fn toggle_video(&self) {
        self.media.set_video_enabled(!self.media.video_enabled());
    }

    pub fn toggle_audio(&self) {
        self.media.set_audio_enabled(!self.media.audio_enabled());
    }

    /// Leaves the room: cancels all pending negotiation, closes every
    /// link, and releases local media.
    pub fn leave(&self) {
        let _ = self.commands.send(SessionCommand::Leave);
    }

    /// Per-peer link states, for connection indicators.
    pub fn link_states(&self) -> watch::Receiver<HashMap<ParticipantId, LinkState>> {
        self.status.subscribe()
    }

    /// Latest sampled stats per connected link. Entries appear once a link
    /// reaches `Connected` and disappear when it is torn down.
    pub fn link_quality(&self) -> watch::Receiver<QualityReports> {
        self.quality.subscribe()
    }

    /// Display slot assignments for the rendering surface.
    pub fn view_slots(&self) -> watch::Receiver<Slots> {
        self.view_rx.clone()
    }

    pub fn media(&self) -> &LocalMediaSession {
        &self.media
    }

    /// Waits for the session to end. `Err(RoomFull)` means the join was
    /// rejected.
    pub async fn wait(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| Error::Signaling(format!("session task failed: {}", e)))?
    }
}

struct RoomSession {
    media: Arc<LocalMediaSession>,
    signals: SignalSender,
    links: HashMap<ParticipantId, PeerLink>,
    view: ViewBinder,
    status: StatusBoard,
    quality: QualityBoard,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    /// Set once the roster arrives; distinguishes a room-full rejection
    /// from the informational capacity broadcast.
    admitted: bool,
}

impl RoomSession {
    async fn run(
        mut self,
        mut messages: mpsc::Receiver<ServerMessage>,
        mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    ) -> Result<()> {
        let result = loop {
            tokio::select! {
                msg = messages.recv() => match msg {
                    Some(msg) => {
                        if let Err(e) = self.handle_server_message(msg).await {
                            break Err(e);
                        }
                    }
                    // Server closed the channel; the session is over.
                    None => break Ok(()),
                },
                Some(event) = link_events.recv() => {
                    self.handle_link_event(event).await;
                }
                cmd = commands.recv() => match cmd {
                    Some(SessionCommand::Leave) | None => break Ok(()),
                },
            }
        };
        self.shutdown().await;
        result
    }

    async fn handle_server_message(&mut self, msg: ServerMessage) -> Result<()> {
        match msg {
            ServerMessage::Roster { participants } => {
                self.admitted = true;
                info!(peers = participants.len(), "admitted to room");
                // We initiate toward everyone who was already there.
                for peer in participants {
                    self.open_link(peer.clone(), Role::Initiator).await;
                    if let Some(link) = self.links.get(&peer) {
                        tokio::spawn(PeerLink::run_offer(
                            link.pc(),
                            peer,
                            self.signals.clone(),
                            self.link_tx.clone(),
                        ));
                    }
                }
            }
            ServerMessage::Joined { participant } => {
                info!(peer = %participant, "participant joined; awaiting their offer");
                // The newcomer initiates toward us.
                self.open_link(participant, Role::Responder).await;
            }
            ServerMessage::Left { participant } => {
                info!(peer = %participant, "participant left");
                self.teardown_link(&participant).await;
            }
            ServerMessage::RoomFull => {
                if !self.admitted {
                    return Err(Error::RoomFull);
                }
                debug!("room reached capacity");
            }
            ServerMessage::Signal { from, payload } => {
                self.handle_signal(from, payload).await;
            }
        }
        Ok(())
    }

    async fn handle_signal(&mut self, from: ParticipantId, payload: NegotiationPayload) {
        match payload {
            NegotiationPayload::Offer { sdp } => {
                // An offer can arrive before the joined notification; the
                // link is created on first knowledge either way.
                if self.links.get(&from).is_none() {
                    self.open_link(from.clone(), Role::Responder).await;
                }
                let Some(link) = self.links.get_mut(&from) else {
                    return;
                };
                if link.role() == Role::Initiator {
                    warn!(peer = %from, "ignoring offer from a peer we initiate toward");
                    return;
                }
                // One remote description per link; the relay will happily
                // forward a duplicated offer.
                if !link.begin_remote_description() {
                    warn!(peer = %from, "duplicate offer dropped");
                    return;
                }
                link.set_state(LinkState::NegotiatingRemote);
                self.status.set(&from, LinkState::NegotiatingRemote);
                tokio::spawn(PeerLink::run_answer(
                    link.pc(),
                    from,
                    sdp,
                    self.signals.clone(),
                    self.link_tx.clone(),
                ));
            }
            NegotiationPayload::Answer { sdp } => {
                let Some(link) = self.links.get_mut(&from) else {
                    debug!(peer = %from, "answer for unknown link dropped");
                    return;
                };
                if link.role() != Role::Initiator {
                    warn!(peer = %from, "ignoring answer on a responder link");
                    return;
                }
                if link.state() != LinkState::NegotiatingLocal {
                    warn!(peer = %from, state = %link.state(), "answer out of order; dropped");
                    return;
                }
                if !link.begin_remote_description() {
                    warn!(peer = %from, "duplicate answer dropped");
                    return;
                }
                tokio::spawn(PeerLink::run_apply_answer(
                    link.pc(),
                    from,
                    sdp,
                    self.link_tx.clone(),
                ));
            }
            NegotiationPayload::IceCandidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                // A candidate may beat the offer here; the link is created
                // in responder-pending mode and the candidate queued.
                if self.links.get(&from).is_none() {
                    debug!(peer = %from, "candidate ahead of offer; creating pending link");
                    self.open_link(from.clone(), Role::Responder).await;
                }
                let Some(link) = self.links.get_mut(&from) else {
                    return;
                };
                let init = RTCIceCandidateInit {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                    ..Default::default()
                };
                if let Err(e) = link.add_remote_candidate(init).await {
                    warn!(peer = %from, error = %e, "candidate rejected; tearing link down");
                    self.teardown_link(&from).await;
                }
            }
        }
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::CandidateDiscovered { peer, candidate } => {
                // Sent immediately, never batched. A candidate for a peer
                // that already left is simply dropped.
                if self.links.contains_key(&peer) {
                    let msg = ClientMessage::Signal {
                        to: peer,
                        payload: NegotiationPayload::IceCandidate {
                            candidate: candidate.candidate,
                            sdp_mid: candidate.sdp_mid,
                            sdp_mline_index: candidate.sdp_mline_index,
                        },
                    };
                    if let Err(e) = self.signals.send(msg).await {
                        debug!(error = %e, "failed to send candidate");
                    }
                }
            }
            LinkEvent::OfferSent { peer } => {
                self.set_link_state(&peer, LinkState::NegotiatingLocal);
            }
            LinkEvent::AnswerSent { peer } => {
                if let Some(link) = self.links.get_mut(&peer) {
                    if let Err(e) = link.remote_description_applied().await {
                        warn!(peer = %peer, error = %e, "queued candidates failed");
                        self.teardown_link(&peer).await;
                        return;
                    }
                }
                self.set_link_state(&peer, LinkState::Stable);
            }
            LinkEvent::AnswerApplied { peer } => {
                if let Some(link) = self.links.get_mut(&peer) {
                    if let Err(e) = link.remote_description_applied().await {
                        warn!(peer = %peer, error = %e, "queued candidates failed");
                        self.teardown_link(&peer).await;
                        return;
                    }
                }
                self.set_link_state(&peer, LinkState::Stable);
            }
            LinkEvent::TrackReceived { peer, track } => {
                if self.links.contains_key(&peer) {
                    self.view.bind(&peer, track);
                }
            }
            LinkEvent::ConnectionChanged { peer, state } => {
                self.handle_connection_change(peer, state).await;
            }
            LinkEvent::NegotiationFailed { peer, reason } => {
                // One bad link never touches the rest of the room.
                warn!(peer = %peer, %reason, "negotiation failed");
                self.teardown_link(&peer).await;
            }
        }
    }

    async fn handle_connection_change(&mut self, peer: ParticipantId, state: RTCPeerConnectionState) {
        match state {
            RTCPeerConnectionState::Connected => {
                if let Some(link) = self.links.get_mut(&peer) {
                    link.start_quality_monitor(&self.quality);
                }
                self.set_link_state(&peer, LinkState::Connected);
            }
            // Transient; the connection object keeps retrying on its own.
            RTCPeerConnectionState::Disconnected => {
                self.set_link_state(&peer, LinkState::Disconnected);
            }
            RTCPeerConnectionState::Failed => {
                warn!(peer = %peer, "connection failed");
                self.teardown_link(&peer).await;
            }
            RTCPeerConnectionState::Closed => {
                // Close events for links we tore down ourselves arrive
                // after removal and fall through harmlessly.
                self.teardown_link(&peer).await;
            }
            _ => {}
        }
    }

    async fn open_link(&mut self, peer: ParticipantId, role: Role) {
        if self.links.contains_key(&peer) {
            return;
        }
        match PeerLink::connect(peer.clone(), role, &self.media, self.link_tx.clone()).await {
            Ok(link) => {
                self.status.set(&peer, link.state());
                self.links.insert(peer, link);
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "failed to create peer link");
            }
        }
    }

    fn set_link_state(&mut self, peer: &ParticipantId, state: LinkState) {
        if let Some(link) = self.links.get_mut(peer) {
            link.set_state(state);
            self.status.set(peer, state);
        }
    }

    async fn teardown_link(&mut self, peer: &ParticipantId) {
        if let Some(mut link) = self.links.remove(peer) {
            link.close().await;
            self.view.unbind(peer);
            self.status.remove(peer);
            self.quality.remove(peer);
            debug!(peer = %peer, "link torn down");
        }
    }

    async fn shutdown(&mut self) {
        let peers: Vec<ParticipantId> = self.links.keys().cloned().collect();
        for peer in peers {
            self.teardown_link(&peer).await;
        }
        self.media.release();
        debug!("room session shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SilentCapture;
    use std::time::Duration;
    use tokio::time::timeout;
    use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

    async fn harness() -> (
        RoomClient,
        mpsc::Sender<ServerMessage>,
        mpsc::Receiver<ClientMessage>,
    ) {
        let media = LocalMediaSession::acquire(&SilentCapture).await.unwrap();
        let (server_tx, server_rx) = mpsc::channel(32);
        let (client_tx, client_rx) = mpsc::channel(32);
        let client = RoomClient::start(SignalSender::new(client_tx), server_rx, media);
        (client, server_tx, client_rx)
    }

    async fn wait_for_state(
        client: &RoomClient,
        peer: &str,
        want: LinkState,
    ) {
        let mut rx = client.link_states();
        timeout(Duration::from_secs(5), async {
            loop {
                if rx.borrow().get(peer) == Some(&want) {
                    return;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap_or_else(|_| panic!("peer {} never reached {}", peer, want));
    }

    #[tokio::test]
    async fn roster_members_get_offers_and_joiners_do_not() {
        let (client, server_tx, mut client_rx) = harness().await;

        server_tx
            .send(ServerMessage::Roster {
                participants: vec!["b".to_string()],
            })
            .await
            .unwrap();
        server_tx
            .send(ServerMessage::Joined {
                participant: "c".to_string(),
            })
            .await
            .unwrap();

        // The initiator link toward b produces exactly one offer; the
        // responder link toward c produces none.
        let msg = timeout(Duration::from_secs(5), client_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match msg {
            ClientMessage::Signal { to, payload } => {
                assert_eq!(to, "b");
                assert_eq!(payload.kind(), "offer");
            }
            other => panic!("unexpected message: {:?}", other),
        }
        wait_for_state(&client, "b", LinkState::NegotiatingLocal).await;

        // c's link exists and stays idle until c offers.
        wait_for_state(&client, "c", LinkState::New).await;

        // Nothing is connected, so no quality reports exist yet.
        assert!(client.link_quality().borrow().is_empty());

        client.leave();
        client.wait().await.unwrap();
    }

    #[tokio::test]
    async fn incoming_offer_is_answered() {
        let (client, server_tx, mut client_rx) = harness().await;

        // Build a real offer from a second endpoint.
        let media = LocalMediaSession::acquire(&SilentCapture).await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let remote = PeerLink::connect("x".to_string(), Role::Initiator, &media, tx)
            .await
            .unwrap();
        let offer = remote.pc().create_offer(None).await.unwrap();
        let offer_sdp = offer.sdp.clone();
        remote.pc().set_local_description(offer).await.unwrap();

        server_tx
            .send(ServerMessage::Signal {
                from: "x".to_string(),
                payload: NegotiationPayload::Offer { sdp: offer_sdp },
            })
            .await
            .unwrap();

        // The session answers the offerer and the link settles.
        let answer = timeout(Duration::from_secs(5), async {
            loop {
                match client_rx.recv().await.unwrap() {
                    ClientMessage::Signal { to, payload } => {
                        if payload.kind() == "answer" {
                            return (to, payload);
                        }
                    }
                    other => panic!("unexpected message: {:?}", other),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(answer.0, "x");
        wait_for_state(&client, "x", LinkState::Stable).await;

        client.leave();
        client.wait().await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_offer_produces_a_single_answer() {
        let (client, server_tx, mut client_rx) = harness().await;

        let media = LocalMediaSession::acquire(&SilentCapture).await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let remote = PeerLink::connect("x".to_string(), Role::Initiator, &media, tx)
            .await
            .unwrap();
        let offer = remote.pc().create_offer(None).await.unwrap();
        let offer_sdp = offer.sdp.clone();
        remote.pc().set_local_description(offer).await.unwrap();

        // The relay forwards anything, so the same offer can show up twice.
        for _ in 0..2 {
            server_tx
                .send(ServerMessage::Signal {
                    from: "x".to_string(),
                    payload: NegotiationPayload::Offer {
                        sdp: offer_sdp.clone(),
                    },
                })
                .await
                .unwrap();
        }

        timeout(Duration::from_secs(5), async {
            loop {
                if let ClientMessage::Signal { payload, .. } = client_rx.recv().await.unwrap() {
                    if payload.kind() == "answer" {
                        return;
                    }
                }
            }
        })
        .await
        .unwrap();
        wait_for_state(&client, "x", LinkState::Stable).await;

        // The duplicate is dropped: no second answer shows up.
        let extra = timeout(Duration::from_millis(500), async {
            loop {
                if let ClientMessage::Signal { payload, .. } = client_rx.recv().await.unwrap() {
                    if payload.kind() == "answer" {
                        return;
                    }
                }
            }
        })
        .await;
        assert!(extra.is_err(), "duplicate offer must not be answered twice");

        client.leave();
        client.wait().await.unwrap();
    }

    #[tokio::test]
    async fn answer_settles_an_initiator_link() {
        let (client, server_tx, mut client_rx) = harness().await;

        server_tx
            .send(ServerMessage::Roster {
                participants: vec!["b".to_string()],
            })
            .await
            .unwrap();

        // Capture the offer our initiator link sends toward b.
        let offer_sdp = timeout(Duration::from_secs(5), async {
            loop {
                if let ClientMessage::Signal { to, payload } = client_rx.recv().await.unwrap() {
                    if let NegotiationPayload::Offer { sdp } = payload {
                        assert_eq!(to, "b");
                        return sdp;
                    }
                }
            }
        })
        .await
        .unwrap();
        wait_for_state(&client, "b", LinkState::NegotiatingLocal).await;

        // A second endpoint produces a real answer to that offer.
        let media = LocalMediaSession::acquire(&SilentCapture).await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let remote = PeerLink::connect("a".to_string(), Role::Responder, &media, tx)
            .await
            .unwrap();
        remote
            .pc()
            .set_remote_description(RTCSessionDescription::offer(offer_sdp).unwrap())
            .await
            .unwrap();
        let answer = remote.pc().create_answer(None).await.unwrap();
        let answer_sdp = answer.sdp.clone();
        remote.pc().set_local_description(answer).await.unwrap();

        server_tx
            .send(ServerMessage::Signal {
                from: "b".to_string(),
                payload: NegotiationPayload::Answer { sdp: answer_sdp },
            })
            .await
            .unwrap();

        // Applying the answer completes the exchange.
        wait_for_state(&client, "b", LinkState::Stable).await;

        client.leave();
        client.wait().await.unwrap();
    }

    #[tokio::test]
    async fn early_candidate_creates_pending_link_without_corrupting_others() {
        let (client, server_tx, mut client_rx) = harness().await;

        server_tx
            .send(ServerMessage::Roster {
                participants: vec!["b".to_string()],
            })
            .await
            .unwrap();
        // Drain b's offer so it does not interfere with assertions below.
        let _ = timeout(Duration::from_secs(5), client_rx.recv()).await.unwrap();

        // Candidate from a peer we have never heard of.
        server_tx
            .send(ServerMessage::Signal {
                from: "mystery".to_string(),
                payload: NegotiationPayload::IceCandidate {
                    candidate: "candidate:1 1 udp 2130706431 192.0.2.7 4444 typ host".to_string(),
                    sdp_mid: Some("0".to_string()),
                    sdp_mline_index: Some(0),
                },
            })
            .await
            .unwrap();

        wait_for_state(&client, "mystery", LinkState::New).await;
        let states = client.link_states().borrow().clone();
        assert!(states.contains_key("b"), "existing link must be untouched");

        client.leave();
        client.wait().await.unwrap();
    }

    #[tokio::test]
    async fn departure_tears_down_only_that_link() {
        let (client, server_tx, mut client_rx) = harness().await;

        server_tx
            .send(ServerMessage::Roster {
                participants: vec!["b".to_string(), "c".to_string()],
            })
            .await
            .unwrap();
        // Two initiator links, two offers.
        for _ in 0..2 {
            let _ = timeout(Duration::from_secs(5), client_rx.recv()).await.unwrap();
        }

        server_tx
            .send(ServerMessage::Left {
                participant: "b".to_string(),
            })
            .await
            .unwrap();

        timeout(Duration::from_secs(5), async {
            let mut rx = client.link_states();
            loop {
                {
                    let states = rx.borrow();
                    if !states.contains_key("b") && states.contains_key("c") {
                        return;
                    }
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        client.leave();
        client.wait().await.unwrap();
    }

    #[tokio::test]
    async fn room_full_before_admission_rejects_the_join() {
        let (client, server_tx, _client_rx) = harness().await;
        server_tx.send(ServerMessage::RoomFull).await.unwrap();
        let err = client.wait().await.unwrap_err();
        assert!(matches!(err, Error::RoomFull));
    }

    #[tokio::test]
    async fn toggles_flip_media_flags() {
        let (client, _server_tx, _client_rx) = harness().await;
        assert!(client.media().audio_enabled());
        client.toggle_audio();
        assert!(!client.media().audio_enabled());
        client.toggle_video();
        assert!(!client.media().video_enabled());
        client.leave();
        client.wait().await.unwrap();
    }
}
