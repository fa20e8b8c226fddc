//! Wire types shared by the signaling server and client.
//!
//! The server routes [`SignalEnvelope`]s by address only; negotiation
//! payloads are opaque to it.

use serde::{Deserialize, Serialize};

pub type ParticipantId = String;
pub type RoomId = String;

/// Maximum participants per room.
pub const ROOM_CAPACITY: usize = 3;

/// Display slots available to the view binder (everyone but ourselves).
pub const DISPLAY_SLOTS: usize = ROOM_CAPACITY - 1;

/// One step of a peer-to-peer negotiation. The relay never inspects this.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NegotiationPayload {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    IceCandidate {
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    },
}

impl NegotiationPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            NegotiationPayload::Offer { .. } => "offer",
            NegotiationPayload::Answer { .. } => "answer",
            NegotiationPayload::IceCandidate { .. } => "ice_candidate",
        }
    }
}

/// Addressed negotiation message as the relay sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub to: ParticipantId,
    pub from: ParticipantId,
    pub payload: NegotiationPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Join {
        room_id: RoomId,
    },
    /// `from` is stamped server-side; clients only address the target.
    Signal {
        to: ParticipantId,
        payload: NegotiationPayload,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Existing members in join order, sent to a newly admitted participant.
    Roster {
        participants: Vec<ParticipantId>,
    },
    Joined {
        participant: ParticipantId,
    },
    Left {
        participant: ParticipantId,
    },
    RoomFull,
    Signal {
        from: ParticipantId,
        payload: NegotiationPayload,
    },
}
