//! Full-mesh video call signaling and peer orchestration.
//!
//! The server half ([`server::SignalServer`]) brokers room membership for
//! capacity-bounded rooms and relays opaque negotiation envelopes between
//! participants. The client half ([`room::RoomClient`]) drives one
//! negotiation state machine per remote participant until every pair in
//! the room holds a direct media connection.

pub mod error;
pub mod media;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod server;
pub mod signaling;
pub mod status;
pub mod view;

pub use error::{Error, Result};
pub use media::{CaptureSource, LocalMediaSession, SilentCapture};
pub use protocol::{
    ClientMessage, NegotiationPayload, ParticipantId, RoomId, ServerMessage, SignalEnvelope,
    DISPLAY_SLOTS, ROOM_CAPACITY,
};
pub use room::RoomClient;
pub use server::SignalServer;
pub use status::LinkState;
