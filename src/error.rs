use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Join was rejected because the room is at capacity.
    #[error("room is full")]
    RoomFull,

    /// The capture source could not provide local media.
    #[error("capture denied: {0}")]
    CaptureDenied(String),

    /// Description or candidate application failed for one peer link.
    #[error("negotiation failed with {peer}: {reason}")]
    Negotiation { peer: String, reason: String },

    /// The signal channel rejected or lost a message.
    #[error("signaling error: {0}")]
    Signaling(String),

    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
