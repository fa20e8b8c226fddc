//! Per-link negotiation/connection state, published for UI observation.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::protocol::ParticipantId;

/// Lifecycle of one peer link.
///
/// `Connected` and `Disconnected` may oscillate while the underlying
/// connection retries; `Failed` and `Closed` are terminal and tear the link
/// down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    New,
    /// Offer created and sent; waiting for the answer.
    NegotiatingLocal,
    /// Offer received; producing the answer.
    NegotiatingRemote,
    /// Description exchange complete.
    Stable,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LinkState::Failed | LinkState::Closed)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::New => "new",
            LinkState::NegotiatingLocal => "negotiating-local",
            LinkState::NegotiatingRemote => "negotiating-remote",
            LinkState::Stable => "stable",
            LinkState::Connected => "connected",
            LinkState::Disconnected => "disconnected",
            LinkState::Failed => "failed",
            LinkState::Closed => "closed",
        };
        write!(f, "{}", name)
    }
}

/// Room-wide map of link states behind a watch channel.
#[derive(Clone)]
pub struct StatusBoard {
    tx: Arc<watch::Sender<HashMap<ParticipantId, LinkState>>>,
    rx: watch::Receiver<HashMap<ParticipantId, LinkState>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(HashMap::new());
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn set(&self, participant: &ParticipantId, state: LinkState) {
        self.tx.send_modify(|links| {
            links.insert(participant.clone(), state);
        });
    }

    pub fn remove(&self, participant: &ParticipantId) {
        self.tx.send_modify(|links| {
            links.remove(participant);
        });
    }

    pub fn get(&self, participant: &ParticipantId) -> Option<LinkState> {
        self.rx.borrow().get(participant).copied()
    }

    pub fn subscribe(&self) -> watch::Receiver<HashMap<ParticipantId, LinkState>> {
        self.rx.clone()
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}
