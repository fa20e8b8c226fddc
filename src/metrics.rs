//! Link quality sampling.
//!
//! Each connected link gets a sampler that polls
//! `RTCPeerConnection::get_stats` on a fixed interval and publishes the
//! report on the room's [`QualityBoard`]. Purely observational; nothing
//! here feeds back into negotiation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReport;

use crate::protocol::ParticipantId;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

pub type QualityReports = HashMap<ParticipantId, Arc<StatsReport>>;

/// Latest stats report per connected link, behind a watch channel.
#[derive(Clone)]
pub struct QualityBoard {
    tx: Arc<watch::Sender<QualityReports>>,
    rx: watch::Receiver<QualityReports>,
}

impl QualityBoard {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(QualityReports::new());
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub(crate) fn set(&self, participant: &ParticipantId, report: Arc<StatsReport>) {
        self.tx.send_modify(|reports| {
            reports.insert(participant.clone(), report);
        });
    }

    pub(crate) fn remove(&self, participant: &ParticipantId) {
        self.tx.send_modify(|reports| {
            reports.remove(participant);
        });
    }

    pub fn latest(&self, participant: &ParticipantId) -> Option<Arc<StatsReport>> {
        self.rx.borrow().get(participant).cloned()
    }

    pub fn subscribe(&self) -> watch::Receiver<QualityReports> {
        self.rx.clone()
    }
}

impl Default for QualityBoard {
    fn default() -> Self {
        Self::new()
    }
}

/// Samples one link until dropped.
pub struct LinkQualityMonitor {
    sampler: JoinHandle<()>,
}

impl LinkQualityMonitor {
    pub fn start(
        pc: Arc<RTCPeerConnection>,
        participant: ParticipantId,
        board: QualityBoard,
    ) -> Self {
        let sampler = tokio::spawn(async move {
            let mut ticker = interval(SAMPLE_INTERVAL);
            loop {
                ticker.tick().await;
                let report = pc.get_stats().await;
                board.set(&participant, Arc::new(report));
            }
        });
        Self { sampler }
    }
}

impl Drop for LinkQualityMonitor {
    fn drop(&mut self) {
        self.sampler.abort();
    }
}
