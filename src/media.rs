//! Local media session.
//!
//! Capture itself (camera/microphone) is an external capability behind
//! [`CaptureSource`]; this module owns the local tracks it produces and the
//! mute toggles. The same two tracks are attached to every peer connection,
//! so a toggle takes effect for every remote participant at once, and a
//! toggle never triggers renegotiation: disabled tracks simply stop
//! accepting samples.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::{Error, Result};

/// The pair of local tracks a capture source feeds.
pub struct LocalTracks {
    pub audio: Arc<TrackLocalStaticSample>,
    pub video: Arc<TrackLocalStaticSample>,
}

impl LocalTracks {
    /// Standard opus + VP8 track pair. Sources that capture real devices
    /// still produce this shape and then pump samples into it.
    pub fn standard(stream_id: &str) -> Self {
        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            stream_id.to_owned(),
        ));
        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            stream_id.to_owned(),
        ));
        Self { audio, video }
    }
}

/// External media-capture capability. Implementations that talk to real
/// devices live outside this crate.
#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// Produces the local track pair, or [`Error::CaptureDenied`] when the
    /// user or platform refuses access.
    async fn acquire(&self) -> Result<LocalTracks>;
}

/// Capture source that produces tracks nobody writes to. Used by the demo
/// binary and tests; negotiation works the same with silent tracks.
pub struct SilentCapture;

#[async_trait]
impl CaptureSource for SilentCapture {
    async fn acquire(&self) -> Result<LocalTracks> {
        Ok(LocalTracks::standard("meshcall"))
    }
}

pub struct LocalMediaSession {
    tracks: LocalTracks,
    audio_enabled: AtomicBool,
    video_enabled: AtomicBool,
}

impl LocalMediaSession {
    pub async fn acquire(source: &dyn CaptureSource) -> Result<Self> {
        let tracks = source.acquire().await?;
        Ok(Self {
            tracks,
            audio_enabled: AtomicBool::new(true),
            video_enabled: AtomicBool::new(true),
        })
    }

    /// Track handles in the form `RTCPeerConnection::add_track` wants.
    pub fn outbound_tracks(&self) -> Vec<Arc<dyn TrackLocal + Send + Sync>> {
        vec![
            Arc::clone(&self.tracks.audio) as Arc<dyn TrackLocal + Send + Sync>,
            Arc::clone(&self.tracks.video) as Arc<dyn TrackLocal + Send + Sync>,
        ]
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        self.audio_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.video_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::Relaxed)
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled.load(Ordering::Relaxed)
    }

    /// Entry point for the external capture pump. Samples written while
    /// audio is disabled are discarded, which is how mute works.
    pub async fn write_audio(&self, sample: &Sample) -> Result<()> {
        if !self.audio_enabled() {
            return Ok(());
        }
        self.tracks
            .audio
            .write_sample(sample)
            .await
            .map_err(Error::WebRtc)
    }

    pub async fn write_video(&self, sample: &Sample) -> Result<()> {
        if !self.video_enabled() {
            return Ok(());
        }
        self.tracks
            .video
            .write_sample(sample)
            .await
            .map_err(Error::WebRtc)
    }

    /// Stops accepting samples. The tracks themselves are released when the
    /// last peer connection holding them closes.
    pub fn release(&self) {
        self.set_audio_enabled(false);
        self.set_video_enabled(false);
    }
}
