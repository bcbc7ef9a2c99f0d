use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::MediaError;

/// Capture settings, the same for every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub frame_rate: u32,
    pub width: u32,
    pub height: u32,
    pub facing_mode: String,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        MediaConstraints {
            echo_cancellation: true,
            noise_suppression: true,
            frame_rate: 30,
            width: 640,
            height: 480,
            facing_mode: "user".into(),
        }
    }
}

impl MediaConstraints {
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs(1) / self.frame_rate.max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A capture track that can be muted without renegotiating.
pub struct LocalTrack {
    track: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
}

impl LocalTrack {
    fn new(track: TrackLocalStaticSample) -> Self {
        LocalTrack {
            track: Arc::new(track),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }
}

/// Local audio and video tracks.
pub struct LocalMedia {
    audio: LocalTrack,
    video: LocalTrack,
    constraints: MediaConstraints,
    released: AtomicBool,
}

impl LocalMedia {
    pub fn audio(&self) -> &LocalTrack {
        &self.audio
    }

    pub fn video(&self) -> &LocalTrack {
        &self.video
    }

    pub fn constraints(&self) -> &MediaConstraints {
        &self.constraints
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        debug!("local audio enabled={enabled}");
        self.audio.set_enabled(enabled);
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        debug!("local video enabled={enabled}");
        self.video.set_enabled(enabled);
    }

    pub fn tracks(&self) -> [Arc<dyn TrackLocal + Send + Sync>; 2] {
        [self.audio.rtc_track(), self.video.rtc_track()]
    }

    /// Feeds one encoded frame from the capture layer.
    ///
    /// Returns `false` when the frame was dropped because the track is muted
    /// or the media has been released.
    pub async fn write_sample(
        &self,
        kind: TrackKind,
        data: Bytes,
        duration: Duration,
    ) -> Result<bool, webrtc::Error> {
        let track = match kind {
            TrackKind::Audio => &self.audio,
            TrackKind::Video => &self.video,
        };
        if self.is_released() || !track.is_enabled() {
            return Ok(false);
        }
        track
            .track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(true)
    }

    /// Stops both tracks; later samples are dropped.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::Relaxed) {
            info!("local media released");
            self.audio.set_enabled(false);
            self.video.set_enabled(false);
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Relaxed)
    }
}

/// Where local audio and video come from.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia, MediaError>;
}

/// Sample-fed Opus/VP8 tracks a capture pipeline writes encoded frames into.
#[derive(Debug, Clone)]
pub struct SampleSource {
    stream_id: String,
}

impl SampleSource {
    pub fn new(stream_id: impl Into<String>) -> Self {
        SampleSource {
            stream_id: stream_id.into(),
        }
    }
}

impl Default for SampleSource {
    fn default() -> Self {
        SampleSource::new("duocall")
    }
}

#[async_trait]
impl MediaSource for SampleSource {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia, MediaError> {
        if constraints.width == 0 || constraints.height == 0 {
            return Err(MediaError::Unsatisfiable(format!(
                "resolution {}x{}",
                constraints.width, constraints.height
            )));
        }
        if constraints.frame_rate == 0 {
            return Err(MediaError::Unsatisfiable("frame rate 0".into()));
        }

        let audio = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_owned(),
            self.stream_id.clone(),
        );
        let video = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            "video".to_owned(),
            self.stream_id.clone(),
        );

        info!(
            "local media ready: {}x{}@{} echo_cancellation={} noise_suppression={}",
            constraints.width,
            constraints.height,
            constraints.frame_rate,
            constraints.echo_cancellation,
            constraints.noise_suppression
        );

        Ok(LocalMedia {
            audio: LocalTrack::new(audio),
            video: LocalTrack::new(video),
            constraints: constraints.clone(),
            released: AtomicBool::new(false),
        })
    }
}
