//! Local media capture.
//!
//! A [`MediaSource`] hands out a [`MediaStream`] of [`LocalTrack`]s. Each track
//! wraps a webrtc sample track so it can be attached to a peer connection as is.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::MediaError;
use crate::utils::random_id;

// Opus TOC byte for a 20 ms silent frame, and a 16x16 VP8 key frame header.
const OPUS_SILENCE: &[u8] = &[0xf8, 0xff, 0xfe];
const VP8_BLANK: &[u8] = &[0x10, 0x02, 0x00, 0x9d, 0x01, 0x2a, 0x10, 0x00, 0x10, 0x00];

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn from_codec_type(kind: RTPCodecType) -> Option<Self> {
        match kind {
            RTPCodecType::Audio => Some(MediaKind::Audio),
            RTPCodecType::Video => Some(MediaKind::Video),
            _ => None,
        }
    }

    fn codec(self) -> RTCRtpCodecCapability {
        match self {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        }
    }

    fn frame(self) -> (Bytes, Duration) {
        match self {
            MediaKind::Audio => (Bytes::from_static(OPUS_SILENCE), Duration::from_millis(20)),
            MediaKind::Video => (Bytes::from_static(VP8_BLANK), Duration::from_millis(33)),
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// Which kinds of media a capture request asks for.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl MediaConstraints {
    pub fn kinds(&self) -> Vec<MediaKind> {
        let mut kinds = Vec::with_capacity(2);
        if self.audio {
            kinds.push(MediaKind::Audio);
        }
        if self.video {
            kinds.push(MediaKind::Video);
        }
        kinds
    }
}

#[derive(Clone)]
pub struct LocalTrack {
    id: String,
    kind: MediaKind,
    stream_id: String,
    rtc: Arc<TrackLocalStaticSample>,
    live: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, stream_id: &str) -> Self {
        let id = format!("{kind}-{}", random_id());
        let rtc = Arc::new(TrackLocalStaticSample::new(
            kind.codec(),
            id.clone(),
            stream_id.to_string(),
        ));
        Self {
            id,
            kind,
            stream_id: stream_id.to_string(),
            rtc,
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.rtc)
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Releases the capture source. Idempotent.
    pub fn stop(&self) {
        if self.live.swap(false, Ordering::AcqRel) {
            debug!("Stopped {} track {}", self.kind, self.id);
        }
    }

    /// Feeds placeholder frames into the track until it is stopped.
    fn spawn_feed(&self) {
        let track = Arc::clone(&self.rtc);
        let live = Arc::clone(&self.live);
        let (data, duration) = self.kind.frame();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(duration);
            while live.load(Ordering::Acquire) {
                ticker.tick().await;
                let sample = Sample {
                    data: data.clone(),
                    duration,
                    ..Default::default()
                };
                if let Err(e) = track.write_sample(&sample).await {
                    debug!("write_sample failed on {}: {}", track.id(), e);
                }
            }
        });
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stream_id", &self.stream_id)
            .field("live", &self.is_live())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn track_ids(&self) -> Vec<String> {
        self.tracks.iter().map(|t| t.id.clone()).collect()
    }

    pub fn push(&mut self, track: LocalTrack) {
        self.tracks.push(track);
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaStream, MediaError>;

    /// Captures a single live track into the existing stream `stream_id`.
    async fn acquire_track(&self, kind: MediaKind, stream_id: &str)
        -> Result<LocalTrack, MediaError>;
}

/// Device-free capture source producing silent audio and blank video.
#[derive(Debug, Clone)]
pub struct SyntheticMediaSource {
    permission_granted: bool,
    available: MediaConstraints,
}

impl Default for SyntheticMediaSource {
    fn default() -> Self {
        Self {
            permission_granted: true,
            available: MediaConstraints::default(),
        }
    }
}

impl SyntheticMediaSource {
    /// A source whose permission prompt is always refused.
    pub fn denied() -> Self {
        Self {
            permission_granted: false,
            ..Default::default()
        }
    }

    fn check(&self, kind: MediaKind) -> Result<(), MediaError> {
        if !self.permission_granted {
            return Err(MediaError::PermissionDenied);
        }
        let present = match kind {
            MediaKind::Audio => self.available.audio,
            MediaKind::Video => self.available.video,
        };
        if present {
            Ok(())
        } else {
            Err(MediaError::NoDevice(kind))
        }
    }

    /// A source that only has the given devices plugged in.
    pub fn with_devices(available: MediaConstraints) -> Self {
        Self {
            permission_granted: true,
            available,
        }
    }
}

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaStream, MediaError> {
        let kinds = constraints.kinds();
        if kinds.is_empty() {
            return Err(MediaError::EmptyConstraints);
        }
        for kind in &kinds {
            self.check(*kind)?;
        }

        let stream_id = format!("stream-{}", random_id());
        let tracks: Vec<LocalTrack> = kinds
            .into_iter()
            .map(|kind| LocalTrack::new(kind, &stream_id))
            .collect();
        for track in &tracks {
            track.spawn_feed();
        }

        info!(
            "Acquired synthetic media stream {} with {} track(s)",
            stream_id,
            tracks.len()
        );
        Ok(MediaStream::new(stream_id, tracks))
    }

    async fn acquire_track(
        &self,
        kind: MediaKind,
        stream_id: &str,
    ) -> Result<LocalTrack, MediaError> {
        self.check(kind)?;
        let track = LocalTrack::new(kind, stream_id);
        track.spawn_feed();
        info!("Acquired synthetic {} track {}", kind, track.id());
        Ok(track)
    }
}
