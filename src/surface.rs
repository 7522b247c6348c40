//! Render targets for the call: two video surfaces and the remote text area.

use std::sync::{Mutex, MutexGuard};

use log::debug;
use serde::Serialize;
use tokio::sync::watch;

/// What a video surface is currently showing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VideoSource {
    pub stream_id: String,
    pub track_ids: Vec<String>,
}

#[derive(Debug)]
pub struct VideoSurface {
    name: &'static str,
    source: Mutex<Option<VideoSource>>,
}

impl VideoSurface {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            source: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<VideoSource>> {
        self.source.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replaces whatever was shown with a whole stream.
    pub fn show(&self, stream_id: &str, track_ids: Vec<String>) {
        debug!("{}: showing stream {}", self.name, stream_id);
        *self.lock() = Some(VideoSource {
            stream_id: stream_id.to_string(),
            track_ids,
        });
    }

    /// Adds one track, switching streams if it belongs to a different one.
    pub fn attach_track(&self, stream_id: &str, track_id: &str) {
        let mut source = self.lock();
        match source.as_mut() {
            Some(current) if current.stream_id == stream_id => {
                if !current.track_ids.iter().any(|t| t == track_id) {
                    current.track_ids.push(track_id.to_string());
                }
            }
            _ => {
                *source = Some(VideoSource {
                    stream_id: stream_id.to_string(),
                    track_ids: vec![track_id.to_string()],
                });
            }
        }
    }

    pub fn clear(&self) {
        debug!("{}: cleared", self.name);
        *self.lock() = None;
    }

    /// Clears the surface only if it still shows `stream_id`.
    pub fn clear_if_showing(&self, stream_id: &str) {
        let mut source = self.lock();
        if source.as_ref().is_some_and(|s| s.stream_id == stream_id) {
            debug!("{}: cleared stale stream {}", self.name, stream_id);
            *source = None;
        }
    }

    pub fn current(&self) -> Option<VideoSource> {
        self.lock().clone()
    }

    pub fn is_blank(&self) -> bool {
        self.lock().is_none()
    }
}

/// Holds the last message received, like a text area whose value is overwritten.
#[derive(Debug)]
pub struct MessageSurface {
    text: watch::Sender<Option<String>>,
}

impl Default for MessageSurface {
    fn default() -> Self {
        let (text, _) = watch::channel(None);
        Self { text }
    }
}

impl MessageSurface {
    pub fn show(&self, text: String) {
        self.text.send_replace(Some(text));
    }

    pub fn current(&self) -> Option<String> {
        self.text.borrow().clone()
    }
}

#[derive(Debug)]
pub struct Surfaces {
    pub local_video: VideoSurface,
    pub remote_video: VideoSurface,
    pub remote_message: MessageSurface,
}

impl Default for Surfaces {
    fn default() -> Self {
        Self {
            local_video: VideoSurface::new("localVideo"),
            remote_video: VideoSurface::new("remoteVideo"),
            remote_message: MessageSurface::default(),
        }
    }
}

impl Surfaces {
    pub fn clear_video(&self) {
        self.local_video.clear();
        self.remote_video.clear();
    }
}
