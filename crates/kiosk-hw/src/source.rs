//! Source-agnostic frame feed.
//!
//! A [`VideoSource`] pushes frames into a [`FrameSink`]; the pipeline only
//! ever reads the latest frame from the paired [`FrameFeed`].

use crate::camera::{CameraError, CameraSource};
use crate::frame::Frame;
use crate::snapshot::SnapshotSource;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

pub type FrameSink = watch::Sender<Option<Arc<Frame>>>;
pub type FrameFeed = watch::Receiver<Option<Arc<Frame>>>;

/// Latest-frame channel. Slow readers skip frames instead of queueing them.
pub fn frame_channel() -> (FrameSink, FrameFeed) {
    watch::channel(None)
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error("snapshot URL is not configured")]
    MissingUrl,
    #[error("snapshot fetch failed: {0}")]
    Snapshot(String),
    #[error("source already started")]
    AlreadyStarted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Camera,
    Snapshot,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Camera => "camera",
            SourceKind::Snapshot => "snapshot",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "camera" | "webcam" => Some(SourceKind::Camera),
            "snapshot" | "rtsp" | "mjpeg" => Some(SourceKind::Snapshot),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait VideoSource: Send {
    /// Begin delivering frames into `sink`. Resolves once the first frame
    /// is available; an error here is terminal for the session.
    async fn start(&mut self, sink: FrameSink) -> Result<(), SourceError>;

    /// Stop delivering frames and release the device. Idempotent.
    fn stop(&mut self);

    fn kind(&self) -> SourceKind;
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub camera_device: String,
    pub snapshot_url: Option<String>,
    pub snapshot_fps: u32,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            snapshot_url: None,
            snapshot_fps: 5,
        }
    }
}

/// Build the requested source. Unknown source types fall back to the camera.
pub fn create_video_source(requested: &str, settings: &SourceSettings) -> Box<dyn VideoSource> {
    let kind = SourceKind::parse(requested).unwrap_or_else(|| {
        tracing::warn!(requested, "unknown video source type, falling back to camera");
        SourceKind::Camera
    });

    match kind {
        SourceKind::Camera => Box::new(CameraSource::new(&settings.camera_device)),
        SourceKind::Snapshot => {
            let fps = settings.snapshot_fps.max(1);
            let interval = Duration::from_millis(1000 / fps as u64);
            Box::new(SnapshotSource::new(settings.snapshot_url.clone(), interval))
        }
    }
}
