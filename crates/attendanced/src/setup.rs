//! Session activation. Any failure here is terminal for the session.
//!
//! Order matters: the kiosk guards run before models are loaded, and the
//! video source is only started once both succeeded, so a misconfigured
//! kiosk never opens the camera.

use crate::config::{Config, Variant};
use kiosk_backend::{load_staff_session, run_guards, AttendanceBackend, ConvexBackend, GuardError, GuardedSession};
use kiosk_core::DetectionEngine;
use kiosk_hw::{frame_channel, FrameFeed, SourceKind, VideoSource};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SetupError {
    #[error(transparent)]
    Guard(#[from] GuardError),
    #[error("Video source error ({kind}): {message}")]
    Source { kind: SourceKind, message: String },
    #[error("Failed to load face recognition models: {0}")]
    Models(#[from] kiosk_core::EngineError),
    #[error("{0}")]
    Config(String),
}

/// Everything the state machine needs once activation succeeded.
pub struct Activation {
    pub session: GuardedSession,
    pub engine: Box<dyn DetectionEngine>,
    pub source: Box<dyn VideoSource>,
    pub feed: FrameFeed,
}

pub fn connect_backend(config: &Config) -> Result<Arc<dyn AttendanceBackend>, SetupError> {
    let url = config
        .backend_url
        .as_deref()
        .ok_or_else(|| SetupError::Config("Backend URL required. Set KIOSK_BACKEND_URL.".into()))?;
    let backend = ConvexBackend::new(url).map_err(|e| SetupError::Config(e.to_string()))?;
    Ok(Arc::new(backend))
}

pub async fn activate<F>(
    config: &Config,
    backend: &dyn AttendanceBackend,
    device_fingerprint: &str,
    load_models: F,
    mut source: Box<dyn VideoSource>,
) -> Result<Activation, SetupError>
where
    F: FnOnce() -> Result<Box<dyn DetectionEngine>, kiosk_core::EngineError>,
{
    let session = match config.variant {
        Variant::Kiosk => run_guards(backend, config.branch_code.as_deref(), device_fingerprint).await?,
        Variant::Staff => {
            let branch_id = config.branch_id.as_deref().ok_or_else(|| {
                SetupError::Config("Branch ID required. Set KIOSK_BRANCH_ID for the staff check-in screen.".into())
            })?;
            load_staff_session(backend, branch_id).await?
        }
    };

    let engine = load_models()?;
    tracing::info!(model_dir = %config.model_dir.display(), "face models loaded");

    let (sink, feed) = frame_channel();
    if let Err(e) = source.start(sink).await {
        source.stop();
        return Err(SetupError::Source {
            kind: source.kind(),
            message: e.to_string(),
        });
    }
    tracing::info!(source = %source.kind(), branch = %session.branch_id, "video source started");

    Ok(Activation {
        session,
        engine,
        source,
        feed,
    })
}
