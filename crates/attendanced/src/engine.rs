use async_trait::async_trait;
use kiosk_core::{DetectionEngine, Descriptor, FaceDetection};
use kiosk_hw::Frame;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Inference(#[from] kiosk_core::EngineError),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Faces found in one frame. `descriptor` is only computed on request and
/// only when exactly one face is present.
#[derive(Debug, Clone, Default)]
pub struct Analysis {
    pub faces: Vec<FaceDetection>,
    pub descriptor: Option<Descriptor>,
}

/// Asynchronous face analysis, awaited once per poll.
#[async_trait]
pub trait FaceEngine: Send + Sync {
    async fn analyze(&self, frame: Arc<Frame>, describe: bool) -> Result<Analysis, EngineError>;
}

struct AnalyzeRequest {
    frame: Arc<Frame>,
    describe: bool,
    reply: oneshot::Sender<Result<Analysis, kiosk_core::EngineError>>,
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<AnalyzeRequest>,
}

#[async_trait]
impl FaceEngine for EngineHandle {
    async fn analyze(&self, frame: Arc<Frame>, describe: bool) -> Result<Analysis, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(AnalyzeRequest {
                frame,
                describe,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }
}

/// Spawn the engine on a dedicated OS thread. The engine is moved in and
/// lives until every handle is dropped.
pub fn spawn_engine(mut engine: Box<dyn DetectionEngine>) -> EngineHandle {
    let (tx, mut rx) = mpsc::channel::<AnalyzeRequest>(4);

    std::thread::Builder::new()
        .name("kiosk-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                let result = run_analysis(engine.as_mut(), &req.frame, req.describe);
                let _ = req.reply.send(result);
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    EngineHandle { tx }
}

fn run_analysis(
    engine: &mut dyn DetectionEngine,
    frame: &Frame,
    describe: bool,
) -> Result<Analysis, kiosk_core::EngineError> {
    let faces = engine.detect(&frame.image)?;
    tracing::debug!(seq = frame.sequence, faces = faces.len(), "frame analyzed");

    let descriptor = match faces.as_slice() {
        [face] if describe => Some(engine.describe(&frame.image, face)?),
        _ => None,
    };
    Ok(Analysis { faces, descriptor })
}
