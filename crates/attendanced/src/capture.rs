//! Capture/quality gate between the frame feed and the state machine.
//!
//! "Nothing usable yet" is the common case while polling, so detection
//! calls return `Option` and swallow per-frame failures.

use crate::engine::FaceEngine;
use kiosk_core::{check_face_quality, FaceCapture, Landmarks68, QualityReport};
use kiosk_hw::{FrameError, FrameFeed};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("no camera frame available")]
    NoFrame,
    #[error("Video source stopped delivering frames. Restart the kiosk.")]
    SourceLost,
    #[error(transparent)]
    Encode(#[from] FrameError),
}

/// A single usable face with its descriptor and on-screen guidance.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub capture: FaceCapture,
    pub quality: QualityReport,
}

impl DetectedFace {
    pub fn score(&self) -> f32 {
        self.capture.score()
    }
}

#[derive(Clone)]
pub struct CaptureGate {
    engine: Arc<dyn FaceEngine>,
    feed: FrameFeed,
}

impl CaptureGate {
    pub fn new(engine: Arc<dyn FaceEngine>, feed: FrameFeed) -> Self {
        Self { engine, feed }
    }

    /// Single face with a descriptor, or `None` for zero faces, several
    /// faces, no frame yet, or malformed detector output.
    pub async fn detect_face(&self) -> Option<DetectedFace> {
        let frame = self.feed.borrow().clone()?;
        let analysis = match self.engine.analyze(frame.clone(), true).await {
            Ok(analysis) => analysis,
            Err(e) => {
                tracing::debug!(error = %e, "detection failed, treating as no face");
                return None;
            }
        };

        if analysis.faces.len() != 1 {
            if analysis.faces.len() > 1 {
                tracing::debug!(faces = analysis.faces.len(), "ignoring frame with several faces");
            }
            return None;
        }
        let descriptor = analysis.descriptor?;
        let detection = analysis.faces.into_iter().next()?;
        let quality = check_face_quality(&detection, frame.width(), frame.height());

        Some(DetectedFace {
            capture: FaceCapture { descriptor, detection },
            quality,
        })
    }

    /// Landmarks of the single visible face; no descriptor is computed.
    pub async fn detect_landmarks(&self) -> Option<Landmarks68> {
        let frame = self.feed.borrow().clone()?;
        match self.engine.analyze(frame, false).await {
            Ok(analysis) if analysis.faces.len() == 1 => analysis.faces.into_iter().next().map(|f| f.landmarks),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(error = %e, "landmark detection failed");
                None
            }
        }
    }

    /// The video source has shut down its feed and no frame is current.
    pub fn source_lost(&self) -> bool {
        self.feed.has_changed().is_err() && self.feed.borrow().is_none()
    }

    /// JPEG snapshot of the latest frame, independent of detection.
    pub fn capture_photo(&self) -> Result<Vec<u8>, CaptureError> {
        let frame = self.feed.borrow().clone().ok_or(CaptureError::NoFrame)?;
        Ok(frame.to_jpeg()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Analysis, EngineError};
    use async_trait::async_trait;
    use image::RgbImage;
    use kiosk_core::types::{DESCRIPTOR_LEN, LANDMARK_COUNT};
    use kiosk_core::{Descriptor, FaceBox, FaceDetection, Point};
    use kiosk_hw::{frame_channel, Frame};

    struct FixedEngine {
        faces: usize,
        fail: bool,
    }

    #[async_trait]
    impl FaceEngine for FixedEngine {
        async fn analyze(&self, _frame: Arc<Frame>, describe: bool) -> Result<Analysis, EngineError> {
            if self.fail {
                return Err(EngineError::ChannelClosed);
            }
            let face = FaceDetection {
                bbox: FaceBox { x: 220.0, y: 140.0, width: 200.0, height: 200.0 },
                score: 0.95,
                landmarks: Landmarks68::new(vec![Point::new(3.0, 4.0); LANDMARK_COUNT]).unwrap(),
            };
            Ok(Analysis {
                faces: vec![face; self.faces],
                descriptor: (describe && self.faces == 1).then(|| Descriptor::new(vec![0.1; DESCRIPTOR_LEN]).unwrap()),
            })
        }
    }

    fn gate(faces: usize, fail: bool, with_frame: bool) -> CaptureGate {
        let (sink, feed) = frame_channel();
        if with_frame {
            sink.send_replace(Some(Arc::new(Frame::new(RgbImage::new(640, 480), 7))));
        }
        // The gate only reads the latest value; the sender may go away.
        drop(sink);
        CaptureGate::new(Arc::new(FixedEngine { faces, fail }), feed)
    }

    #[tokio::test]
    async fn test_single_face_detected_with_quality() {
        let face = gate(1, false, true).detect_face().await.unwrap();
        assert!(face.quality.is_good);
        assert_eq!(face.score(), 0.95);
    }

    #[tokio::test]
    async fn test_zero_or_many_faces_is_none() {
        assert!(gate(0, false, true).detect_face().await.is_none());
        assert!(gate(2, false, true).detect_face().await.is_none());
        assert!(gate(2, false, true).detect_landmarks().await.is_none());
    }

    #[tokio::test]
    async fn test_engine_failure_is_none() {
        assert!(gate(1, true, true).detect_face().await.is_none());
        assert!(gate(1, true, true).detect_landmarks().await.is_none());
    }

    #[tokio::test]
    async fn test_no_frame_yet() {
        let g = gate(1, false, false);
        assert!(g.detect_face().await.is_none());
        assert!(matches!(g.capture_photo(), Err(CaptureError::NoFrame)));
    }

    #[tokio::test]
    async fn test_landmarks_without_descriptor() {
        let lm = gate(1, false, true).detect_landmarks().await.unwrap();
        assert_eq!(lm.points().len(), LANDMARK_COUNT);
    }

    #[test]
    fn test_source_lost_once_feed_is_emptied_and_closed() {
        let (sink, feed) = frame_channel();
        sink.send_replace(Some(Arc::new(Frame::new(RgbImage::new(640, 480), 1))));
        let g = CaptureGate::new(Arc::new(FixedEngine { faces: 1, fail: false }), feed);
        assert!(!g.source_lost());

        sink.send_replace(None);
        assert!(!g.source_lost());
        drop(sink);
        assert!(g.source_lost());
    }

    #[test]
    fn test_closed_feed_with_frame_is_not_lost() {
        assert!(!gate(1, false, true).source_lost());
    }

    #[test]
    fn test_capture_photo_is_jpeg() {
        let jpeg = gate(0, false, true).capture_photo().unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }
}
