//! Detection + landmarks + descriptor pipeline behind a single seam.

use crate::detector::FaceDetector;
use crate::landmarks::LandmarkRegressor;
use crate::recognizer::FaceRecognizer;
use crate::types::{Descriptor, DescriptorError, FaceBox, FaceDetection};
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

pub const DETECTOR_MODEL_FILE: &str = "ultraface-rfb-320.onnx";
pub const LANDMARK_MODEL_FILE: &str = "landmarks68-pfld.onnx";
pub const DESCRIPTOR_MODEL_FILE: &str = "face-descriptor128.onnx";

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("model file not found: {0} (place the ONNX models in the model directory)")]
    ModelNotFound(String),
    #[error("ONNX Runtime error: {0}")]
    Ort(#[from] ort::Error),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("invalid descriptor: {0}")]
    Descriptor(#[from] DescriptorError),
    #[error("face box lies outside the frame")]
    EmptyCrop,
}

/// Face analysis backend. Implementations are single-threaded and stateful
/// (ONNX sessions need `&mut`), so callers own one per worker.
pub trait DetectionEngine: Send {
    /// All faces in the frame that carry a full landmark set, best first.
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<FaceDetection>, EngineError>;

    /// Compute the descriptor for a face previously returned by `detect`.
    fn describe(&mut self, frame: &RgbImage, face: &FaceDetection) -> Result<Descriptor, EngineError>;
}

pub struct OnnxEngine {
    detector: FaceDetector,
    landmarks: LandmarkRegressor,
    recognizer: FaceRecognizer,
}

impl OnnxEngine {
    /// Load all three networks from `model_dir`. Fails fast on the first
    /// missing or unloadable model.
    pub fn load(model_dir: &Path) -> Result<Self, EngineError> {
        let detector = FaceDetector::load(&model_dir.join(DETECTOR_MODEL_FILE))?;
        let landmarks = LandmarkRegressor::load(&model_dir.join(LANDMARK_MODEL_FILE))?;
        let recognizer = FaceRecognizer::load(&model_dir.join(DESCRIPTOR_MODEL_FILE))?;
        Ok(Self {
            detector,
            landmarks,
            recognizer,
        })
    }
}

impl DetectionEngine for OnnxEngine {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<FaceDetection>, EngineError> {
        let raw = self.detector.detect(frame)?;
        let mut faces = Vec::with_capacity(raw.len());
        for face in raw {
            match self.landmarks.landmarks(frame, &face.bbox)? {
                Some(landmarks) => faces.push(FaceDetection {
                    bbox: face.bbox,
                    score: face.score,
                    landmarks,
                }),
                None => tracing::debug!(score = face.score, "dropping face without usable landmarks"),
            }
        }
        Ok(faces)
    }

    fn describe(&mut self, frame: &RgbImage, face: &FaceDetection) -> Result<Descriptor, EngineError> {
        self.recognizer.extract(frame, &face.bbox)
    }
}

/// Square crop around `bbox`, side = longer box side × `scale`, clamped to
/// the frame. Returns the crop and its top-left corner in frame pixels.
pub(crate) fn face_crop(frame: &RgbImage, bbox: &FaceBox, scale: f32) -> Result<(RgbImage, f32, f32), EngineError> {
    let center = bbox.center();
    let side = bbox.width.max(bbox.height) * scale;
    let (fw, fh) = (frame.width() as f32, frame.height() as f32);

    let x0 = (center.x - side / 2.0).clamp(0.0, fw);
    let y0 = (center.y - side / 2.0).clamp(0.0, fh);
    let x1 = (center.x + side / 2.0).clamp(0.0, fw);
    let y1 = (center.y + side / 2.0).clamp(0.0, fh);

    let (x, y) = (x0.floor() as u32, y0.floor() as u32);
    let w = (x1.ceil() as u32).saturating_sub(x);
    let h = (y1.ceil() as u32).saturating_sub(y);
    if w == 0 || h == 0 {
        return Err(EngineError::EmptyCrop);
    }

    let crop = image::imageops::crop_imm(frame, x, y, w, h).to_image();
    Ok((crop, x as f32, y as f32))
}
