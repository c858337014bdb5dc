//! 68-point landmark regressor (PFLD layout) via ONNX Runtime.

use crate::engine::{face_crop, EngineError};
use crate::types::{FaceBox, Landmarks68, Point, LANDMARK_COUNT};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const PFLD_INPUT_SIZE: u32 = 112;
/// Crop side relative to the longer box side.
const PFLD_CROP_SCALE: f32 = 1.2;

pub struct LandmarkRegressor {
    session: Session,
}

impl LandmarkRegressor {
    pub fn load(model_path: &Path) -> Result<Self, EngineError> {
        if !model_path.exists() {
            return Err(EngineError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = %model_path.display(), "loaded 68-point landmark model");
        Ok(Self { session })
    }

    /// Regress landmarks for one face box. Returns `Ok(None)` when the
    /// network output is malformed.
    pub fn landmarks(&mut self, frame: &RgbImage, bbox: &FaceBox) -> Result<Option<Landmarks68>, EngineError> {
        let (crop, origin_x, origin_y) = face_crop(frame, bbox, PFLD_CROP_SCALE)?;
        let (crop_w, crop_h) = (crop.width() as f32, crop.height() as f32);
        let input = preprocess(&crop);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        // PFLD exports two outputs (pose features, landmarks); landmarks come last.
        let last = outputs.len().saturating_sub(1);
        let (_, raw) = outputs[last]
            .try_extract_tensor::<f32>()
            .map_err(|e| EngineError::InferenceFailed(format!("landmarks: {e}")))?;

        Ok(to_frame_points(raw, origin_x, origin_y, crop_w, crop_h))
    }
}

fn preprocess(crop: &RgbImage) -> Array4<f32> {
    let resized = imageops::resize(crop, PFLD_INPUT_SIZE, PFLD_INPUT_SIZE, FilterType::Triangle);
    let size = PFLD_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
        }
    }
    tensor
}

/// Map crop-normalized `[x0, y0, x1, y1, ...]` output into frame pixels.
fn to_frame_points(raw: &[f32], origin_x: f32, origin_y: f32, crop_w: f32, crop_h: f32) -> Option<Landmarks68> {
    if raw.len() != LANDMARK_COUNT * 2 {
        tracing::debug!(len = raw.len(), "unexpected landmark tensor length");
        return None;
    }
    let points = raw
        .chunks_exact(2)
        .map(|xy| Point::new(origin_x + xy[0] * crop_w, origin_y + xy[1] * crop_h))
        .collect();
    Landmarks68::new(points)
}
