//! 128-d face descriptor network via ONNX Runtime.
//!
//! Expects a 150×150 RGB face crop, mean-subtracted per channel and
//! scaled by 1/256. Output descriptors are compared with plain Euclidean
//! distance, so they are NOT L2-normalized here.

use crate::engine::{face_crop, EngineError};
use crate::types::{Descriptor, FaceBox};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const DESCRIPTOR_INPUT_SIZE: u32 = 150;
const DESCRIPTOR_MEAN_RGB: [f32; 3] = [122.782, 117.001, 104.298];
const DESCRIPTOR_SCALE: f32 = 256.0;
const DESCRIPTOR_CROP_SCALE: f32 = 1.1;

pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    pub fn load(model_path: &Path) -> Result<Self, EngineError> {
        if !model_path.exists() {
            return Err(EngineError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            "loaded descriptor model"
        );
        Ok(Self { session })
    }

    pub fn extract(&mut self, frame: &RgbImage, bbox: &FaceBox) -> Result<Descriptor, EngineError> {
        let (crop, _, _) = face_crop(frame, bbox, DESCRIPTOR_CROP_SCALE)?;
        let input = preprocess(&crop);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EngineError::InferenceFailed(format!("descriptor extraction: {e}")))?;

        Ok(Descriptor::new(raw.to_vec())?)
    }
}

fn preprocess(crop: &RgbImage) -> Array4<f32> {
    let resized = imageops::resize(crop, DESCRIPTOR_INPUT_SIZE, DESCRIPTOR_INPUT_SIZE, FilterType::Triangle);
    let size = DESCRIPTOR_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] =
                (pixel[c] as f32 - DESCRIPTOR_MEAN_RGB[c]) / DESCRIPTOR_SCALE;
        }
    }
    tensor
}
