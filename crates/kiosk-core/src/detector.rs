//! UltraFace (RFB-320) face detector via ONNX Runtime.
//!
//! Anchor-decoded model: emits per-prior class scores and corner boxes
//! normalized to [0, 1]. We threshold, rescale to frame pixels and run NMS.

use crate::engine::EngineError;
use crate::types::FaceBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const ULTRAFACE_INPUT_WIDTH: u32 = 320;
const ULTRAFACE_INPUT_HEIGHT: u32 = 240;
const ULTRAFACE_MEAN: f32 = 127.0;
const ULTRAFACE_STD: f32 = 128.0;
const ULTRAFACE_CONFIDENCE_THRESHOLD: f32 = 0.6;
const ULTRAFACE_NMS_THRESHOLD: f32 = 0.3;

/// Detector output before landmarks are attached.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFace {
    pub bbox: FaceBox,
    pub score: f32,
}

pub struct FaceDetector {
    session: Session,
    /// (scores, boxes) output positions.
    output_indices: (usize, usize),
}

impl FaceDetector {
    pub fn load(model_path: &Path) -> Result<Self, EngineError> {
        if !model_path.exists() {
            return Err(EngineError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 2 {
            return Err(EngineError::InferenceFailed(format!(
                "UltraFace model requires 2 outputs (scores, boxes), got {}",
                output_names.len()
            )));
        }
        let output_indices = discover_output_indices(&output_names);

        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            ?output_indices,
            "loaded UltraFace detector"
        );

        Ok(Self {
            session,
            output_indices,
        })
    }

    /// Detect faces, sorted by descending score.
    pub fn detect(&mut self, frame: &RgbImage) -> Result<Vec<RawFace>, EngineError> {
        let input = preprocess(frame);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (scores_idx, boxes_idx) = self.output_indices;
        let (_, scores) = outputs[scores_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| EngineError::InferenceFailed(format!("scores: {e}")))?;
        let (_, boxes) = outputs[boxes_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| EngineError::InferenceFailed(format!("boxes: {e}")))?;

        let candidates = decode(
            scores,
            boxes,
            frame.width() as f32,
            frame.height() as f32,
            ULTRAFACE_CONFIDENCE_THRESHOLD,
        );
        Ok(nms(candidates, ULTRAFACE_NMS_THRESHOLD))
    }
}

/// Stretch the frame to the network input and normalize into NCHW.
fn preprocess(frame: &RgbImage) -> Array4<f32> {
    let resized = imageops::resize(
        frame,
        ULTRAFACE_INPUT_WIDTH,
        ULTRAFACE_INPUT_HEIGHT,
        FilterType::Triangle,
    );
    let (w, h) = (ULTRAFACE_INPUT_WIDTH as usize, ULTRAFACE_INPUT_HEIGHT as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - ULTRAFACE_MEAN) / ULTRAFACE_STD;
        }
    }
    tensor
}

/// Locate the score and box tensors by name, falling back to (0, 1).
fn discover_output_indices(names: &[String]) -> (usize, usize) {
    let find = |needle: &str| names.iter().position(|n| n.to_lowercase().contains(needle));
    match (find("score"), find("box")) {
        (Some(s), Some(b)) if s != b => (s, b),
        _ => {
            tracing::info!(?names, "UltraFace: output names not recognized, using positional mapping");
            (0, 1)
        }
    }
}

/// Decode `[N, 2]` class scores and `[N, 4]` normalized corner boxes.
fn decode(scores: &[f32], boxes: &[f32], frame_w: f32, frame_h: f32, threshold: f32) -> Vec<RawFace> {
    let priors = (scores.len() / 2).min(boxes.len() / 4);
    let mut faces = Vec::new();

    for i in 0..priors {
        let score = scores[i * 2 + 1];
        if !(score > threshold) {
            continue;
        }
        let x1 = boxes[i * 4].clamp(0.0, 1.0) * frame_w;
        let y1 = boxes[i * 4 + 1].clamp(0.0, 1.0) * frame_h;
        let x2 = boxes[i * 4 + 2].clamp(0.0, 1.0) * frame_w;
        let y2 = boxes[i * 4 + 3].clamp(0.0, 1.0) * frame_h;
        if x2 <= x1 || y2 <= y1 {
            continue;
        }
        faces.push(RawFace {
            bbox: FaceBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
            },
            score,
        });
    }

    faces
}

/// Greedy non-maximum suppression; output is sorted by score.
fn nms(mut faces: Vec<RawFace>, iou_threshold: f32) -> Vec<RawFace> {
    faces.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep: Vec<RawFace> = Vec::new();
    for face in faces {
        if keep.iter().all(|k| iou(&k.bbox, &face.bbox) <= iou_threshold) {
            keep.push(face);
        }
    }
    keep
}

fn iou(a: &FaceBox, b: &FaceBox) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x: f32, y: f32, w: f32, h: f32, score: f32) -> RawFace {
        RawFace {
            bbox: FaceBox { x, y, width: w, height: h },
            score,
        }
    }

    #[test]
    fn test_iou_identical() {
        let a = face(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((iou(&a.bbox, &a.bbox) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = face(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = face(5.0, 0.0, 10.0, 10.0, 1.0);
        assert!((iou(&a.bbox, &b.bbox) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_best_of_overlapping() {
        let result = nms(
            vec![
                face(5.0, 5.0, 100.0, 100.0, 0.8),
                face(0.0, 0.0, 100.0, 100.0, 0.9),
                face(200.0, 200.0, 50.0, 50.0, 0.7),
            ],
            0.3,
        );
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].score, 0.9);
        assert_eq!(result[1].score, 0.7);
    }

    #[test]
    fn test_decode_scales_and_thresholds() {
        // Two priors: background-dominant and a confident face.
        let scores = [0.9, 0.1, 0.05, 0.95];
        let boxes = [0.0, 0.0, 0.1, 0.1, 0.25, 0.5, 0.75, 1.0];
        let faces = decode(&scores, &boxes, 640.0, 480.0, 0.6);
        assert_eq!(faces.len(), 1);
        let b = faces[0].bbox;
        assert_eq!((b.x, b.y, b.width, b.height), (160.0, 240.0, 320.0, 240.0));
        assert_eq!(faces[0].score, 0.95);
    }

    #[test]
    fn test_decode_drops_degenerate_boxes() {
        let scores = [0.0, 0.99];
        let boxes = [0.5, 0.5, 0.5, 0.9];
        assert!(decode(&scores, &boxes, 100.0, 100.0, 0.6).is_empty());
    }

    #[test]
    fn test_discover_output_indices() {
        let named: Vec<String> = vec!["boxes".into(), "scores".into()];
        assert_eq!(discover_output_indices(&named), (1, 0));
        let generic: Vec<String> = vec!["461".into(), "462".into()];
        assert_eq!(discover_output_indices(&generic), (0, 1));
    }

    #[test]
    fn test_preprocess_shape_and_normalization() {
        let frame = RgbImage::from_pixel(64, 48, image::Rgb([127, 255, 0]));
        let tensor = preprocess(&frame);
        assert_eq!(tensor.shape(), &[1, 3, 240, 320]);
        assert!(tensor[[0, 0, 10, 10]].abs() < 1e-6);
        assert!((tensor[[0, 1, 10, 10]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 2, 10, 10]] + 127.0 / 128.0).abs() < 1e-6);
    }
}
