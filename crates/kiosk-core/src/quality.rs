//! Single-frame usability scoring for detections.

use crate::types::FaceDetection;
use serde::Serialize;

const MIN_SCORE: f32 = 0.8;
const MIN_AREA_FRACTION: f32 = 0.05;
const MAX_CENTER_OFFSET: f32 = 0.4;

/// Outcome of a quality check. `reasons` are on-screen guidance strings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityReport {
    pub is_good: bool,
    pub reasons: Vec<&'static str>,
}

pub fn check_face_quality(detection: &FaceDetection, frame_width: u32, frame_height: u32) -> QualityReport {
    let mut reasons = Vec::new();
    let w = frame_width as f32;
    let h = frame_height as f32;

    if detection.score < MIN_SCORE {
        reasons.push("Face not clear enough");
    }

    let frame_area = w * h;
    if frame_area <= 0.0 || detection.bbox.area() / frame_area < MIN_AREA_FRACTION {
        reasons.push("Move closer to camera");
    }

    let center = detection.bbox.center();
    let offset_x = (center.x - w / 2.0).abs() / w;
    let offset_y = (center.y - h / 2.0).abs() / h;
    if !(offset_x <= MAX_CENTER_OFFSET && offset_y <= MAX_CENTER_OFFSET) {
        reasons.push("Center your face");
    }

    QualityReport {
        is_good: reasons.is_empty(),
        reasons,
    }
}
