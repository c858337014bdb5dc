//! kiosk-core — face matching, liveness signals and face analysis.
//!
//! Pure logic (matching, liveness, quality, thresholds) has no I/O; the
//! ONNX pipeline (UltraFace detector, PFLD landmarks, 128-d descriptor)
//! sits behind the [`DetectionEngine`] trait.

pub mod detector;
pub mod engine;
pub mod landmarks;
pub mod liveness;
pub mod matcher;
pub mod policy;
pub mod quality;
pub mod recognizer;
pub mod types;

pub use engine::{DetectionEngine, EngineError, OnnxEngine};
pub use liveness::{LivenessTracker, TurnDirection};
pub use matcher::{confidence_from_distance, EuclideanMatcher, Matcher};
pub use policy::{ThresholdPolicy, Verdict};
pub use quality::{check_face_quality, QualityReport};
pub use types::{
    Descriptor, DescriptorError, Enrollment, FaceBox, FaceCapture, FaceDetection, IdentityRef, Landmarks68,
    MatchCandidate, Point,
};
