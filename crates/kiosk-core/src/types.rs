use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Length of a face descriptor produced by the recognition network.
pub const DESCRIPTOR_LEN: usize = 128;

/// Number of points in the landmark layout (iBUG 68).
pub const LANDMARK_COUNT: usize = 68;

#[derive(Error, Debug, PartialEq)]
pub enum DescriptorError {
    #[error("expected {DESCRIPTOR_LEN}-dim descriptor, got {0}")]
    WrongLength(usize),
    #[error("descriptor contains non-finite values")]
    NonFinite,
}

/// Fixed-length face descriptor (128 floats).
///
/// Construction validates length and finiteness, so every `Descriptor`
/// in circulation is safe to compare.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Descriptor(Vec<f32>);

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Result<Self, DescriptorError> {
        if values.len() != DESCRIPTOR_LEN {
            return Err(DescriptorError::WrongLength(values.len()));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(DescriptorError::NonFinite);
        }
        Ok(Self(values))
    }

    pub fn values(&self) -> &[f32] {
        &self.0
    }

    /// Euclidean distance between two descriptors. Symmetric.
    pub fn euclidean_distance(&self, other: &Descriptor) -> f32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl TryFrom<Vec<f32>> for Descriptor {
    type Error = DescriptorError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<Descriptor> for Vec<f32> {
    fn from(d: Descriptor) -> Self {
        d.0
    }
}

/// Who an enrollment belongs to: a barber record or a staff user account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum IdentityRef {
    Barber(String),
    StaffUser(String),
}

impl IdentityRef {
    pub fn id(&self) -> &str {
        match self {
            IdentityRef::Barber(id) | IdentityRef::StaffUser(id) => id,
        }
    }
}

impl fmt::Display for IdentityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityRef::Barber(id) => write!(f, "barber:{id}"),
            IdentityRef::StaffUser(id) => write!(f, "user:{id}"),
        }
    }
}

/// Stored reference descriptors for one identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub identity: IdentityRef,
    pub display_name: String,
    pub avatar_url: Option<String>,
    /// One or more captures, typically from different angles.
    pub embeddings: Vec<Descriptor>,
}

/// Best match for one query descriptor. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchCandidate {
    pub identity: IdentityRef,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub distance: f32,
    /// Linear transform of distance into [0, 1].
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f32 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// Axis-aligned face box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl FaceBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// 68-point facial landmarks in iBUG order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Landmarks68(Vec<Point>);

impl Landmarks68 {
    /// Returns `None` unless exactly 68 finite points are supplied.
    pub fn new(points: Vec<Point>) -> Option<Self> {
        if points.len() != LANDMARK_COUNT {
            return None;
        }
        if points.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
            return None;
        }
        Some(Self(points))
    }

    pub fn points(&self) -> &[Point] {
        &self.0
    }

    pub fn jaw_outline(&self) -> &[Point] {
        &self.0[0..17]
    }

    pub fn nose(&self) -> &[Point] {
        &self.0[27..36]
    }

    pub fn left_eye(&self) -> &[Point] {
        &self.0[36..42]
    }

    pub fn right_eye(&self) -> &[Point] {
        &self.0[42..48]
    }
}

/// One detected face with its landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceDetection {
    pub bbox: FaceBox,
    /// Detector confidence in [0, 1].
    pub score: f32,
    pub landmarks: Landmarks68,
}

/// A single-face capture with its descriptor, ready for matching.
#[derive(Debug, Clone)]
pub struct FaceCapture {
    pub descriptor: Descriptor,
    pub detection: FaceDetection,
}

impl FaceCapture {
    pub fn score(&self) -> f32 {
        self.detection.score
    }
}
