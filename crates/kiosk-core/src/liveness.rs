//! Active liveness signals: blink and directional head turn.
//!
//! Both checks consume one landmark measurement per frame and keep a
//! bounded rolling history. A check fires at most once per event: the
//! history is cleared when it fires, so a following event has to build
//! up its own evidence.

use crate::types::{Landmarks68, Point};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

const BLINK_HISTORY: usize = 40;
const BLINK_MIN_SAMPLES: usize = 4;
const BLINK_WINDOW: usize = 10;
/// Eyes count as closed below this EAR.
const BLINK_CLOSED_EAR: f32 = 0.25;
/// Eyes count as open above this EAR.
const BLINK_OPEN_EAR: f32 = 0.27;
const BLINK_MIN_DROP: f32 = 0.04;

const TURN_HISTORY: usize = 20;
const TURN_MIN_SAMPLES: usize = 3;
const TURN_WINDOW: usize = 3;
const TURN_THRESHOLD: f32 = 0.10;

fn eye_ratio(eye: &[Point]) -> f32 {
    let v1 = eye[1].distance(&eye[5]);
    let v2 = eye[2].distance(&eye[4]);
    let h = eye[0].distance(&eye[3]);
    (v1 + v2) / (2.0 * h)
}

/// Eye aspect ratio averaged over both eyes.
pub fn eye_aspect_ratio(landmarks: &Landmarks68) -> f32 {
    (eye_ratio(landmarks.left_eye()) + eye_ratio(landmarks.right_eye())) / 2.0
}

/// Signed head turn ratio from nose tip to jaw edges.
///
/// Negative when the head is turned left, positive when turned right,
/// near zero when facing the camera.
pub fn head_turn_ratio(landmarks: &Landmarks68) -> f32 {
    let nose_tip = landmarks.nose()[3];
    let jaw = landmarks.jaw_outline();
    let left = nose_tip.distance(&jaw[0]);
    let right = nose_tip.distance(&jaw[16]);
    (right - left) / (right + left)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnDirection {
    Left,
    Right,
}

impl TurnDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnDirection::Left => "left",
            TurnDirection::Right => "right",
        }
    }
}

/// Blink detector over a rolling EAR history.
#[derive(Debug, Default)]
pub struct BlinkDetector {
    history: VecDeque<f32>,
}

impl BlinkDetector {
    /// Feed one EAR sample. Returns `true` when a blink completed.
    pub fn push(&mut self, ear: f32) -> bool {
        if !ear.is_finite() {
            return false;
        }
        self.history.push_back(ear);
        if self.history.len() > BLINK_HISTORY {
            self.history.pop_front();
        }
        if self.history.len() < BLINK_MIN_SAMPLES {
            return false;
        }

        let skip = self.history.len().saturating_sub(BLINK_WINDOW);
        let (min, max) = self
            .history
            .iter()
            .skip(skip)
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });

        if min < BLINK_CLOSED_EAR && max > BLINK_OPEN_EAR && (max - min) > BLINK_MIN_DROP {
            self.history.clear();
            return true;
        }
        false
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }

    pub fn samples(&self) -> usize {
        self.history.len()
    }
}

/// Head-turn detector over a rolling ratio history.
#[derive(Debug, Default)]
pub struct HeadTurnDetector {
    history: VecDeque<f32>,
}

impl HeadTurnDetector {
    /// Feed one turn ratio. Returns `true` when the recent average shows
    /// a turn in `direction`.
    pub fn push(&mut self, ratio: f32, direction: TurnDirection) -> bool {
        if !ratio.is_finite() {
            return false;
        }
        self.history.push_back(ratio);
        if self.history.len() > TURN_HISTORY {
            self.history.pop_front();
        }
        if self.history.len() < TURN_MIN_SAMPLES {
            return false;
        }

        let recent = self.history.iter().rev().take(TURN_WINDOW);
        let avg = recent.sum::<f32>() / TURN_WINDOW as f32;
        let turned = match direction {
            TurnDirection::Left => avg < -TURN_THRESHOLD,
            TurnDirection::Right => avg > TURN_THRESHOLD,
        };

        if turned {
            self.history.clear();
        }
        turned
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }

    pub fn samples(&self) -> usize {
        self.history.len()
    }
}

/// Both liveness checks with a shared reset.
#[derive(Debug, Default)]
pub struct LivenessTracker {
    blink: BlinkDetector,
    turn: HeadTurnDetector,
}

impl LivenessTracker {
    pub fn check_blink(&mut self, landmarks: &Landmarks68) -> bool {
        self.blink.push(eye_aspect_ratio(landmarks))
    }

    pub fn check_head_turn(&mut self, landmarks: &Landmarks68, direction: TurnDirection) -> bool {
        self.turn.push(head_turn_ratio(landmarks), direction)
    }

    /// Clear both histories. Call whenever a liveness sequence (re)starts.
    pub fn reset(&mut self) {
        self.blink.reset();
        self.turn.reset();
    }
}
