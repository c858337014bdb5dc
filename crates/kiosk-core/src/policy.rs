//! Confidence thresholds shared by every attendance entry point.

use serde::Serialize;

pub const DEFAULT_ADMIN_REVIEW_THRESHOLD: f32 = 0.50;
pub const DEFAULT_AUTO_APPROVE_THRESHOLD: f32 = 0.65;

/// What a match confidence allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Below the admin-review threshold: nothing is recorded.
    Reject,
    /// Recorded, but flagged for manual review.
    Review,
    /// Recorded and trusted.
    AutoApprove,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThresholdPolicy {
    pub admin_review: f32,
    pub auto_approve: f32,
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self {
            admin_review: DEFAULT_ADMIN_REVIEW_THRESHOLD,
            auto_approve: DEFAULT_AUTO_APPROVE_THRESHOLD,
        }
    }
}

impl ThresholdPolicy {
    /// Resolve configured thresholds. Missing or non-finite values take the
    /// defaults, values are clamped to [0, 1], and auto-approve never sits
    /// below admin-review.
    pub fn resolve(admin_review: Option<f32>, auto_approve: Option<f32>) -> Self {
        let pick = |v: Option<f32>, default: f32| {
            v.filter(|v| v.is_finite()).unwrap_or(default).clamp(0.0, 1.0)
        };
        let admin_review = pick(admin_review, DEFAULT_ADMIN_REVIEW_THRESHOLD);
        let auto_approve = pick(auto_approve, DEFAULT_AUTO_APPROVE_THRESHOLD).max(admin_review);
        Self {
            admin_review,
            auto_approve,
        }
    }

    pub fn verdict(&self, confidence: f32) -> Verdict {
        if confidence < self.admin_review {
            Verdict::Reject
        } else if confidence < self.auto_approve {
            Verdict::Review
        } else {
            Verdict::AutoApprove
        }
    }
}
