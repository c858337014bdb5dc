//! Nearest-neighbour matching of a query descriptor against enrollments.

use crate::types::{Descriptor, Enrollment, MatchCandidate};

/// Distance at which confidence reaches zero. A distance of 0.6, the usual
/// same-person cut-off for 128-d descriptors, maps to confidence 0.5.
pub const ZERO_CONFIDENCE_DISTANCE: f32 = 1.2;

/// Map a Euclidean distance to a confidence in [0, 1].
pub fn confidence_from_distance(distance: f32) -> f32 {
    (1.0 - distance / ZERO_CONFIDENCE_DISTANCE).clamp(0.0, 1.0)
}

/// Strategy for finding the closest enrolled identity to a query.
pub trait Matcher {
    fn find_best_match(&self, query: &Descriptor, enrollments: &[Enrollment])
        -> Option<MatchCandidate>;
}

/// Exhaustive Euclidean matcher.
///
/// Visits every descriptor of every enrollment and keeps the global
/// minimum. Ties keep the first candidate seen.
#[derive(Debug, Default, Clone, Copy)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn find_best_match(
        &self,
        query: &Descriptor,
        enrollments: &[Enrollment],
    ) -> Option<MatchCandidate> {
        let mut best: Option<(usize, f32)> = None;

        for (i, enrollment) in enrollments.iter().enumerate() {
            for stored in &enrollment.embeddings {
                let distance = query.euclidean_distance(stored);
                if best.map_or(true, |(_, d)| distance < d) {
                    best = Some((i, distance));
                }
            }
        }

        best.map(|(i, distance)| {
            let enrollment = &enrollments[i];
            MatchCandidate {
                identity: enrollment.identity.clone(),
                display_name: enrollment.display_name.clone(),
                avatar_url: enrollment.avatar_url.clone(),
                distance,
                confidence: confidence_from_distance(distance),
            }
        })
    }
}
