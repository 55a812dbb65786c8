//! Nearest-neighbour matching of a live embedding against the enrolled gallery.

use crate::types::{EncodingRecord, Embedding};

/// Default maximum Euclidean distance accepted as a match. Lower is stricter.
pub const DEFAULT_TOLERANCE: f32 = 0.55;

/// Result of matching a probe embedding against the gallery.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Match { identity: String, distance: f32 },
    /// Nobody within tolerance. `nearest` is the closest distance seen, if any
    /// record was comparable at all.
    NoMatch { nearest: Option<f32> },
}

impl MatchOutcome {
    pub fn identity(&self) -> Option<&str> {
        match self {
            MatchOutcome::Match { identity, .. } => Some(identity),
            MatchOutcome::NoMatch { .. } => None,
        }
    }
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn find(&self, probe: &Embedding, gallery: &[EncodingRecord], tolerance: f32) -> MatchOutcome;
}

/// Threshold filter followed by arg-min over Euclidean distance.
///
/// Every gallery record is compared, not only the claimed identity's, so a
/// bystander can be told apart from the account owner. When several records
/// fall inside the tolerance the closest one wins, regardless of the order
/// they were enrolled in.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn find(&self, probe: &Embedding, gallery: &[EncodingRecord], tolerance: f32) -> MatchOutcome {
        let mut nearest: Option<f32> = None;
        let mut best: Option<(usize, f32)> = None;

        for (i, record) in gallery.iter().enumerate() {
            let Some(distance) = probe.euclidean_distance(&record.embedding) else {
                tracing::debug!(
                    identity = %record.identity,
                    expected = probe.dim(),
                    actual = record.embedding.dim(),
                    "skipping record with mismatched embedding dimension"
                );
                continue;
            };
            if distance.is_nan() {
                continue;
            }

            if nearest.map_or(true, |n| distance < n) {
                nearest = Some(distance);
            }
            if distance <= tolerance && best.map_or(true, |(_, d)| distance < d) {
                best = Some((i, distance));
            }
        }

        match best {
            Some((idx, distance)) => MatchOutcome::Match {
                identity: gallery[idx].identity.clone(),
                distance,
            },
            None => MatchOutcome::NoMatch { nearest },
        }
    }
}
