//! Nearest-neighbour matching of a probe vector against a cache snapshot.

use crate::cache::CacheSnapshot;
use crate::types::MatchResult;
use crate::vector::FeatureVector;

/// Default Euclidean distance below which a probe counts as a match.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Strategy for comparing a probe against the enrolled faces in a snapshot.
///
/// Implementations must be pure and deterministic for a given snapshot and probe.
pub trait Matcher {
    fn compare(&self, probe: &FeatureVector, snapshot: &CacheSnapshot, threshold: f32) -> MatchResult;
}

/// Linear-scan Euclidean matcher.
///
/// Rosters are class-sized, so a full scan per probe is cheap. Ties go to
/// the earliest vector in snapshot order.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &FeatureVector, snapshot: &CacheSnapshot, threshold: f32) -> MatchResult {
        let mut best_distance = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, (_, vector)) in snapshot.iter().enumerate() {
            let distance = probe.euclidean_distance(vector);
            if distance < best_distance {
                best_distance = distance;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_distance < threshold => MatchResult {
                matched: true,
                identity_id: Some(snapshot.label(idx).to_string()),
                confidence: distance_to_confidence(best_distance),
                distance: Some(best_distance),
            },
            Some(_) => MatchResult::unmatched(Some(best_distance)),
            None => MatchResult::unmatched(None),
        }
    }
}

/// `(1 - distance) * 100`, clamped to [0, 100] and rounded to two decimals.
pub fn distance_to_confidence(distance: f32) -> f32 {
    let pct = ((1.0 - distance) * 100.0).clamp(0.0, 100.0);
    (pct * 100.0).round() / 100.0
}
