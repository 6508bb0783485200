//! Statistical Scorer - z-score deviation against the host baseline
//!
//! Each feature is compared to the profile's EWMA mean/variance; any
//! feature whose |z| exceeds the threshold is recorded as a trigger. The
//! trigger names later drive attack-type classification.

use crate::logic::features::{FeatureVector, FEATURE_LAYOUT};
use crate::logic::profile::NetworkProfile;
use crate::constants::COLD_SCORE_CAP;

/// A baseline younger than this has no judgeable statistics at all
const MIN_BASELINE_SAMPLES: u64 = 10;

// ============================================================================
// RESULT
// ============================================================================

#[derive(Debug, Clone)]
pub struct StatResult {
    /// Normalized score in [0,1]
    pub score: f32,
    /// Largest absolute z-score observed
    pub max_z: f32,
    /// Names of features past the z threshold
    pub triggered: Vec<String>,
}

impl StatResult {
    fn silent() -> Self {
        Self { score: 0.0, max_z: 0.0, triggered: Vec::new() }
    }
}

// ============================================================================
// SCORING
// ============================================================================

/// Score a vector against a profile.
///
/// A baseline below MIN_BASELINE_SAMPLES (or one with no variance at all)
/// is not judged - the early EWMA estimates would read ordinary traffic as
/// multi-sigma. A cold profile (fewer than `min_samples` observations) is
/// capped inside the WARNING band so a barely-seen host cannot page anyone
/// on z-scores alone; the fixed attack signatures are unaffected.
pub fn score(
    vector: &FeatureVector,
    profile: &NetworkProfile,
    z_threshold: f32,
    min_samples: u64,
) -> StatResult {
    let has_variance = profile.variance.iter().any(|&v| v > f32::EPSILON);
    if profile.samples < MIN_BASELINE_SAMPLES || !has_variance {
        return StatResult::silent();
    }

    let mut triggered = Vec::new();
    let mut max_z = 0.0f32;

    for (i, name) in FEATURE_LAYOUT.iter().enumerate() {
        let std = profile.std(i);
        if std <= f32::EPSILON {
            // Zero-variance feature: deviation is unquantifiable, skip it
            continue;
        }
        let z = (vector.values[i] - profile.mean[i]).abs() / std;
        max_z = max_z.max(z);
        if z >= z_threshold {
            triggered.push((*name).to_string());
        }
    }

    // |z| at the threshold maps to ~0.5, saturating near 2x the threshold
    let mut score = (max_z / (2.0 * z_threshold)).min(1.0);

    if profile.is_cold(min_samples) {
        score = score.min(COLD_SCORE_CAP);
    }

    StatResult { score, max_z, triggered }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::features::{FeatureVector, FEATURE_COUNT};
    use std::net::IpAddr;

    fn warm_profile(mean: f32, std: f32) -> NetworkProfile {
        let host: IpAddr = "10.0.0.1".parse().unwrap();
        let mut p = NetworkProfile::new(host);
        p.samples = 100;
        p.mean = [mean; FEATURE_COUNT];
        p.variance = [std * std; FEATURE_COUNT];
        p
    }

    #[test]
    fn test_in_band_vector_scores_low() {
        let profile = warm_profile(10.0, 2.0);
        // Every feature within 1 sigma
        let v = FeatureVector::from_values([11.0; FEATURE_COUNT]);
        let result = score(&v, &profile, 3.0, 30);
        assert!(result.score < 0.2);
        assert!(result.triggered.is_empty());
    }

    #[test]
    fn test_outlier_triggers_feature() {
        let profile = warm_profile(10.0, 2.0);
        let mut v = FeatureVector::from_values([10.0; FEATURE_COUNT]);
        v.values[0] = 50.0; // z = 20
        let result = score(&v, &profile, 3.0, 30);
        assert!(result.score > 0.9);
        assert_eq!(result.triggered, vec!["pkt_rate".to_string()]);
    }

    #[test]
    fn test_young_baseline_not_judged() {
        let host: IpAddr = "10.0.0.2".parse().unwrap();
        let mut profile = NetworkProfile::new(host);
        profile.samples = 5;
        profile.mean = [1.0; FEATURE_COUNT];
        profile.variance = [0.5; FEATURE_COUNT];
        let v = FeatureVector::from_values([1000.0; FEATURE_COUNT]);
        let result = score(&v, &profile, 3.0, 30);
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn test_zero_variance_profile_scores_zero() {
        let host: IpAddr = "10.0.0.4".parse().unwrap();
        let mut profile = NetworkProfile::new(host);
        profile.samples = 50; // plenty of observations, no variance recorded
        let v = FeatureVector::from_values([1000.0; FEATURE_COUNT]);
        let result = score(&v, &profile, 3.0, 30);
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn test_cold_profile_capped_inside_warning_band() {
        let host: IpAddr = "10.0.0.3".parse().unwrap();
        let mut profile = NetworkProfile::new(host);
        profile.samples = 15; // judgeable, but still cold
        profile.mean = [1.0; FEATURE_COUNT];
        profile.variance = [0.01; FEATURE_COUNT];
        let v = FeatureVector::from_values([10_000.0; FEATURE_COUNT]);
        let result = score(&v, &profile, 3.0, 30);
        assert!(result.score <= COLD_SCORE_CAP);
        assert!(result.max_z > 3.0, "raw z stays visible for the explanation");
    }
}
