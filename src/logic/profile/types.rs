//! Behavior Profile Types

use std::net::IpAddr;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::logic::features::{layout_hash, FEATURE_COUNT, FEATURE_VERSION};

// ============================================================================
// NETWORK PROFILE
// ============================================================================

/// Rolling per-host baseline. Owned and mutated only by the profiler;
/// detection receives cloned snapshots, never live references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkProfile {
    pub host: IpAddr,
    pub feature_version: u8,
    pub layout_hash: u32,
    pub samples: u64,

    // EWMA statistics in feature-layout order
    pub mean: [f32; FEATURE_COUNT],
    pub variance: [f32; FEATURE_COUNT],

    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl NetworkProfile {
    pub fn new(host: IpAddr) -> Self {
        let now = Utc::now();
        Self {
            host,
            feature_version: FEATURE_VERSION,
            layout_hash: layout_hash(),
            samples: 0,
            mean: [0.0; FEATURE_COUNT],
            variance: [0.0; FEATURE_COUNT],
            created_at: now,
            last_updated: now,
        }
    }

    /// Too few observations to be statistically trustworthy; detection
    /// treats deviations from a cold profile as low-confidence.
    pub fn is_cold(&self, min_samples: u64) -> bool {
        self.samples < min_samples
    }

    pub fn std(&self, index: usize) -> f32 {
        self.variance.get(index).map(|v| v.max(0.0).sqrt()).unwrap_or(0.0)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_profile_is_cold() {
        let p = NetworkProfile::new("10.0.0.1".parse().unwrap());
        assert!(p.is_cold(30));
        assert_eq!(p.samples, 0);
        assert_eq!(p.layout_hash, layout_hash());
    }
}
