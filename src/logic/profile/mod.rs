//! Behavior Profiler - per-host rolling baselines
//!
//! An arena of `NetworkProfile` keyed by host. Reads are immutable
//! snapshots; writes go through `observe` only, which the detection stage
//! calls from a single task. Stale behavior ages out through the EWMA decay
//! rather than explicit expiry.

pub mod types;

use std::collections::HashMap;
use std::net::IpAddr;
use chrono::Utc;
use parking_lot::RwLock;

use crate::logic::features::{FlowFeatures, FEATURE_COUNT};
pub use types::NetworkProfile;

// ============================================================================
// PROFILER
// ============================================================================

pub struct BehaviorProfiler {
    profiles: RwLock<HashMap<IpAddr, NetworkProfile>>,
    /// EWMA decay factor; 0.05 gives a half-life of ~14 samples, which at
    /// one vector every few seconds ages behavior out over hours
    alpha: f32,
    min_samples: u64,
    max_hosts: usize,
}

impl BehaviorProfiler {
    pub fn new(alpha: f32, min_samples: u64, max_hosts: usize) -> Self {
        Self {
            profiles: RwLock::new(HashMap::new()),
            alpha: alpha.clamp(0.001, 1.0),
            min_samples,
            max_hosts: max_hosts.max(1),
        }
    }

    /// Fold a feature vector into the source host's baseline.
    /// EWMA mean with the matching Welford-style variance update:
    /// var = (1-a)*var + a*(x - mean_old)*(x - mean_new).
    pub fn observe(&self, features: &FlowFeatures) {
        if features.vector.validate().is_err() {
            log::warn!("Profiler rejected vector with stale feature layout");
            return;
        }

        let mut profiles = self.profiles.write();

        if profiles.len() >= self.max_hosts && !profiles.contains_key(&features.flow.src_ip) {
            // Bounded arena: drop the longest-untouched host
            if let Some(oldest) = profiles
                .values()
                .min_by_key(|p| p.last_updated)
                .map(|p| p.host)
            {
                profiles.remove(&oldest);
            }
        }

        let profile = profiles
            .entry(features.flow.src_ip)
            .or_insert_with(|| NetworkProfile::new(features.flow.src_ip));

        let alpha = self.alpha;
        for i in 0..FEATURE_COUNT {
            let x = features.vector.values[i];
            let diff = x - profile.mean[i];
            let new_mean = profile.mean[i] + alpha * diff;
            let diff_new = x - new_mean;
            profile.mean[i] = new_mean;
            profile.variance[i] = (1.0 - alpha) * profile.variance[i] + alpha * diff * diff_new;
        }

        profile.samples += 1;
        profile.last_updated = Utc::now();
    }

    /// Immutable copy for detection. Unknown hosts get a fresh zero-sample
    /// profile so the cold-path handling is uniform.
    pub fn snapshot(&self, host: IpAddr) -> NetworkProfile {
        self.profiles
            .read()
            .get(&host)
            .cloned()
            .unwrap_or_else(|| NetworkProfile::new(host))
    }

    pub fn is_cold(&self, profile: &NetworkProfile) -> bool {
        profile.is_cold(self.min_samples)
    }

    pub fn min_samples(&self) -> u64 {
        self.min_samples
    }

    pub fn host_count(&self) -> usize {
        self.profiles.read().len()
    }
}

// ============================================================================
// TESTS
// ============================================================================
