//! Behavioral Scorer - per-host density clustering
//!
//! Keeps a short memory of each host's recent vectors and asks whether the
//! new one lands inside the crowd. Vectors with too few neighbors inside
//! the normalized radius are "noise" points; the score is weighted by how
//! dense the host's history actually is, so sparse histories cannot shout.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use parking_lot::Mutex;

use crate::logic::features::{FeatureVector, FEATURE_COUNT};

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone)]
pub struct BehavioralConfig {
    /// Vectors remembered per host
    pub history: usize,
    /// Neighbor radius in normalized feature space
    pub eps: f32,
    /// Neighbors required to count as inside a cluster
    pub min_neighbors: usize,
    /// History size below which the scorer abstains
    pub min_history: usize,
}

impl Default for BehavioralConfig {
    fn default() -> Self {
        Self {
            history: 64,
            eps: 0.25,
            min_neighbors: 4,
            min_history: 8,
        }
    }
}

// ============================================================================
// SCORER
// ============================================================================

pub struct BehavioralScorer {
    cfg: BehavioralConfig,
    hosts: Mutex<HashMap<IpAddr, VecDeque<[f32; FEATURE_COUNT]>>>,
    max_hosts: usize,
}

impl BehavioralScorer {
    pub fn new(cfg: BehavioralConfig, max_hosts: usize) -> Self {
        Self {
            cfg,
            hosts: Mutex::new(HashMap::new()),
            max_hosts: max_hosts.max(1),
        }
    }

    /// Score then remember the vector. `None` while the host's history is
    /// too thin to judge.
    pub fn score_and_remember(&self, host: IpAddr, vector: &FeatureVector) -> Option<f32> {
        let mut hosts = self.hosts.lock();

        if hosts.len() >= self.max_hosts && !hosts.contains_key(&host) {
            // Drop an arbitrary cold entry rather than growing unbounded
            if let Some(k) = hosts.keys().next().copied() {
                hosts.remove(&k);
            }
        }

        let history = hosts.entry(host).or_default();

        let score = if history.len() >= self.cfg.min_history {
            Some(self.noise_score(history, &vector.values))
        } else {
            None
        };

        if history.len() >= self.cfg.history {
            history.pop_front();
        }
        history.push_back(vector.values);

        score
    }

    fn noise_score(&self, history: &VecDeque<[f32; FEATURE_COUNT]>, values: &[f32; FEATURE_COUNT]) -> f32 {
        // Per-feature scale from the history so distance is unit-free
        let mut scale = [1.0f32; FEATURE_COUNT];
        for i in 0..FEATURE_COUNT {
            let mut min = f32::INFINITY;
            let mut max = f32::NEG_INFINITY;
            for row in history {
                min = min.min(row[i]);
                max = max.max(row[i]);
            }
            scale[i] = (max - min).max(1e-6);
        }

        let mut neighbors = 0usize;
        for row in history {
            let mut dist_sq = 0.0f32;
            for i in 0..FEATURE_COUNT {
                let d = (values[i] - row[i]) / scale[i];
                dist_sq += d * d;
            }
            if dist_sq.sqrt() / (FEATURE_COUNT as f32).sqrt() <= self.cfg.eps {
                neighbors += 1;
            }
        }

        if neighbors >= self.cfg.min_neighbors {
            return 0.0;
        }

        // Noise point: weight by cluster density - a host whose history is
        // tightly clustered makes an outsider more meaningful
        let density = (history.len() as f32 / self.cfg.history as f32).min(1.0);
        let isolation = 1.0 - neighbors as f32 / self.cfg.min_neighbors as f32;
        (isolation * (0.5 + 0.5 * density)).clamp(0.0, 1.0)
    }

    pub fn host_count(&self) -> usize {
        self.hosts.lock().len()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(a: f32, b: f32) -> FeatureVector {
        let mut values = [0.0; FEATURE_COUNT];
        values[0] = a;
        values[1] = b;
        FeatureVector::from_values(values)
    }

    #[test]
    fn test_abstains_on_thin_history() {
        let scorer = BehavioralScorer::new(BehavioralConfig::default(), 128);
        let host: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(scorer.score_and_remember(host, &vector(1.0, 1.0)).is_none());
    }

    #[test]
    fn test_cluster_member_scores_zero() {
        let scorer = BehavioralScorer::new(BehavioralConfig::default(), 128);
        let host: IpAddr = "10.0.0.2".parse().unwrap();

        for i in 0..32 {
            scorer.score_and_remember(host, &vector(10.0 + (i % 3) as f32 * 0.1, 5.0));
        }
        let score = scorer.score_and_remember(host, &vector(10.1, 5.0)).unwrap();
        assert_eq!(score, 0.0);
    }

    #[test]
    fn test_noise_point_scores_high() {
        let scorer = BehavioralScorer::new(BehavioralConfig::default(), 128);
        let host: IpAddr = "10.0.0.3".parse().unwrap();

        for i in 0..32 {
            scorer.score_and_remember(host, &vector(10.0 + (i % 3) as f32 * 0.1, 5.0));
        }
        let score = scorer.score_and_remember(host, &vector(900.0, 900.0)).unwrap();
        assert!(score > 0.5, "noise point should score high, got {}", score);
    }
}
