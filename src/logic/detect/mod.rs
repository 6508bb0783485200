//! Anomaly Detection Engine
//!
//! Three independent scorers fused per evaluation:
//! - statistical: z-scores against the host baseline
//! - learned: isolation forest over the network-wide rolling window
//! - behavioral: per-host density clustering
//!
//! Fusion takes the MAX of the weighted scores, not an average: one strong
//! signal must be able to raise an incident even when the other scorers are
//! inconclusive. Confidence is the fraction of scorers that agreed.

pub mod types;
pub mod statistical;
pub mod learned;
pub mod behavioral;
pub mod classify;

use std::sync::Arc;
use chrono::Utc;

use crate::logic::features::FlowFeatures;
use crate::logic::profile::NetworkProfile;

pub use behavioral::{BehavioralConfig, BehavioralScorer};
pub use learned::{LearnedConfig, LearnedEngine, LearnedStatus, ModelTrainingError};
pub use types::{AnomalyScore, AttackType, MethodScore, ScoreMethod};

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub z_threshold: f32,
    pub statistical_weight: f32,
    pub learned_weight: f32,
    pub behavioral_weight: f32,
    /// A scorer "agrees" when its raw score clears this bar
    pub agreement_threshold: f32,
    /// Confidence subtracted when the host profile is cold
    pub cold_penalty: f32,
    pub profile_min_samples: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            z_threshold: 3.0,
            statistical_weight: 1.0,
            learned_weight: 0.9,
            behavioral_weight: 0.8,
            agreement_threshold: 0.3,
            cold_penalty: 0.2,
            profile_min_samples: 30,
        }
    }
}

// ============================================================================
// DETECTOR
// ============================================================================

pub struct AnomalyDetector {
    cfg: DetectorConfig,
    learned: Arc<LearnedEngine>,
    behavioral: BehavioralScorer,
}

impl AnomalyDetector {
    pub fn new(cfg: DetectorConfig, learned: Arc<LearnedEngine>, behavioral: BehavioralScorer) -> Self {
        Self { cfg, learned, behavioral }
    }

    /// Evaluate one feature vector against the host's profile snapshot.
    pub fn evaluate(&self, features: &FlowFeatures, profile: &NetworkProfile) -> AnomalyScore {
        let cold = profile.is_cold(self.cfg.profile_min_samples);

        // Statistical: z-scores against the baseline, plus the fixed
        // attack signatures that need no baseline at all
        let stat = statistical::score(
            &features.vector,
            profile,
            self.cfg.z_threshold,
            self.cfg.profile_min_samples,
        );
        let sig = classify::signature(&features.flow, &features.vector);

        // Learned: feed the rolling window, then ask the active model
        self.learned.push(&features.vector);
        let learned_raw = self.learned.score(&features.vector);

        // Behavioral: abstains on thin history
        let behavioral_raw = self
            .behavioral
            .score_and_remember(features.flow.src_ip, &features.vector);

        let stat_raw = match &sig {
            Some(sig) => stat.score.max(sig.score),
            None => stat.score,
        };
        let stat_detail = match &sig {
            Some(sig) => sig.reason.clone(),
            None => format!("max |z| {:.1}", stat.max_z),
        };

        let mut candidates: Vec<MethodScore> = vec![MethodScore {
            method: ScoreMethod::Statistical,
            score: stat_raw * self.cfg.statistical_weight,
            detail: stat_detail,
        }];
        let mut raw_scores: Vec<f32> = vec![stat_raw];

        if let Some(s) = learned_raw {
            candidates.push(MethodScore {
                method: ScoreMethod::Learned,
                score: s * self.cfg.learned_weight,
                detail: format!("isolation {:.2}", s),
            });
            raw_scores.push(s);
        }
        if let Some(s) = behavioral_raw {
            candidates.push(MethodScore {
                method: ScoreMethod::Behavioral,
                score: s * self.cfg.behavioral_weight,
                detail: format!("noise {:.2}", s),
            });
            raw_scores.push(s);
        }

        // Max fusion: any single strong signal carries
        let best = candidates
            .iter()
            .max_by(|a, b| a.score.total_cmp(&b.score))
            .cloned()
            .unwrap_or(MethodScore {
                method: ScoreMethod::Statistical,
                score: 0.0,
                detail: String::new(),
            });
        let fused = best.score.clamp(0.0, 1.0);

        let agreeing = raw_scores
            .iter()
            .filter(|&&s| s >= self.cfg.agreement_threshold)
            .count();
        let mut confidence = agreeing as f32 / raw_scores.len() as f32;
        if cold {
            confidence = (confidence - self.cfg.cold_penalty).max(0.0);
        }

        let attack_type = match &sig {
            Some(sig) => sig.attack,
            None => classify::classify(&features.flow, &features.vector, &stat.triggered),
        };

        let explanation = if stat.triggered.is_empty() {
            format!("{} {}", best.method.as_str(), best.detail)
        } else {
            format!(
                "{} {}; triggered: {}",
                best.method.as_str(),
                best.detail,
                stat.triggered.join(", ")
            )
        };

        AnomalyScore {
            score: fused,
            confidence,
            method: best.method,
            attack_type,
            explanation,
            triggered: stat.triggered,
            flow: features.flow,
            observed_at: Utc::now(),
        }
    }

    pub fn learned_status(&self) -> LearnedStatus {
        self.learned.status()
    }
}

// ============================================================================
// TESTS
// ============================================================================
