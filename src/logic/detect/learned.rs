//! Learned Scorer - unsupervised isolation forest with hot swap
//!
//! Trains periodically over a rolling window of recent vectors from the
//! whole network, off the detection hot path. The active model is an `Arc`
//! snapshot published in one assignment: in-flight evaluations either see
//! the previous fully-trained forest or the new one, never a partial state.
//! Training failure puts the engine in degraded mode; detection continues
//! on the statistical and behavioral scorers alone.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use chrono::{DateTime, Utc};
use ndarray::Array2;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;

use crate::logic::features::{FeatureVector, FEATURE_COUNT};

// ============================================================================
// ERROR HANDLING
// ============================================================================

#[derive(Debug)]
pub enum ModelTrainingError {
    NotEnoughData { have: usize, need: usize },
    Failed { reason: String },
}

impl std::fmt::Display for ModelTrainingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelTrainingError::NotEnoughData { have, need } => {
                write!(f, "not enough training data: {} of {} vectors", have, need)
            }
            ModelTrainingError::Failed { reason } => write!(f, "model training failed: {}", reason),
        }
    }
}

impl std::error::Error for ModelTrainingError {}

// ============================================================================
// ISOLATION FOREST
// ============================================================================

#[derive(Debug)]
enum IsoNode {
    Split {
        feature: usize,
        threshold: f32,
        left: Box<IsoNode>,
        right: Box<IsoNode>,
    },
    Leaf {
        size: usize,
    },
}

#[derive(Debug)]
pub struct IsolationForest {
    trees: Vec<IsoNode>,
    subsample: usize,
    pub trained_at: DateTime<Utc>,
    pub trained_on: usize,
}

impl IsolationForest {
    /// Raw isolation score in (0,1): ~0.5 for ordinary points, → 1.0 for
    /// points isolated by short paths.
    pub fn raw_score(&self, values: &[f32; FEATURE_COUNT]) -> f32 {
        if self.trees.is_empty() {
            return 0.5;
        }
        let mean_path: f64 = self
            .trees
            .iter()
            .map(|t| path_length(t, values, 0))
            .sum::<f64>()
            / self.trees.len() as f64;
        let c = average_path_length(self.subsample);
        if c <= 0.0 {
            return 0.5;
        }
        2f64.powf(-mean_path / c) as f32
    }

    /// Score rescaled so the fused [0,1] range means the same thing across
    /// scorers: 0.5 raw (unremarkable) maps to 0, 1.0 raw maps to 1.
    pub fn anomaly_score(&self, values: &[f32; FEATURE_COUNT]) -> f32 {
        ((self.raw_score(values) - 0.5) * 2.0).clamp(0.0, 1.0)
    }
}

fn path_length(node: &IsoNode, values: &[f32; FEATURE_COUNT], depth: usize) -> f64 {
    match node {
        IsoNode::Leaf { size } => depth as f64 + average_path_length(*size),
        IsoNode::Split { feature, threshold, left, right } => {
            if values[*feature] < *threshold {
                path_length(left, values, depth + 1)
            } else {
                path_length(right, values, depth + 1)
            }
        }
    }
}

/// Euler-Mascheroni constant for the harmonic-number approximation
const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// c(n): average unsuccessful-search path length of a BST with n nodes
fn average_path_length(n: usize) -> f64 {
    if n <= 1 {
        return 0.0;
    }
    let n = n as f64;
    2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
}

fn build_tree<R: Rng>(rng: &mut R, data: &Array2<f32>, rows: &[usize], depth: usize, max_depth: usize) -> IsoNode {
    if rows.len() <= 1 || depth >= max_depth {
        return IsoNode::Leaf { size: rows.len() };
    }

    // Random feature with spread, random split inside its range
    let mut candidates: Vec<usize> = (0..FEATURE_COUNT).collect();
    candidates.shuffle(rng);

    for feature in candidates {
        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        for &r in rows {
            let v = data[[r, feature]];
            min = min.min(v);
            max = max.max(v);
        }
        if max - min <= f32::EPSILON {
            continue;
        }

        let threshold = rng.gen_range(min..max);
        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .iter()
            .copied()
            .partition(|&r| data[[r, feature]] < threshold);

        if left_rows.is_empty() || right_rows.is_empty() {
            continue;
        }

        return IsoNode::Split {
            feature,
            threshold,
            left: Box::new(build_tree(rng, data, &left_rows, depth + 1, max_depth)),
            right: Box::new(build_tree(rng, data, &right_rows, depth + 1, max_depth)),
        };
    }

    // Every feature constant across this partition
    IsoNode::Leaf { size: rows.len() }
}

// ============================================================================
// LEARNED ENGINE
// ============================================================================

#[derive(Debug, Clone)]
pub struct LearnedConfig {
    pub trees: usize,
    pub subsample: usize,
    pub window_cap: usize,
    pub min_train: usize,
}

impl Default for LearnedConfig {
    fn default() -> Self {
        Self {
            trees: 50,
            subsample: 256,
            window_cap: 4096,
            min_train: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LearnedStatus {
    pub model_loaded: bool,
    pub degraded: bool,
    pub window_size: usize,
    pub trainings: u64,
    pub failures: u64,
}

pub struct LearnedEngine {
    cfg: LearnedConfig,
    window: Mutex<VecDeque<[f32; FEATURE_COUNT]>>,
    active: RwLock<Option<Arc<IsolationForest>>>,
    degraded: AtomicBool,
    trainings: AtomicU64,
    failures: AtomicU64,
}

impl LearnedEngine {
    pub fn new(cfg: LearnedConfig) -> Self {
        Self {
            cfg,
            window: Mutex::new(VecDeque::new()),
            active: RwLock::new(None),
            degraded: AtomicBool::new(false),
            trainings: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Feed the rolling training window (hot path, cheap)
    pub fn push(&self, vector: &FeatureVector) {
        let mut window = self.window.lock();
        if window.len() >= self.cfg.window_cap {
            window.pop_front();
        }
        window.push_back(vector.values);
    }

    /// Score with the active model; `None` while no model is trained yet or
    /// the engine is degraded.
    pub fn score(&self, vector: &FeatureVector) -> Option<f32> {
        let model = self.active.read().as_ref().cloned()?;
        Some(model.anomaly_score(&vector.values))
    }

    /// Build a new forest from the current window and publish it. Runs
    /// off-path (the pipeline calls this inside `spawn_blocking`).
    pub fn train(&self) -> Result<(), ModelTrainingError> {
        let snapshot: Vec<[f32; FEATURE_COUNT]> =
            self.window.lock().iter().copied().collect();

        if snapshot.len() < self.cfg.min_train {
            return Err(ModelTrainingError::NotEnoughData {
                have: snapshot.len(),
                need: self.cfg.min_train,
            });
        }

        let flat: Vec<f32> = snapshot.iter().flatten().copied().collect();
        let data = Array2::from_shape_vec((snapshot.len(), FEATURE_COUNT), flat)
            .map_err(|e| ModelTrainingError::Failed { reason: e.to_string() })?;

        let mut rng = rand::thread_rng();
        let subsample = self.cfg.subsample.min(snapshot.len());
        let max_depth = (subsample as f64).log2().ceil() as usize;
        let all_rows: Vec<usize> = (0..snapshot.len()).collect();

        let mut trees = Vec::with_capacity(self.cfg.trees);
        for _ in 0..self.cfg.trees {
            let rows: Vec<usize> = all_rows
                .choose_multiple(&mut rng, subsample)
                .copied()
                .collect();
            trees.push(build_tree(&mut rng, &data, &rows, 0, max_depth));
        }

        let forest = IsolationForest {
            trees,
            subsample,
            trained_at: Utc::now(),
            trained_on: snapshot.len(),
        };

        // Single-assignment publish: readers see old or new, never partial
        *self.active.write() = Some(Arc::new(forest));
        self.degraded.store(false, Ordering::Relaxed);
        self.trainings.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "Learned model retrained on {} vectors ({} trees)",
            snapshot.len(),
            self.cfg.trees
        );
        Ok(())
    }

    pub fn mark_degraded(&self) {
        self.degraded.store(true, Ordering::Relaxed);
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> LearnedStatus {
        LearnedStatus {
            model_loaded: self.active.read().is_some(),
            degraded: self.is_degraded(),
            window_size: self.window.lock().len(),
            trainings: self.trainings.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(fill: f32, first: f32) -> FeatureVector {
        let mut values = [fill; FEATURE_COUNT];
        values[0] = first;
        FeatureVector::from_values(values)
    }

    #[test]
    fn test_no_model_scores_none() {
        let engine = LearnedEngine::new(LearnedConfig::default());
        assert!(engine.score(&vector(1.0, 1.0)).is_none());
        assert!(!engine.status().model_loaded);
    }

    #[test]
    fn test_train_requires_data() {
        let engine = LearnedEngine::new(LearnedConfig::default());
        engine.push(&vector(1.0, 1.0));
        assert!(matches!(
            engine.train(),
            Err(ModelTrainingError::NotEnoughData { .. })
        ));
    }

    #[test]
    fn test_outlier_scores_above_inliers() {
        let cfg = LearnedConfig { min_train: 64, ..Default::default() };
        let engine = LearnedEngine::new(cfg);

        // Tight cluster with mild jitter
        for i in 0..256 {
            engine.push(&vector(10.0 + (i % 5) as f32 * 0.1, 10.0 + (i % 7) as f32 * 0.1));
        }
        engine.train().unwrap();

        let inlier = engine.score(&vector(10.2, 10.3)).unwrap();
        let outlier = engine.score(&vector(10.2, 500.0)).unwrap();
        assert!(
            outlier > inlier,
            "outlier {} should exceed inlier {}",
            outlier,
            inlier
        );
        assert!(outlier > 0.2);
    }

    #[test]
    fn test_window_is_bounded() {
        let cfg = LearnedConfig { window_cap: 10, ..Default::default() };
        let engine = LearnedEngine::new(cfg);
        for i in 0..50 {
            engine.push(&vector(i as f32, 0.0));
        }
        assert_eq!(engine.status().window_size, 10);
    }

    #[test]
    fn test_degraded_flag() {
        let engine = LearnedEngine::new(LearnedConfig::default());
        assert!(!engine.is_degraded());
        engine.mark_degraded();
        assert!(engine.is_degraded());
        assert_eq!(engine.status().failures, 1);
    }
}
