//! Shared threshold constants

/// Severity score bands (see `Severity::from_score`)
pub const WARNING_SCORE: f32 = 0.5;
pub const ERROR_SCORE: f32 = 0.75;
pub const CRITICAL_SCORE: f32 = 0.9;

/// Cap applied to the statistical score of a profile with no usable
/// variance history. Sits inside the WARNING band: a brand-new host can
/// warn, never page.
pub const COLD_SCORE_CAP: f32 = 0.6;

/// Vectors scoring at or above this are withheld from baseline updates so
/// an attacker cannot teach the profiler their own traffic.
pub const BASELINE_UPDATE_THRESHOLD: f32 = 0.5;
