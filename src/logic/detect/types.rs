//! Detection Types
//!
//! Data structures only - scoring logic lives in the sibling modules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::logic::capture::FlowRef;

// ============================================================================
// SCORE METHOD
// ============================================================================

/// Which scorer carried the fused result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScoreMethod {
    Statistical,
    Learned,
    Behavioral,
}

impl ScoreMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreMethod::Statistical => "statistical",
            ScoreMethod::Learned => "learned",
            ScoreMethod::Behavioral => "behavioral",
        }
    }
}

// ============================================================================
// ATTACK TYPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttackType {
    PortScan,
    BruteForce,
    Ddos,
    DnsTunneling,
    Exfiltration,
    Unknown,
}

impl AttackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttackType::PortScan => "port_scan",
            AttackType::BruteForce => "brute_force",
            AttackType::Ddos => "ddos",
            AttackType::DnsTunneling => "dns_tunneling",
            AttackType::Exfiltration => "data_exfiltration",
            AttackType::Unknown => "unknown",
        }
    }

    pub const ALL: &'static [AttackType] = &[
        AttackType::PortScan,
        AttackType::BruteForce,
        AttackType::Ddos,
        AttackType::DnsTunneling,
        AttackType::Exfiltration,
        AttackType::Unknown,
    ];

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|a| a.as_str() == s)
    }
}

impl std::fmt::Display for AttackType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// ANOMALY SCORE
// ============================================================================

/// Fused evaluation result. Produced fresh per evaluation, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyScore {
    /// Fused anomaly measure in [0,1]
    pub score: f32,
    /// Fraction of scorers agreeing the flow is unusual, in [0,1]
    pub confidence: f32,
    pub method: ScoreMethod,
    pub attack_type: AttackType,
    pub explanation: String,
    /// Feature names that tripped the statistical scorer
    pub triggered: Vec<String>,
    pub flow: FlowRef,
    pub observed_at: DateTime<Utc>,
}

/// Output of one individual scorer before fusion
#[derive(Debug, Clone)]
pub struct MethodScore {
    pub method: ScoreMethod,
    pub score: f32,
    pub detail: String,
}
