//! Incident Types

use std::net::IpAddr;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{CRITICAL_SCORE, ERROR_SCORE, WARNING_SCORE};
use crate::logic::detect::{AnomalyScore, AttackType};

// ============================================================================
// SEVERITY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn from_score(score: f32) -> Self {
        if score >= CRITICAL_SCORE {
            Severity::Critical
        } else if score >= ERROR_SCORE {
            Severity::Error
        } else if score >= WARNING_SCORE {
            Severity::Warning
        } else {
            Severity::Info
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }

    pub const ALL: &'static [Severity] = &[
        Severity::Info,
        Severity::Warning,
        Severity::Error,
        Severity::Critical,
    ];

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|v| v.as_str() == s)
    }

    pub fn level(&self) -> u8 {
        match self {
            Severity::Info => 0,
            Severity::Warning => 1,
            Severity::Error => 2,
            Severity::Critical => 3,
        }
    }

    fn from_level(level: u8) -> Self {
        match level {
            0 => Severity::Info,
            1 => Severity::Warning,
            2 => Severity::Error,
            _ => Severity::Critical,
        }
    }

    pub fn bumped(&self, levels: u8) -> Self {
        Self::from_level((self.level() + levels).min(3))
    }
}

// ============================================================================
// STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncidentState {
    New,
    Open,
    Escalated,
    Actioned,
    /// An action exhausted its retries; needs manual attention
    ActionedDegraded,
    Resolved,
    Expired,
}

impl IncidentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentState::New => "new",
            IncidentState::Open => "open",
            IncidentState::Escalated => "escalated",
            IncidentState::Actioned => "actioned",
            IncidentState::ActionedDegraded => "actioned_degraded",
            IncidentState::Resolved => "resolved",
            IncidentState::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, IncidentState::Resolved | IncidentState::Expired)
    }

    /// States in which new matching anomalies merge into this incident
    pub fn accepts_scores(&self) -> bool {
        !self.is_terminal()
    }
}

// ============================================================================
// INCIDENT
// ============================================================================

/// Created and mutated only by the orchestrator task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub source: IpAddr,
    pub target: IpAddr,
    pub attack_type: AttackType,
    pub severity: Severity,
    pub state: IncidentState,
    pub opened_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub scores: Vec<AnomalyScore>,
    pub action_ids: Vec<Uuid>,
}

impl Incident {
    pub fn new(score: AnomalyScore) -> Self {
        let severity = Severity::from_score(score.score);
        Self {
            id: Uuid::new_v4(),
            source: score.flow.src_ip,
            target: score.flow.dst_ip,
            attack_type: score.attack_type,
            severity,
            state: IncidentState::New,
            opened_at: score.observed_at,
            last_seen: score.observed_at,
            scores: vec![score],
            action_ids: Vec::new(),
        }
    }

    /// Merge a corroborating score. Severity is recomputed from the highest
    /// contributing score plus a bump per extra corroboration - and never
    /// decreases while the incident is open. Returns true when severity
    /// escalated.
    pub fn absorb(&mut self, score: AnomalyScore) -> bool {
        if score.observed_at > self.last_seen {
            self.last_seen = score.observed_at;
        }
        self.scores.push(score);

        let computed = self.computed_severity();
        if computed > self.severity {
            self.severity = computed;
            true
        } else {
            false
        }
    }

    fn computed_severity(&self) -> Severity {
        let peak = self
            .scores
            .iter()
            .map(|s| s.score)
            .fold(0.0f32, f32::max);
        let corroborating = self.scores.len().saturating_sub(1);
        Severity::from_score(peak).bumped((corroborating / 3) as u8)
    }

    pub fn describe(&self) -> String {
        format!(
            "{} from {} against {} ({} scores, severity {})",
            self.attack_type.as_str(),
            self.source,
            self.target,
            self.scores.len(),
            self.severity.as_str()
        )
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::capture::FlowRef;
    use crate::logic::detect::ScoreMethod;

    fn score(value: f32) -> AnomalyScore {
        AnomalyScore {
            score: value,
            confidence: 0.9,
            method: ScoreMethod::Statistical,
            attack_type: AttackType::PortScan,
            explanation: String::new(),
            triggered: vec![],
            flow: FlowRef::default(),
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_severity_banding() {
        assert_eq!(Severity::from_score(0.2), Severity::Info);
        assert_eq!(Severity::from_score(0.5), Severity::Warning);
        assert_eq!(Severity::from_score(0.8), Severity::Error);
        assert_eq!(Severity::from_score(0.95), Severity::Critical);
    }

    #[test]
    fn test_severity_is_monotonic() {
        let mut incident = Incident::new(score(0.8));
        assert_eq!(incident.severity, Severity::Error);

        // A weaker score must never downgrade
        incident.absorb(score(0.2));
        assert_eq!(incident.severity, Severity::Error);

        let escalated = incident.absorb(score(0.95));
        assert!(escalated);
        assert_eq!(incident.severity, Severity::Critical);
    }

    #[test]
    fn test_corroboration_bump() {
        let mut incident = Incident::new(score(0.55));
        assert_eq!(incident.severity, Severity::Warning);

        // Three extra corroborating scores bump one level
        incident.absorb(score(0.55));
        incident.absorb(score(0.55));
        let escalated = incident.absorb(score(0.55));
        assert!(escalated);
        assert_eq!(incident.severity, Severity::Error);
    }

    #[test]
    fn test_bump_caps_at_critical() {
        let mut incident = Incident::new(score(0.95));
        for _ in 0..20 {
            incident.absorb(score(0.95));
        }
        assert_eq!(incident.severity, Severity::Critical);
    }
}
