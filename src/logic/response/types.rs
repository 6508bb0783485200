//! Response Types
//!
//! Data structures for the action engine. No execution logic here.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// ACTION KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    /// Drop all traffic from the target (firewall rule)
    FirewallBlock,
    /// Cap the target's bandwidth (traffic shaping)
    TrafficShape,
    /// Move the target to the quarantine VLAN
    QuarantineVlan,
    /// Reset the target's established connections
    ConnectionReset,
    /// Log and alert only, no enforcement
    NotifyOnly,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::FirewallBlock => "firewall_block",
            ActionKind::TrafficShape => "traffic_shape",
            ActionKind::QuarantineVlan => "quarantine_vlan",
            ActionKind::ConnectionReset => "connection_reset",
            ActionKind::NotifyOnly => "notify_only",
        }
    }

    pub const ALL: &'static [ActionKind] = &[
        ActionKind::FirewallBlock,
        ActionKind::TrafficShape,
        ActionKind::QuarantineVlan,
        ActionKind::ConnectionReset,
        ActionKind::NotifyOnly,
    ];

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == s)
    }

    /// Whether the inverse operation exists (connection reset and pure
    /// notification have nothing to undo)
    pub fn is_reversible(&self) -> bool {
        matches!(
            self,
            ActionKind::FirewallBlock | ActionKind::TrafficShape | ActionKind::QuarantineVlan
        )
    }
}

// ============================================================================
// TARGET
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionTarget {
    pub ip: IpAddr,
    pub port: Option<u16>,
}

impl std::fmt::Display for ActionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.port {
            Some(p) => write!(f, "{}:{}", self.ip, p),
            None => write!(f, "{}", self.ip),
        }
    }
}

// ============================================================================
// ACTION REQUEST
// ============================================================================

/// Created by the orchestrator, consumed exactly once by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    pub incident_id: Uuid,
    pub kind: ActionKind,
    pub target: ActionTarget,
    #[serde(default)]
    pub params: HashMap<String, String>,
    /// How long the enforcement stays up before automatic rollback
    pub duration: Option<Duration>,
    pub dry_run: bool,
}

// ============================================================================
// ACTION RECORD
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionStatus {
    Queued,
    Executing,
    Completed,
    Failed,
    RolledBack,
    /// Queued at shutdown and never dispatched
    Abandoned,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Queued => "queued",
            ActionStatus::Executing => "executing",
            ActionStatus::Completed => "completed",
            ActionStatus::Failed => "failed",
            ActionStatus::RolledBack => "rolled_back",
            ActionStatus::Abandoned => "abandoned",
        }
    }
}

/// Audit record owned by the engine. Guarantees exactly-once rollback for
/// any record with a finite duration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: Uuid,
    pub request: ActionRequest,
    pub status: ActionStatus,
    /// True only when a backend actually applied the action (dry-run stays false)
    pub executed: bool,
    pub attempts: u32,
    pub queued_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub rolled_back: bool,
    pub detail: Option<String>,
}

impl ActionRecord {
    pub fn new(request: ActionRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            status: ActionStatus::Queued,
            executed: false,
            attempts: 0,
            queued_at: Utc::now(),
            executed_at: None,
            expires_at: None,
            rolled_back: false,
            detail: None,
        }
    }
}

// ============================================================================
// OUTCOME REPORTING
// ============================================================================

/// What the engine reports back to the orchestrator about one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub incident_id: Uuid,
    pub record_id: Uuid,
    pub kind: ActionKind,
    pub result: OutcomeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeKind {
    Applied,
    /// Retries exhausted; the incident needs manual attention
    Degraded,
    RolledBack,
    Abandoned,
}

// ============================================================================
// ERROR HANDLING
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ActionError {
    /// Typed rejection: concurrency cap, sliding-window cap, or a duplicate
    /// of an already-active action. The caller treats this as "action not
    /// applied" - it does not retry the same request automatically.
    RateLimited { reason: String },
    /// Backend call failed after bounded retries
    Backend { backend: String, message: String },
    /// No backend registered for the requested kind
    UnknownKind { kind: String },
    /// Engine is shutting down, request not accepted
    ShuttingDown,
}

impl std::fmt::Display for ActionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionError::RateLimited { reason } => write!(f, "rate limited: {}", reason),
            ActionError::Backend { backend, message } => {
                write!(f, "backend '{}' failed: {}", backend, message)
            }
            ActionError::UnknownKind { kind } => write!(f, "no backend for action '{}'", kind),
            ActionError::ShuttingDown => write!(f, "action engine is shutting down"),
        }
    }
}

impl std::error::Error for ActionError {}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_kind_round_trip() {
        for kind in ActionKind::ALL {
            assert_eq!(ActionKind::from_str(kind.as_str()), Some(*kind));
        }
        assert_eq!(ActionKind::from_str("bogus"), None);
    }

    #[test]
    fn test_reversibility() {
        assert!(ActionKind::FirewallBlock.is_reversible());
        assert!(!ActionKind::NotifyOnly.is_reversible());
        assert!(!ActionKind::ConnectionReset.is_reversible());
    }

    #[test]
    fn test_target_display() {
        let t = ActionTarget { ip: "10.0.0.1".parse().unwrap(), port: Some(22) };
        assert_eq!(t.to_string(), "10.0.0.1:22");
        let t = ActionTarget { ip: "10.0.0.1".parse().unwrap(), port: None };
        assert_eq!(t.to_string(), "10.0.0.1");
    }
}
