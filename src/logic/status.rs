//! Reporting Surface - `get_status()` and `export(since)`
//!
//! Aggregates counters from every stage into one serializable snapshot for
//! dashboards and CLIs. Nothing here touches the hot path beyond relaxed
//! atomic loads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::detect::LearnedStatus;
use super::incident::OrchestratorView;
use super::response::EngineStatusSnapshot;
use super::storage::{EventStore, RecordKind};

// ============================================================================
// PIPELINE METRICS
// ============================================================================

/// Stage counters shared across tasks.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub packets_seen: AtomicU64,
    pub malformed_dropped: AtomicU64,
    pub vectors_emitted: AtomicU64,
    pub scores_emitted: AtomicU64,
    pub tracked_flows: AtomicU64,
    pub profiled_hosts: AtomicU64,
}

impl PipelineMetrics {
    pub fn get(field: &AtomicU64) -> u64 {
        field.load(Ordering::Relaxed)
    }
}

// ============================================================================
// STATUS SNAPSHOT
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct QueueDepths {
    pub features: u64,
    pub scores: u64,
    pub notify_dropped: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub active_incidents: usize,
    pub incidents_by_severity: HashMap<String, u64>,
    pub blocked_targets: Vec<String>,
    pub queue_depths: QueueDepths,

    pub packets_seen: u64,
    pub malformed_dropped: u64,
    pub vectors_emitted: u64,
    pub anomalies_seen: u64,
    pub incidents_total: u64,
    pub actions_requested: u64,
    pub actions_rejected: u64,
    pub actions_active: usize,
    pub actions_rolled_back: usize,

    /// Subsystem health for operator visibility
    pub learned_model: LearnedStatus,
    pub degraded: bool,
}

pub fn collect(
    metrics: &PipelineMetrics,
    view: &OrchestratorView,
    engine: &EngineStatusSnapshot,
    learned: LearnedStatus,
    blocked_targets: Vec<String>,
    queue_depths: QueueDepths,
) -> EngineStatus {
    let degraded = learned.degraded;
    EngineStatus {
        active_incidents: view.active_incidents,
        incidents_by_severity: view.incidents_by_severity.clone(),
        blocked_targets,
        queue_depths,

        packets_seen: PipelineMetrics::get(&metrics.packets_seen),
        malformed_dropped: PipelineMetrics::get(&metrics.malformed_dropped),
        vectors_emitted: PipelineMetrics::get(&metrics.vectors_emitted),
        anomalies_seen: view.anomalies_seen,
        incidents_total: view.incidents_total,
        actions_requested: view.actions_requested,
        actions_rejected: view.actions_rejected,
        actions_active: engine.active_actions,
        actions_rolled_back: engine.rolled_back_total,

        learned_model: learned,
        degraded,
    }
}

// ============================================================================
// EXPORT
// ============================================================================

/// Structured log for external dashboards: every incident transition and
/// action snapshot recorded at or after `since`.
pub fn export(store: &EventStore, since: DateTime<Utc>) -> serde_json::Value {
    let incidents = store
        .load_recent(RecordKind::Incident, since)
        .unwrap_or_else(|e| {
            log::warn!("Export failed reading incidents: {}", e);
            Vec::new()
        });
    let actions = store
        .load_recent(RecordKind::Action, since)
        .unwrap_or_else(|e| {
            log::warn!("Export failed reading actions: {}", e);
            Vec::new()
        });

    serde_json::json!({
        "exported_at": Utc::now().to_rfc3339(),
        "since": since.to_rfc3339(),
        "incident_count": incidents.len(),
        "action_count": actions.len(),
        "incidents": incidents,
        "actions": actions,
    })
}

// ============================================================================
// TESTS
// ============================================================================
