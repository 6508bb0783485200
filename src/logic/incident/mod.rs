//! Security Orchestrator - incident lifecycle and response policy
//!
//! Single-writer by construction: one task owns the incident map and the
//! open-incident index, and every anomaly, action outcome, and control
//! command is serialized through its channels. Exactly one open incident
//! exists per (source, attack_type); matching anomalies merge instead of
//! duplicating.
//!
//! State machine: New -> Open -> Escalated -> Actioned -> Resolved, with
//! Expired for incidents that age out and ActionedDegraded when a response
//! action exhausted its retries.

pub mod types;

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::logic::detect::{AnomalyScore, AttackType};
use crate::logic::notify::NotifyHub;
use crate::logic::policy::PolicyTable;
use crate::logic::response::{
    ActionEngine, ActionError, ActionOutcome, ActionRequest, ActionTarget, OutcomeKind,
};
use crate::logic::storage::EventStore;

pub use types::{Incident, IncidentState, Severity};

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Scores below this never open or feed an incident
    pub response_threshold: f32,
    /// Scores below this confidence are logged but not acted on
    pub confidence_threshold: f32,
    /// Quiet period after which an actioned incident auto-resolves
    pub quiet_secs: i64,
    /// Untouched incidents older than this expire (and roll back actions)
    pub max_age_secs: i64,
    /// Duration stamped on reversible response actions
    pub action_duration: Duration,
    pub dry_run: bool,
    pub sweep_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            response_threshold: 0.8,
            confidence_threshold: 0.6,
            quiet_secs: 300,
            max_age_secs: 3600,
            action_duration: Duration::from_secs(300),
            dry_run: false,
            sweep_interval: Duration::from_secs(10),
        }
    }
}

// ============================================================================
// CONTROL & VIEW
// ============================================================================

#[derive(Debug, Clone)]
pub enum OrchestratorCommand {
    /// Manual resolution (operator/CLI surface)
    Resolve(Uuid),
}

/// Read-only snapshot published for `get_status()` and tests.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorView {
    pub active_incidents: usize,
    pub incidents_by_severity: HashMap<String, u64>,
    pub anomalies_seen: u64,
    pub incidents_total: u64,
    pub actions_requested: u64,
    pub actions_rejected: u64,
    pub incidents: Vec<Incident>,
}

pub type SharedView = Arc<RwLock<OrchestratorView>>;

// ============================================================================
// ORCHESTRATOR
// ============================================================================

pub struct SecurityOrchestrator {
    cfg: OrchestratorConfig,
    policy: PolicyTable,
    engine: ActionEngine,
    hub: NotifyHub,
    store: Arc<EventStore>,

    incidents: HashMap<Uuid, Incident>,
    open_index: HashMap<(IpAddr, AttackType), Uuid>,
    degraded_notified: HashSet<Uuid>,

    anomalies_seen: u64,
    incidents_total: u64,
    actions_requested: u64,
    actions_rejected: u64,

    view: SharedView,
}

impl SecurityOrchestrator {
    pub fn new(
        cfg: OrchestratorConfig,
        policy: PolicyTable,
        engine: ActionEngine,
        hub: NotifyHub,
        store: Arc<EventStore>,
        view: SharedView,
    ) -> Self {
        let mut orchestrator = Self {
            cfg,
            policy,
            engine,
            hub,
            store,
            incidents: HashMap::new(),
            open_index: HashMap::new(),
            degraded_notified: HashSet::new(),
            anomalies_seen: 0,
            incidents_total: 0,
            actions_requested: 0,
            actions_rejected: 0,
            view,
        };
        orchestrator.reload_open_incidents();
        orchestrator
    }

    /// Reopen non-terminal incidents from the audit log so a restart does
    /// not duplicate ongoing attacks.
    fn reload_open_incidents(&mut self) {
        match self.store.load_open_incidents() {
            Ok(incidents) => {
                for incident in incidents {
                    self.open_index
                        .insert((incident.source, incident.attack_type), incident.id);
                    self.incidents.insert(incident.id, incident);
                }
                if !self.incidents.is_empty() {
                    log::info!("Reopened {} incidents from audit log", self.incidents.len());
                }
            }
            Err(e) => log::warn!("Could not reload open incidents: {}", e),
        }
    }

    /// Main loop. Ends when the score channel closes; shutdown then flushes
    /// the action engine (rolling back active enforcement) and drains the
    /// remaining outcome reports before returning.
    pub async fn run(
        mut self,
        mut scores: mpsc::Receiver<AnomalyScore>,
        mut outcomes: mpsc::Receiver<ActionOutcome>,
        mut commands: mpsc::Receiver<OrchestratorCommand>,
    ) {
        log::info!("Security orchestrator started ({} policy rules)", self.policy.len());
        let mut sweep = tokio::time::interval(self.cfg.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                score = scores.recv() => match score {
                    Some(score) => self.evaluate_anomaly(score),
                    None => break,
                },
                outcome = outcomes.recv() => {
                    if let Some(outcome) = outcome {
                        self.handle_outcome(outcome).await;
                    }
                }
                command = commands.recv() => {
                    if let Some(command) = command {
                        self.handle_command(command);
                    }
                }
                _ = sweep.tick() => self.sweep().await,
            }
            self.publish_view();
        }

        // Intake closed: stop enforcement first, then account for the
        // rollbacks and abandonments it produced.
        self.engine.shutdown().await;
        while let Ok(outcome) = outcomes.try_recv() {
            self.handle_outcome(outcome).await;
        }
        self.publish_view();
        log::info!("Security orchestrator stopped");
    }

    // ------------------------------------------------------------------
    // Anomaly intake
    // ------------------------------------------------------------------

    fn evaluate_anomaly(&mut self, score: AnomalyScore) {
        self.anomalies_seen += 1;

        if score.score < self.cfg.response_threshold {
            return;
        }
        if score.confidence < self.cfg.confidence_threshold {
            log::debug!(
                "Anomaly from {} above threshold but confidence {:.2} too low",
                score.flow.src_ip,
                score.confidence
            );
            return;
        }

        let key = (score.flow.src_ip, score.attack_type);

        if let Some(&id) = self.open_index.get(&key) {
            if self
                .incidents
                .get(&id)
                .map(|i| i.state.accepts_scores())
                .unwrap_or(false)
            {
                let escalated = self
                    .incidents
                    .get_mut(&id)
                    .map(|i| i.absorb(score))
                    .unwrap_or(false);
                if escalated {
                    self.transition(id, IncidentState::Escalated);
                    self.apply_policy(id);
                }
                return;
            }
            self.open_index.remove(&key);
        }

        let incident = Incident::new(score);
        let id = incident.id;
        self.incidents_total += 1;
        log::warn!("New incident {}: {}", id, incident.describe());

        self.open_index.insert(key, id);
        self.incidents.insert(id, incident);

        // NEW is observable, then the incident opens immediately
        self.notify_and_record(id);
        self.transition(id, IncidentState::Open);
        self.apply_policy(id);
    }

    // ------------------------------------------------------------------
    // Policy application
    // ------------------------------------------------------------------

    fn apply_policy(&mut self, id: Uuid) {
        let Some(incident) = self.incidents.get(&id) else {
            return;
        };
        let severity = incident.severity;
        let attack = incident.attack_type;
        let source = incident.source;

        let actions: Vec<_> = self.policy.actions_for(severity, attack).to_vec();
        let mut queued_any = false;

        for kind in actions {
            let request = ActionRequest {
                incident_id: id,
                kind,
                target: ActionTarget { ip: source, port: None },
                params: HashMap::new(),
                duration: kind.is_reversible().then_some(self.cfg.action_duration),
                dry_run: self.cfg.dry_run,
            };

            self.actions_requested += 1;
            match self.engine.queue_action(request) {
                Ok(record) => {
                    queued_any = true;
                    if let Some(incident) = self.incidents.get_mut(&id) {
                        incident.action_ids.push(record.id);
                    }
                    if let Err(e) = self.store.record_action(&record) {
                        log::warn!("Audit write failed for action {}: {}", record.id, e);
                    }
                }
                Err(ActionError::RateLimited { reason }) => {
                    // Not applied, not retried here. The incident stays in
                    // its current state and the rejection is audited.
                    self.actions_rejected += 1;
                    log::warn!(
                        "Action {} for incident {} rejected: {}",
                        kind.as_str(),
                        id,
                        reason
                    );
                }
                Err(e) => {
                    log::error!("Action {} for incident {} failed to queue: {}", kind.as_str(), id, e);
                }
            }
        }

        if queued_any {
            let keep_degraded = self
                .incidents
                .get(&id)
                .map(|i| i.state == IncidentState::ActionedDegraded)
                .unwrap_or(false);
            if !keep_degraded {
                self.transition(id, IncidentState::Actioned);
            }
        }
    }

    // ------------------------------------------------------------------
    // Outcome + command handling
    // ------------------------------------------------------------------

    async fn handle_outcome(&mut self, outcome: ActionOutcome) {
        // Keep the audit log in step with the engine's record
        if let Some(record) = self.engine.record(outcome.record_id) {
            if let Err(e) = self.store.record_action(&record) {
                log::warn!("Audit write failed for action {}: {}", record.id, e);
            }
        }

        match outcome.result {
            OutcomeKind::Degraded => {
                let Some(incident) = self.incidents.get(&outcome.incident_id) else {
                    return;
                };
                if incident.state.is_terminal()
                    || incident.state == IncidentState::ActionedDegraded
                {
                    return;
                }
                // Flag exactly once per degradation for manual attention
                if self.degraded_notified.insert(outcome.incident_id) {
                    log::error!(
                        "Incident {} degraded: {} could not be applied",
                        outcome.incident_id,
                        outcome.kind.as_str()
                    );
                }
                self.transition(outcome.incident_id, IncidentState::ActionedDegraded);
            }
            OutcomeKind::Applied => {
                // An action that landed after its incident already closed
                // must not stay up until its own timer
                let closed = self
                    .incidents
                    .get(&outcome.incident_id)
                    .map(|i| i.state.is_terminal())
                    .unwrap_or(false);
                if closed {
                    self.engine.rollback_incident(outcome.incident_id).await;
                }
            }
            OutcomeKind::RolledBack | OutcomeKind::Abandoned => {}
        }
    }

    fn handle_command(&mut self, command: OrchestratorCommand) {
        match command {
            OrchestratorCommand::Resolve(id) => self.resolve(id),
        }
    }

    fn resolve(&mut self, id: Uuid) {
        let resolvable = self
            .incidents
            .get(&id)
            .map(|i| !i.state.is_terminal())
            .unwrap_or(false);
        if resolvable {
            self.transition(id, IncidentState::Resolved);
        }
    }

    // ------------------------------------------------------------------
    // Periodic sweep
    // ------------------------------------------------------------------

    async fn sweep(&mut self) {
        let now = Utc::now();
        let mut to_expire = Vec::new();
        let mut to_resolve = Vec::new();

        for incident in self.incidents.values() {
            if incident.state.is_terminal() {
                continue;
            }
            let idle = (now - incident.last_seen).num_seconds();
            if idle >= self.cfg.max_age_secs {
                to_expire.push(incident.id);
            } else if idle >= self.cfg.quiet_secs
                && matches!(
                    incident.state,
                    IncidentState::Actioned | IncidentState::ActionedDegraded
                )
            {
                to_resolve.push(incident.id);
            }
        }

        for id in to_resolve {
            log::info!("Incident {} quiet, auto-resolving", id);
            self.transition(id, IncidentState::Resolved);
        }

        for id in to_expire {
            log::info!("Incident {} aged out, expiring and rolling back", id);
            self.transition(id, IncidentState::Expired);
            self.engine.rollback_incident(id).await;
        }
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    fn transition(&mut self, id: Uuid, state: IncidentState) {
        let Some(incident) = self.incidents.get_mut(&id) else {
            return;
        };
        if incident.state == state {
            return;
        }
        incident.state = state;

        if state.is_terminal() {
            self.open_index.remove(&(incident.source, incident.attack_type));
        }

        self.notify_and_record(id);
    }

    fn notify_and_record(&mut self, id: Uuid) {
        let Some(incident) = self.incidents.get(&id) else {
            return;
        };
        let snapshot = incident.clone();
        self.hub.publish(&snapshot);
        if let Err(e) = self.store.record_incident(&snapshot) {
            log::warn!("Audit write failed for incident {}: {}", id, e);
        }
    }

    fn publish_view(&self) {
        let mut by_severity: HashMap<String, u64> = HashMap::new();
        for incident in self.incidents.values() {
            if !incident.state.is_terminal() {
                *by_severity
                    .entry(incident.severity.as_str().to_string())
                    .or_insert(0) += 1;
            }
        }

        *self.view.write() = OrchestratorView {
            active_incidents: self
                .incidents
                .values()
                .filter(|i| !i.state.is_terminal())
                .count(),
            incidents_by_severity: by_severity,
            anomalies_seen: self.anomalies_seen,
            incidents_total: self.incidents_total,
            actions_requested: self.actions_requested,
            actions_rejected: self.actions_rejected,
            incidents: self.incidents.values().cloned().collect(),
        };
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::capture::{FlowRef, Protocol};
    use crate::logic::detect::ScoreMethod;
    use crate::logic::notify::{IncidentNotifier, NotifyError};
    use crate::logic::response::backends::MockBackend;
    use crate::logic::response::{ActionKind, BackendMap, EngineConfig, ResponseBackend};
    use parking_lot::Mutex;

    struct StateRecorder {
        transitions: Mutex<Vec<(Uuid, String)>>,
    }

    impl IncidentNotifier for Arc<StateRecorder> {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn notify(&self, incident: &Incident) -> Result<(), NotifyError> {
            self.transitions
                .lock()
                .push((incident.id, incident.state.as_str().to_string()));
            Ok(())
        }
    }

    struct Harness {
        scores_tx: mpsc::Sender<AnomalyScore>,
        commands_tx: mpsc::Sender<OrchestratorCommand>,
        view: SharedView,
        recorder: Arc<StateRecorder>,
        mock: Arc<MockBackend>,
        engine: ActionEngine,
        store: Arc<EventStore>,
    }

    fn spawn_orchestrator(cfg: OrchestratorConfig) -> Harness {
        let mock = MockBackend::new();
        let mut backends: BackendMap = HashMap::new();
        for kind in ActionKind::ALL {
            backends.insert(*kind, mock.clone() as Arc<dyn ResponseBackend>);
        }

        let (outcome_tx, outcome_rx) = mpsc::channel(64);
        let engine = ActionEngine::new(EngineConfig::default(), backends, outcome_tx);

        let recorder = Arc::new(StateRecorder { transitions: Mutex::new(Vec::new()) });
        let (hub, _hub_handle) = NotifyHub::start(
            vec![Arc::new(recorder.clone())],
            64,
            Duration::from_secs(1),
        );

        let store = Arc::new(EventStore::in_memory().unwrap());
        let view: SharedView = Arc::new(RwLock::new(OrchestratorView::default()));

        let orchestrator = SecurityOrchestrator::new(
            cfg,
            PolicyTable::default_table(),
            engine.clone(),
            hub,
            store.clone(),
            view.clone(),
        );

        let (scores_tx, scores_rx) = mpsc::channel(64);
        let (commands_tx, commands_rx) = mpsc::channel(8);
        tokio::spawn(orchestrator.run(scores_rx, outcome_rx, commands_rx));

        Harness { scores_tx, commands_tx, view, recorder, mock, engine, store }
    }

    fn score(src: &str, attack: AttackType, value: f32) -> AnomalyScore {
        AnomalyScore {
            score: value,
            confidence: 0.9,
            method: ScoreMethod::Statistical,
            attack_type: attack,
            explanation: String::new(),
            triggered: vec![],
            flow: FlowRef {
                src_ip: src.parse().unwrap(),
                dst_ip: "10.0.0.254".parse().unwrap(),
                src_port: 40000,
                dst_port: 22,
                protocol: Protocol::Tcp,
            },
            observed_at: Utc::now(),
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_port_scan_opens_incident_and_actions() {
        let h = spawn_orchestrator(OrchestratorConfig::default());
        h.scores_tx
            .send(score("10.0.0.1", AttackType::PortScan, 0.85))
            .await
            .unwrap();

        let view = h.view.clone();
        wait_for(move || {
            let v = view.read();
            v.incidents
                .iter()
                .any(|i| i.state == IncidentState::Actioned)
        })
        .await;

        let v = h.view.read();
        let incident = &v.incidents[0];
        assert_eq!(incident.attack_type, AttackType::PortScan);
        assert!(incident.severity >= Severity::Warning);
        assert!(!incident.action_ids.is_empty());
    }

    #[tokio::test]
    async fn test_matching_anomaly_merges_not_duplicates() {
        let h = spawn_orchestrator(OrchestratorConfig::default());
        for _ in 0..3 {
            h.scores_tx
                .send(score("10.0.0.2", AttackType::BruteForce, 0.85))
                .await
                .unwrap();
        }

        let view = h.view.clone();
        wait_for(move || view.read().anomalies_seen == 3).await;

        let v = h.view.read();
        assert_eq!(v.incidents_total, 1, "same (source, attack) must merge");
        assert_eq!(v.incidents[0].scores.len(), 3);
    }

    #[tokio::test]
    async fn test_below_threshold_ignored() {
        let h = spawn_orchestrator(OrchestratorConfig::default());
        h.scores_tx
            .send(score("10.0.0.3", AttackType::Ddos, 0.5))
            .await
            .unwrap();

        let view = h.view.clone();
        wait_for(move || view.read().anomalies_seen == 1).await;
        assert_eq!(h.view.read().incidents_total, 0);
    }

    #[tokio::test]
    async fn test_backend_failure_degrades_and_notifies_once() {
        let h = spawn_orchestrator(OrchestratorConfig::default());
        h.mock.set_failing(true);

        h.scores_tx
            .send(score("10.0.0.4", AttackType::BruteForce, 0.85))
            .await
            .unwrap();

        let view = h.view.clone();
        wait_for(move || {
            view.read()
                .incidents
                .iter()
                .any(|i| i.state == IncidentState::ActionedDegraded)
        })
        .await;

        // Give any duplicate notification a chance to surface, then count
        tokio::time::sleep(Duration::from_millis(200)).await;
        let transitions = h.recorder.transitions.lock();
        let degraded_count = transitions
            .iter()
            .filter(|(_, s)| s == "actioned_degraded")
            .count();
        assert_eq!(degraded_count, 1, "exactly one ACTIONED-DEGRADED notification");
    }

    #[tokio::test]
    async fn test_manual_resolve() {
        let h = spawn_orchestrator(OrchestratorConfig::default());
        h.scores_tx
            .send(score("10.0.0.5", AttackType::PortScan, 0.85))
            .await
            .unwrap();

        let view = h.view.clone();
        wait_for(move || !view.read().incidents.is_empty()).await;
        let id = h.view.read().incidents[0].id;

        h.commands_tx
            .send(OrchestratorCommand::Resolve(id))
            .await
            .unwrap();

        let view = h.view.clone();
        wait_for(move || {
            view.read()
                .incidents
                .iter()
                .any(|i| i.state == IncidentState::Resolved)
        })
        .await;
        assert_eq!(h.view.read().active_incidents, 0);
    }

    #[tokio::test]
    async fn test_expiry_rolls_back_actions() {
        let cfg = OrchestratorConfig {
            max_age_secs: 0,
            sweep_interval: Duration::from_millis(50),
            ..Default::default()
        };
        let h = spawn_orchestrator(cfg);

        h.scores_tx
            .send(score("10.0.0.6", AttackType::BruteForce, 0.95))
            .await
            .unwrap();

        let view = h.view.clone();
        wait_for(move || {
            view.read()
                .incidents
                .iter()
                .any(|i| i.state == IncidentState::Expired)
        })
        .await;

        let mock = h.mock.clone();
        wait_for(move || mock.revert_count() > 0).await;
    }

    #[tokio::test]
    async fn test_shutdown_rolls_back_via_engine() {
        let h = spawn_orchestrator(OrchestratorConfig::default());
        h.scores_tx
            .send(score("10.0.0.7", AttackType::BruteForce, 0.95))
            .await
            .unwrap();

        let mock = h.mock.clone();
        wait_for(move || mock.apply_count() > 0).await;

        // Closing the score channel shuts the orchestrator and engine down
        drop(h.scores_tx);
        let engine = h.engine.clone();
        wait_for(move || !engine.status().accepting).await;

        let mock = h.mock.clone();
        wait_for(move || mock.revert_count() > 0).await;

        // The audit log captures the rollback once the outcome drain runs
        let store = h.store.clone();
        wait_for(move || {
            store
                .load_recent(
                    crate::logic::storage::RecordKind::Action,
                    Utc::now() - chrono::Duration::minutes(1),
                )
                .map(|rows| rows.iter().any(|r| r["rolled_back"] == true))
                .unwrap_or(false)
        })
        .await;
    }
}
