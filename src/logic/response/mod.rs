//! Action Engine - queued, rate-limited, reversible response execution
//!
//! Every request passes one gate (`queue_action`) that enforces the
//! concurrency cap, the sliding-window budget, and duplicate suppression
//! with typed rejections. Executed actions with a finite duration always
//! get an expiry timer that applies the inverse operation exactly once;
//! shutdown fires those rollbacks immediately instead of leaving
//! enforcement active with no timer.

pub mod types;
pub mod backends;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub use backends::{BackendMap, BackendError, ResponseBackend};
pub use types::{
    ActionError, ActionKind, ActionOutcome, ActionRecord, ActionRequest, ActionStatus,
    ActionTarget, OutcomeKind,
};

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_concurrent_actions: usize,
    pub max_actions_per_minute: u32,
    pub backend_timeout: Duration,
    /// Total dispatch attempts = 1 + this many retries
    pub backend_max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_actions: 10,
            max_actions_per_minute: 60,
            backend_timeout: Duration::from_secs(5),
            backend_max_retries: 2,
            retry_backoff: Duration::from_millis(250),
        }
    }
}

// ============================================================================
// STATE
// ============================================================================

struct EngineState {
    records: HashMap<Uuid, ActionRecord>,
    /// Key of every action holding a concurrency slot
    active_keys: HashSet<(ActionKind, ActionTarget)>,
    active_count: usize,
    /// Admission timestamps for the sliding-window budget
    window: VecDeque<Instant>,
    timers: HashMap<Uuid, JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    accepting: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStatusSnapshot {
    pub active_actions: usize,
    pub records_total: usize,
    pub rolled_back_total: usize,
    pub accepting: bool,
}

struct Inner {
    cfg: EngineConfig,
    backends: BackendMap,
    state: Mutex<EngineState>,
    outcome_tx: mpsc::Sender<ActionOutcome>,
}

// ============================================================================
// ENGINE
// ============================================================================

#[derive(Clone)]
pub struct ActionEngine {
    inner: Arc<Inner>,
}

impl ActionEngine {
    /// `outcome_tx` feeds execution results back to the orchestrator
    /// (applied / degraded / rolled back / abandoned).
    pub fn new(cfg: EngineConfig, backends: BackendMap, outcome_tx: mpsc::Sender<ActionOutcome>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cfg,
                backends,
                state: Mutex::new(EngineState {
                    records: HashMap::new(),
                    active_keys: HashSet::new(),
                    active_count: 0,
                    window: VecDeque::new(),
                    timers: HashMap::new(),
                    workers: Vec::new(),
                    accepting: true,
                }),
                outcome_tx,
            }),
        }
    }

    /// Admit a request. All rejection paths are typed - the caller must
    /// treat a rejection as "action not applied", never retry blindly.
    pub fn queue_action(&self, request: ActionRequest) -> Result<ActionRecord, ActionError> {
        let inner = &self.inner;

        if !inner.backends.contains_key(&request.kind) {
            return Err(ActionError::UnknownKind {
                kind: request.kind.as_str().to_string(),
            });
        }

        let mut state = inner.state.lock();

        if !state.accepting {
            return Err(ActionError::ShuttingDown);
        }

        let key = (request.kind, request.target);
        if state.active_keys.contains(&key) {
            return Err(ActionError::RateLimited {
                reason: format!("{} already active for {}", request.kind.as_str(), request.target),
            });
        }

        if state.active_count >= inner.cfg.max_concurrent_actions {
            return Err(ActionError::RateLimited {
                reason: format!(
                    "concurrent action limit {} reached",
                    inner.cfg.max_concurrent_actions
                ),
            });
        }

        let now = Instant::now();
        while state
            .window
            .front()
            .map(|t| now.duration_since(*t) > Duration::from_secs(60))
            .unwrap_or(false)
        {
            state.window.pop_front();
        }
        if state.window.len() >= inner.cfg.max_actions_per_minute as usize {
            return Err(ActionError::RateLimited {
                reason: format!(
                    "action budget {} per minute exhausted",
                    inner.cfg.max_actions_per_minute
                ),
            });
        }

        let record = ActionRecord::new(request);
        state.records.insert(record.id, record.clone());
        state.active_keys.insert(key);
        state.active_count += 1;
        state.window.push_back(now);

        let inner_clone = Arc::clone(inner);
        let record_id = record.id;
        let worker = tokio::spawn(async move {
            execute(inner_clone, record_id).await;
        });
        state.workers.push(worker);

        log::info!(
            "Queued {} for {} (incident {})",
            record.request.kind.as_str(),
            record.request.target,
            record.request.incident_id
        );

        Ok(record)
    }

    /// Roll back every still-active action belonging to an incident
    /// (incident expiry path).
    pub async fn rollback_incident(&self, incident_id: Uuid) {
        let ids: Vec<Uuid> = {
            let state = self.inner.state.lock();
            state
                .records
                .values()
                .filter(|r| {
                    r.request.incident_id == incident_id
                        && r.status == ActionStatus::Completed
                        && !r.rolled_back
                })
                .map(|r| r.id)
                .collect()
        };
        for id in ids {
            rollback(Arc::clone(&self.inner), id, "incident closed").await;
        }
    }

    /// Stop intake, drain in-flight dispatches, abandon queued work, and
    /// execute every outstanding rollback immediately. No action stays
    /// active without a timer after this returns.
    pub async fn shutdown(&self) {
        let workers = {
            let mut state = self.inner.state.lock();
            state.accepting = false;
            std::mem::take(&mut state.workers)
        };

        let drain_budget = self.inner.cfg.backend_timeout * 2;
        for worker in workers {
            let _ = tokio::time::timeout(drain_budget, worker).await;
        }

        // Cancel timers; their rollbacks run inline below
        let timers = {
            let mut state = self.inner.state.lock();
            std::mem::take(&mut state.timers)
        };
        for (_, handle) in timers {
            handle.abort();
        }

        let (queued, to_roll_back): (Vec<Uuid>, Vec<Uuid>) = {
            let state = self.inner.state.lock();
            (
                state
                    .records
                    .values()
                    .filter(|r| r.status == ActionStatus::Queued)
                    .map(|r| r.id)
                    .collect(),
                state
                    .records
                    .values()
                    .filter(|r| r.status == ActionStatus::Completed && !r.rolled_back)
                    .map(|r| r.id)
                    .collect(),
            )
        };

        let mut abandoned = Vec::new();
        {
            let mut state = self.inner.state.lock();
            for id in queued {
                if let Some(record) = state.records.get_mut(&id) {
                    record.status = ActionStatus::Abandoned;
                    abandoned.push(ActionOutcome {
                        incident_id: record.request.incident_id,
                        record_id: record.id,
                        kind: record.request.kind,
                        result: OutcomeKind::Abandoned,
                    });
                }
                release_slot_locked(&mut state, id);
            }
        }
        for outcome in abandoned {
            let _ = self.inner.outcome_tx.try_send(outcome);
        }

        for id in to_roll_back {
            rollback(Arc::clone(&self.inner), id, "shutdown").await;
        }

        log::info!("Action engine shut down");
    }

    pub fn record(&self, id: Uuid) -> Option<ActionRecord> {
        self.inner.state.lock().records.get(&id).cloned()
    }

    /// Targets currently under duration-bound enforcement (for `get_status`)
    pub fn blocked_targets(&self) -> Vec<ActionTarget> {
        let state = self.inner.state.lock();
        state
            .records
            .values()
            .filter(|r| {
                r.status == ActionStatus::Completed
                    && !r.rolled_back
                    && r.executed
                    && r.expires_at.is_some()
            })
            .map(|r| r.request.target)
            .collect()
    }

    pub fn status(&self) -> EngineStatusSnapshot {
        let state = self.inner.state.lock();
        EngineStatusSnapshot {
            active_actions: state.active_count,
            records_total: state.records.len(),
            rolled_back_total: state.records.values().filter(|r| r.rolled_back).count(),
            accepting: state.accepting,
        }
    }
}

// ============================================================================
// EXECUTION
// ============================================================================

async fn execute(inner: Arc<Inner>, record_id: Uuid) {
    let request = {
        let mut state = inner.state.lock();
        let Some(record) = state.records.get_mut(&record_id) else {
            return;
        };
        record.status = ActionStatus::Executing;
        record.attempts = 0;
        record.request.clone()
    };

    if request.dry_run {
        // Full bookkeeping, no enforcement
        complete(&inner, record_id, false, "dry run".to_string(), &request).await;
        return;
    }

    let backend = match inner.backends.get(&request.kind) {
        Some(b) => Arc::clone(b),
        None => {
            fail(&inner, record_id, &request, "backend disappeared".to_string());
            return;
        }
    };

    let max_attempts = 1 + inner.cfg.backend_max_retries;
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        {
            let mut state = inner.state.lock();
            if let Some(record) = state.records.get_mut(&record_id) {
                record.attempts = attempt;
            }
        }

        let backend_call = Arc::clone(&backend);
        let req_clone = request.clone();
        let result = tokio::time::timeout(
            inner.cfg.backend_timeout,
            tokio::task::spawn_blocking(move || backend_call.apply(&req_clone)),
        )
        .await;

        match result {
            Ok(Ok(Ok(detail))) => {
                complete(&inner, record_id, true, detail, &request).await;
                return;
            }
            Ok(Ok(Err(e))) => last_error = e.to_string(),
            Ok(Err(join_err)) => last_error = format!("dispatch panicked: {}", join_err),
            Err(_) => {
                last_error = format!("timed out after {:?}", inner.cfg.backend_timeout)
            }
        }

        log::warn!(
            "Backend {} attempt {}/{} failed for {}: {}",
            backend.name(),
            attempt,
            max_attempts,
            request.target,
            last_error
        );

        if attempt < max_attempts {
            tokio::time::sleep(inner.cfg.retry_backoff).await;
        }
    }

    fail(&inner, record_id, &request, last_error);
}

async fn complete(inner: &Arc<Inner>, record_id: Uuid, executed: bool, detail: String, request: &ActionRequest) {
    let (arm_duration, accepting) = {
        let mut state = inner.state.lock();
        let Some(record) = state.records.get_mut(&record_id) else {
            return;
        };
        record.status = ActionStatus::Completed;
        record.executed = executed;
        record.executed_at = Some(Utc::now());
        record.detail = Some(detail);

        let armed = match request.duration {
            Some(d) => {
                record.expires_at = Some(Utc::now() + chrono::Duration::from_std(d).unwrap_or_default());
                Some(d)
            }
            None => {
                // Instant action: slot frees right away
                release_slot_locked(&mut state, record_id);
                None
            }
        };
        (armed, state.accepting)
    };

    match (arm_duration, accepting) {
        (Some(duration), true) => {
            let timer_inner = Arc::clone(inner);
            let handle = tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                rollback(timer_inner, record_id, "duration expired").await;
            });
            inner.state.lock().timers.insert(record_id, handle);
        }
        (Some(_), false) => {
            // Completed during shutdown: never leave enforcement active
            // with no timer behind it
            rollback(Arc::clone(inner), record_id, "shutdown").await;
        }
        (None, _) => {}
    }

    let _ = inner.outcome_tx.try_send(ActionOutcome {
        incident_id: request.incident_id,
        record_id,
        kind: request.kind,
        result: OutcomeKind::Applied,
    });
}

fn fail(inner: &Arc<Inner>, record_id: Uuid, request: &ActionRequest, error: String) {
    {
        let mut state = inner.state.lock();
        if let Some(record) = state.records.get_mut(&record_id) {
            record.status = ActionStatus::Failed;
            record.detail = Some(error.clone());
        }
        release_slot_locked(&mut state, record_id);
    }

    log::error!(
        "Action {} for {} failed permanently: {}",
        request.kind.as_str(),
        request.target,
        error
    );

    let _ = inner.outcome_tx.try_send(ActionOutcome {
        incident_id: request.incident_id,
        record_id,
        kind: request.kind,
        result: OutcomeKind::Degraded,
    });
}

/// Exactly-once inverse operation. The rolled_back flag is claimed under
/// the lock before any backend work, so a racing timer and shutdown can
/// never both revert.
async fn rollback(inner: Arc<Inner>, record_id: Uuid, reason: &str) {
    let claim = {
        let mut state = inner.state.lock();
        let Some(record) = state.records.get_mut(&record_id) else {
            return;
        };
        if record.rolled_back || record.status != ActionStatus::Completed {
            return;
        }
        record.rolled_back = true;
        let info = (record.request.clone(), record.executed);
        if let Some(handle) = state.timers.remove(&record_id) {
            handle.abort();
        }
        info
    };

    let (request, executed) = claim;

    // Dry-run and never-executed records roll back on paper only
    if executed {
        if let Some(backend) = inner.backends.get(&request.kind) {
            let backend_call = Arc::clone(backend);
            let req_clone = request.clone();
            let result = tokio::time::timeout(
                inner.cfg.backend_timeout,
                tokio::task::spawn_blocking(move || backend_call.revert(&req_clone)),
            )
            .await;

            match result {
                Ok(Ok(Ok(_))) => {}
                Ok(Ok(Err(e))) => {
                    log::error!("Rollback of {} for {} failed: {}", request.kind.as_str(), request.target, e)
                }
                Ok(Err(e)) => log::error!("Rollback dispatch panicked: {}", e),
                Err(_) => log::error!("Rollback of {} for {} timed out", request.kind.as_str(), request.target),
            }
        }
    }

    {
        let mut state = inner.state.lock();
        if let Some(record) = state.records.get_mut(&record_id) {
            record.status = ActionStatus::RolledBack;
            record.detail = Some(format!("rolled back: {}", reason));
        }
        release_slot_locked(&mut state, record_id);
    }

    log::info!(
        "Rolled back {} for {} ({})",
        request.kind.as_str(),
        request.target,
        reason
    );

    let _ = inner.outcome_tx.try_send(ActionOutcome {
        incident_id: request.incident_id,
        record_id,
        kind: request.kind,
        result: OutcomeKind::RolledBack,
    });
}

/// Free the concurrency slot and duplicate key exactly once per record.
fn release_slot_locked(state: &mut EngineState, record_id: Uuid) {
    let Some(record) = state.records.get(&record_id) else {
        return;
    };
    let key = (record.request.kind, record.request.target);
    if state.active_keys.remove(&key) {
        state.active_count = state.active_count.saturating_sub(1);
    }
}

// ============================================================================
// TESTS
// ============================================================================
