//! Pipeline - stage wiring and lifecycle
//!
//! Independent stages connected by bounded channels:
//!
//! ```text
//! PacketSource -> [ingest thread] -> features -> [detect task] -> scores
//!     -> [orchestrator task] -> ActionEngine workers -> backends
//!                            -> NotifyHub -> subscribers
//! ```
//!
//! Backpressure is the channel bound: when detection lags, the ingest
//! thread blocks on `blocking_send` instead of buffering. Only model
//! training runs on its own schedule off the hot path. Shutdown stops
//! ingestion first, drains each stage in order, and the orchestrator
//! flushes the action engine (executing outstanding rollbacks) last.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::constants::BASELINE_UPDATE_THRESHOLD;
use super::capture::PacketSource;
use super::config::{ConfigError, MonitorConfig};
use super::detect::{
    AnomalyDetector, AnomalyScore, BehavioralConfig, BehavioralScorer, DetectorConfig,
    LearnedConfig, LearnedEngine, ModelTrainingError,
};
use super::features::{ExtractorConfig, FeatureExtractor, FlowFeatures};
use super::incident::{
    OrchestratorCommand, OrchestratorConfig, OrchestratorView, SecurityOrchestrator, SharedView,
};
use super::notify::{IncidentNotifier, LogNotifier, NotifyHub, WebhookNotifier};
use super::policy::PolicyTable;
use super::profile::BehaviorProfiler;
use super::response::{ActionEngine, BackendMap, EngineConfig};
use super::status::{self, EngineStatus, PipelineMetrics, QueueDepths};
use super::storage::EventStore;

// ============================================================================
// STATUS HANDLE
// ============================================================================

/// Cheap clone handed to whatever serves dashboards/CLIs.
#[derive(Clone)]
pub struct StatusHandle {
    metrics: Arc<PipelineMetrics>,
    view: SharedView,
    engine: ActionEngine,
    learned: Arc<LearnedEngine>,
    notify_dropped: Arc<AtomicU64>,
    store: Arc<EventStore>,
    features_probe: mpsc::WeakSender<FlowFeatures>,
    scores_probe: mpsc::WeakSender<AnomalyScore>,
    commands: mpsc::Sender<OrchestratorCommand>,
}

impl StatusHandle {
    pub fn status(&self) -> EngineStatus {
        let view = self.view.read().clone();
        let blocked = self
            .engine
            .blocked_targets()
            .iter()
            .map(|t| t.to_string())
            .collect();
        status::collect(
            &self.metrics,
            &view,
            &self.engine.status(),
            self.learned.status(),
            blocked,
            QueueDepths {
                features: queue_depth(&self.features_probe),
                scores: queue_depth(&self.scores_probe),
                notify_dropped: self.notify_dropped.load(Ordering::Relaxed),
            },
        )
    }

    pub fn export(&self, since: DateTime<Utc>) -> serde_json::Value {
        status::export(&self.store, since)
    }

    /// Manual incident resolution (operator surface)
    pub async fn resolve(&self, incident_id: Uuid) {
        let _ = self
            .commands
            .send(OrchestratorCommand::Resolve(incident_id))
            .await;
    }
}

fn queue_depth<T>(probe: &mpsc::WeakSender<T>) -> u64 {
    match probe.upgrade() {
        Some(sender) => (sender.max_capacity() - sender.capacity()) as u64,
        None => 0,
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct Pipeline {
    shutdown_tx: watch::Sender<bool>,
    ingest_thread: Option<std::thread::JoinHandle<()>>,
    detect_task: Option<JoinHandle<()>>,
    trainer_task: Option<JoinHandle<()>>,
    orchestrator_task: Option<JoinHandle<()>>,
    hub_task: Option<JoinHandle<()>>,
    status: StatusHandle,
}

impl Pipeline {
    /// Validate config, build every stage, and start them. Fails fast on
    /// configuration errors; nothing is spawned unless everything checks
    /// out.
    pub fn start(
        cfg: MonitorConfig,
        source: Box<dyn PacketSource>,
        backends: BackendMap,
        extra_notifiers: Vec<Arc<dyn IncidentNotifier>>,
        store: Arc<EventStore>,
    ) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let policy = PolicyTable::from_config(&cfg.policy)?;

        let metrics = Arc::new(PipelineMetrics::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Notification fan-out
        let mut notifiers: Vec<Arc<dyn IncidentNotifier>> = vec![Arc::new(LogNotifier)];
        if let Some(url) = &cfg.webhook_url {
            notifiers.push(Arc::new(WebhookNotifier::new(
                url.clone(),
                cfg.webhook_severity()?,
            )));
        }
        notifiers.extend(extra_notifiers);
        let (hub, hub_task) = NotifyHub::start(
            notifiers,
            cfg.notify_queue_size,
            Duration::from_secs(cfg.notify_timeout_secs),
        );
        let notify_dropped = hub.dropped_handle();

        // Response engine
        let (outcome_tx, outcome_rx) = mpsc::channel(cfg.queue_size);
        let engine = ActionEngine::new(
            EngineConfig {
                max_concurrent_actions: cfg.max_concurrent_actions,
                max_actions_per_minute: cfg.max_actions_per_minute,
                backend_timeout: Duration::from_secs(cfg.backend_timeout_secs),
                backend_max_retries: cfg.backend_max_retries,
                retry_backoff: Duration::from_millis(250),
            },
            backends,
            outcome_tx,
        );

        // Detection
        let learned = Arc::new(LearnedEngine::new(LearnedConfig::default()));
        let detector = AnomalyDetector::new(
            DetectorConfig {
                z_threshold: cfg.z_threshold,
                profile_min_samples: cfg.profile_min_samples,
                ..Default::default()
            },
            Arc::clone(&learned),
            BehavioralScorer::new(BehavioralConfig::default(), cfg.max_profiled_hosts),
        );
        let profiler = Arc::new(BehaviorProfiler::new(
            cfg.profile_decay,
            cfg.profile_min_samples,
            cfg.max_profiled_hosts,
        ));

        // Orchestrator
        let view: SharedView = Arc::new(RwLock::new(OrchestratorView::default()));
        let orchestrator = SecurityOrchestrator::new(
            OrchestratorConfig {
                response_threshold: cfg.response_threshold,
                confidence_threshold: cfg.confidence_threshold,
                quiet_secs: cfg.incident_quiet_secs,
                max_age_secs: cfg.incident_max_age_secs,
                action_duration: Duration::from_secs(cfg.action_default_timeout_secs),
                dry_run: cfg.dry_run,
                sweep_interval: Duration::from_secs(10),
            },
            policy,
            engine.clone(),
            hub,
            Arc::clone(&store),
            Arc::clone(&view),
        );

        let (features_tx, features_rx) = mpsc::channel::<FlowFeatures>(cfg.queue_size);
        let (scores_tx, scores_rx) = mpsc::channel::<AnomalyScore>(cfg.queue_size);
        let (commands_tx, commands_rx) = mpsc::channel::<OrchestratorCommand>(16);

        let status = StatusHandle {
            metrics: Arc::clone(&metrics),
            view,
            engine: engine.clone(),
            learned: Arc::clone(&learned),
            notify_dropped,
            store: Arc::clone(&store),
            features_probe: features_tx.downgrade(),
            scores_probe: scores_tx.downgrade(),
            commands: commands_tx,
        };

        let orchestrator_task =
            tokio::spawn(orchestrator.run(scores_rx, outcome_rx, commands_rx));

        let detect_task = tokio::spawn(detect_stage(
            features_rx,
            scores_tx,
            detector,
            Arc::clone(&profiler),
            Arc::clone(&metrics),
            cfg.anomaly_threshold,
        ));

        let trainer_task = tokio::spawn(trainer_stage(
            Arc::clone(&learned),
            Duration::from_secs(cfg.model_update_interval_secs),
            shutdown_rx.clone(),
        ));

        let extractor = FeatureExtractor::new(ExtractorConfig {
            max_tracked_flows: cfg.max_tracked_flows,
            flow_idle_secs: cfg.flow_idle_secs,
            flow_window_secs: cfg.flow_window_secs,
            host_window_secs: cfg.host_window_secs,
        });
        let capture_limit = cfg.capture_duration_secs.map(Duration::from_secs);
        let ingest_metrics = Arc::clone(&metrics);
        let ingest_thread = std::thread::Builder::new()
            .name("ingest".to_string())
            .spawn(move || {
                ingest_stage(
                    source,
                    extractor,
                    features_tx,
                    ingest_metrics,
                    shutdown_rx,
                    capture_limit,
                );
            })
            .map_err(ConfigError::Io)?;

        log::info!("Pipeline started");

        Ok(Self {
            shutdown_tx,
            ingest_thread: Some(ingest_thread),
            detect_task: Some(detect_task),
            trainer_task: Some(trainer_task),
            orchestrator_task: Some(orchestrator_task),
            hub_task: Some(hub_task),
            status,
        })
    }

    pub fn status_handle(&self) -> StatusHandle {
        self.status.clone()
    }

    /// Resolves when the orchestrator exits on its own (source end of
    /// stream drained through every stage).
    pub async fn finished(&mut self) {
        if let Some(task) = self.orchestrator_task.take() {
            let _ = task.await;
        }
    }

    /// Ordered shutdown: ingestion stops first, every stage drains, the
    /// orchestrator flushes the action engine, notifications flush last.
    pub async fn shutdown(mut self) {
        log::info!("Pipeline shutting down...");
        let _ = self.shutdown_tx.send(true);

        if let Some(thread) = self.ingest_thread.take() {
            let _ = tokio::task::spawn_blocking(move || thread.join()).await;
        }
        if let Some(task) = self.detect_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.orchestrator_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.trainer_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.hub_task.take() {
            let _ = task.await;
        }
        log::info!("Pipeline stopped");
    }
}

// ============================================================================
// STAGES
// ============================================================================

/// Blocking ingest loop. Owns the PacketSource and the FeatureExtractor;
/// `blocking_send` on the bounded channel is the backpressure point.
fn ingest_stage(
    mut source: Box<dyn PacketSource>,
    mut extractor: FeatureExtractor,
    features_tx: mpsc::Sender<FlowFeatures>,
    metrics: Arc<PipelineMetrics>,
    shutdown_rx: watch::Receiver<bool>,
    capture_limit: Option<Duration>,
) {
    log::info!("Ingest started from {}", source.describe());
    let started = Instant::now();
    let mut last_sweep = Instant::now();
    let mut source_errors: u64 = 0;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        if let Some(limit) = capture_limit {
            if started.elapsed() >= limit {
                log::info!("Capture duration reached, stopping ingestion");
                break;
            }
        }

        match source.next_record() {
            Ok(Some(record)) => {
                for features in extractor.ingest(&record) {
                    if features_tx.blocking_send(features).is_err() {
                        return;
                    }
                }
            }
            Ok(None) => {
                log::info!("Packet source reached end of stream");
                break;
            }
            Err(e) => {
                // One bad record never halts the pipeline
                source_errors += 1;
                log::debug!("Capture error: {}", e);
            }
        }

        if last_sweep.elapsed() >= Duration::from_secs(1) {
            last_sweep = Instant::now();
            for features in extractor.sweep_idle(Utc::now()) {
                if features_tx.blocking_send(features).is_err() {
                    return;
                }
            }
            sync_metrics(&metrics, &extractor, source_errors);
        }
    }

    // Flush what is still tracked so short captures are not silent
    for features in extractor.flush(Utc::now()) {
        if features_tx.blocking_send(features).is_err() {
            break;
        }
    }
    sync_metrics(&metrics, &extractor, source_errors);
    log::info!(
        "Ingest stopped: {} packets, {} dropped, {} vectors",
        extractor.packets_seen,
        extractor.malformed_dropped + source_errors,
        extractor.vectors_emitted
    );
    // features_tx drops here and closes the stage boundary
}

fn sync_metrics(metrics: &PipelineMetrics, extractor: &FeatureExtractor, source_errors: u64) {
    metrics
        .packets_seen
        .store(extractor.packets_seen, Ordering::Relaxed);
    metrics
        .malformed_dropped
        .store(extractor.malformed_dropped + source_errors, Ordering::Relaxed);
    metrics
        .vectors_emitted
        .store(extractor.vectors_emitted, Ordering::Relaxed);
    metrics
        .tracked_flows
        .store(extractor.tracked_flows() as u64, Ordering::Relaxed);
}

/// Detection stage: snapshot profile, evaluate, update the baseline for
/// unremarkable traffic only, forward anomalous scores.
async fn detect_stage(
    mut features_rx: mpsc::Receiver<FlowFeatures>,
    scores_tx: mpsc::Sender<AnomalyScore>,
    detector: AnomalyDetector,
    profiler: Arc<BehaviorProfiler>,
    metrics: Arc<PipelineMetrics>,
    anomaly_threshold: f32,
) {
    while let Some(features) = features_rx.recv().await {
        let profile = profiler.snapshot(features.flow.src_ip);
        let score = detector.evaluate(&features, &profile);

        // Anomalous vectors are withheld from the baseline so attacks
        // cannot teach the profiler
        if score.score < BASELINE_UPDATE_THRESHOLD {
            profiler.observe(&features);
        }
        metrics
            .profiled_hosts
            .store(profiler.host_count() as u64, Ordering::Relaxed);

        if score.score >= anomaly_threshold {
            metrics.scores_emitted.fetch_add(1, Ordering::Relaxed);
            if scores_tx.send(score).await.is_err() {
                break;
            }
        }
    }
    log::debug!("Detect stage drained");
    // scores_tx drops here; the orchestrator sees the close and shuts down
}

/// Off-path model retraining on its own schedule.
async fn trainer_stage(
    learned: Arc<LearnedEngine>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The immediate first tick would always be short on data
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let engine = Arc::clone(&learned);
                match tokio::task::spawn_blocking(move || engine.train()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(ModelTrainingError::NotEnoughData { have, need })) => {
                        log::debug!("Skipping model update: {}/{} vectors", have, need);
                    }
                    Ok(Err(e)) => {
                        learned.mark_degraded();
                        log::error!("Model training failed, running degraded: {}", e);
                    }
                    Err(e) => {
                        learned.mark_degraded();
                        log::error!("Model training panicked, running degraded: {}", e);
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    log::debug!("Trainer stopped");
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::capture::{MemorySource, PacketRecord, Protocol, TcpFlags};
    use crate::logic::detect::AttackType;
    use crate::logic::response::backends::MockBackend;
    use crate::logic::response::{ActionKind, ResponseBackend};
    use std::collections::HashMap;

    fn syn(src: &str, dst: &str, dport: u16, ts: DateTime<Utc>) -> PacketRecord {
        PacketRecord {
            ts,
            src_ip: src.parse().unwrap(),
            dst_ip: dst.parse().unwrap(),
            src_port: 40000,
            dst_port: dport,
            protocol: Protocol::Tcp,
            length: 60,
            tcp_flags: Some(TcpFlags::syn_only()),
            dns_query: None,
        }
    }

    fn mock_backends() -> (BackendMap, Arc<MockBackend>) {
        let mock = MockBackend::new();
        let mut backends: BackendMap = HashMap::new();
        for kind in ActionKind::ALL {
            backends.insert(*kind, mock.clone() as Arc<dyn ResponseBackend>);
        }
        (backends, mock)
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..300 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_port_scan_end_to_end() {
        // Scenario: 200 SYN probes to 200 distinct ports within 2 seconds
        // from a host nobody has profiled
        let t0 = Utc::now();
        let records: Vec<PacketRecord> = (1..=200u16)
            .map(|port| {
                syn(
                    "192.168.1.66",
                    "192.168.1.10",
                    port,
                    t0 + chrono::Duration::milliseconds(port as i64 * 10),
                )
            })
            .collect();

        let (backends, _mock) = mock_backends();
        let store = Arc::new(EventStore::in_memory().unwrap());
        let cfg = MonitorConfig {
            dry_run: true,
            flow_idle_secs: 1,
            ..Default::default()
        };

        let mut pipeline = Pipeline::start(
            cfg,
            Box::new(MemorySource::new(records)),
            backends,
            vec![],
            store,
        )
        .unwrap();

        let status = pipeline.status_handle();
        let probe = status.clone();
        wait_for(move || {
            let s = probe.status();
            s.active_incidents > 0 || s.incidents_total > 0
        })
        .await;

        pipeline.finished().await;

        let view = status.view.read();
        let incident = view
            .incidents
            .iter()
            .find(|i| i.attack_type == AttackType::PortScan)
            .expect("port scan incident");
        assert!(incident.severity >= crate::logic::incident::Severity::Warning);

        drop(view);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_stable_traffic_creates_no_incident() {
        // Scenario: steady single flow at an ordinary rate
        let t0 = Utc::now();
        let mut records = Vec::new();
        for i in 0..1000i64 {
            let mut rec = syn("192.168.1.20", "192.168.1.10", 443, t0 + chrono::Duration::milliseconds(i * 100));
            rec.tcp_flags = Some(TcpFlags { ack: true, ..Default::default() });
            records.push(rec);
        }

        let (backends, mock) = mock_backends();
        let store = Arc::new(EventStore::in_memory().unwrap());
        let mut pipeline = Pipeline::start(
            MonitorConfig::default(),
            Box::new(MemorySource::new(records)),
            backends,
            vec![],
            store,
        )
        .unwrap();

        let status = pipeline.status_handle();
        pipeline.finished().await;

        let s = status.status();
        assert_eq!(s.incidents_total, 0, "steady traffic must not page anyone");
        assert!(s.packets_seen >= 1000);
        assert_eq!(mock.apply_count(), 0);

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_clean_mid_stream() {
        // A source that never ends; shutdown must still drain and stop
        let t0 = Utc::now();
        let records: Vec<PacketRecord> = (0..50_000i64)
            .map(|i| syn("10.5.0.1", "10.5.0.2", 443, t0 + chrono::Duration::milliseconds(i)))
            .collect();

        let (backends, _mock) = mock_backends();
        let store = Arc::new(EventStore::in_memory().unwrap());
        let pipeline = Pipeline::start(
            MonitorConfig::default(),
            Box::new(MemorySource::new(records)),
            backends,
            vec![],
            store,
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = pipeline.status_handle();
        pipeline.shutdown().await;

        assert!(!status.engine.status().accepting, "engine must be stopped");
    }

    #[tokio::test]
    async fn test_status_surfaces_counters() {
        let t0 = Utc::now();
        let mut records = vec![syn("10.6.0.1", "10.6.0.2", 443, t0)];
        // One malformed record (zero length) that must be counted, not fatal
        records.push(PacketRecord {
            length: 0,
            ..syn("10.6.0.1", "10.6.0.2", 443, t0)
        });

        let (backends, _mock) = mock_backends();
        let store = Arc::new(EventStore::in_memory().unwrap());
        let mut pipeline = Pipeline::start(
            MonitorConfig::default(),
            Box::new(MemorySource::new(records)),
            backends,
            vec![],
            store,
        )
        .unwrap();

        let status = pipeline.status_handle();
        pipeline.finished().await;

        let s = status.status();
        assert_eq!(s.packets_seen, 1);
        assert_eq!(s.malformed_dropped, 1);

        pipeline.shutdown().await;
    }
}
