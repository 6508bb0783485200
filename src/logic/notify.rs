//! Incident Notification - bounded fan-out
//!
//! Subscribers (log line, webhook, SIEM forwarder) get every incident state
//! transition, best-effort. The hub is a bounded queue with one worker and
//! a per-subscriber timeout: a slow or dead webhook can cost its own
//! timeout budget, never the pipeline's. Overflow drops are counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::logic::incident::{Incident, Severity};

/// Resolved once; webhook payloads carry it on every transition
static HOSTNAME: Lazy<Option<String>> =
    Lazy::new(|| hostname::get().ok().map(|h| h.to_string_lossy().to_string()));

// ============================================================================
// ERROR HANDLING
// ============================================================================

#[derive(Debug)]
pub struct NotifyError(pub String);

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for NotifyError {}

// ============================================================================
// SUBSCRIBER TRAIT
// ============================================================================

pub trait IncidentNotifier: Send + Sync {
    fn name(&self) -> &'static str;
    fn notify(&self, incident: &Incident) -> Result<(), NotifyError>;
}

// ============================================================================
// LOG NOTIFIER
// ============================================================================

pub struct LogNotifier;

impl IncidentNotifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    fn notify(&self, incident: &Incident) -> Result<(), NotifyError> {
        log::warn!(
            "[INCIDENT {}] {} - {}",
            incident.state.as_str().to_uppercase(),
            incident.id,
            incident.describe()
        );
        Ok(())
    }
}

// ============================================================================
// WEBHOOK NOTIFIER
// ============================================================================

pub struct WebhookNotifier {
    url: String,
    min_severity: Severity,
}

impl WebhookNotifier {
    pub fn new(url: String, min_severity: Severity) -> Self {
        Self { url, min_severity }
    }

    fn payload(incident: &Incident) -> serde_json::Value {
        serde_json::json!({
            "incident_id": incident.id,
            "state": incident.state.as_str(),
            "severity": incident.severity.as_str(),
            "attack_type": incident.attack_type.as_str(),
            "source": incident.source,
            "target": incident.target,
            "opened_at": incident.opened_at.to_rfc3339(),
            "last_seen": incident.last_seen.to_rfc3339(),
            "score_count": incident.scores.len(),
            "description": incident.describe(),
            "hostname": HOSTNAME.clone(),
        })
    }
}

impl IncidentNotifier for WebhookNotifier {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn notify(&self, incident: &Incident) -> Result<(), NotifyError> {
        if incident.severity < self.min_severity {
            return Ok(());
        }

        let body = Self::payload(incident).to_string();
        ureq::post(&self.url)
            .set("Content-Type", "application/json")
            .send_string(&body)
            .map_err(|e| NotifyError(e.to_string()))?;
        Ok(())
    }
}

// ============================================================================
// NOTIFY HUB
// ============================================================================

#[derive(Clone)]
pub struct NotifyHub {
    tx: mpsc::Sender<Incident>,
    dropped: Arc<AtomicU64>,
}

impl NotifyHub {
    /// Start the fan-out worker. Dropping every `NotifyHub` clone closes the
    /// queue; await the returned handle to flush on shutdown.
    pub fn start(
        subscribers: Vec<Arc<dyn IncidentNotifier>>,
        queue_size: usize,
        per_subscriber_timeout: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Incident>(queue_size.max(1));
        let dropped = Arc::new(AtomicU64::new(0));

        let handle = tokio::spawn(async move {
            while let Some(incident) = rx.recv().await {
                for subscriber in &subscribers {
                    let sub = Arc::clone(subscriber);
                    let inc = incident.clone();
                    let result = tokio::time::timeout(
                        per_subscriber_timeout,
                        tokio::task::spawn_blocking(move || sub.notify(&inc)),
                    )
                    .await;

                    match result {
                        Ok(Ok(Ok(()))) => {}
                        Ok(Ok(Err(e))) => {
                            log::warn!("Notifier '{}' failed: {}", subscriber.name(), e)
                        }
                        Ok(Err(e)) => log::warn!("Notifier '{}' panicked: {}", subscriber.name(), e),
                        Err(_) => log::warn!(
                            "Notifier '{}' timed out after {:?}",
                            subscriber.name(),
                            per_subscriber_timeout
                        ),
                    }
                }
            }
            log::debug!("Notify hub drained");
        });

        (Self { tx, dropped }, handle)
    }

    /// Best-effort publish. A full queue drops the event (counted) rather
    /// than blocking incident processing.
    pub fn publish(&self, incident: &Incident) {
        if self.tx.try_send(incident.clone()).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            log::warn!("Notify queue full, dropped transition for incident {}", incident.id);
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Shared overflow counter, readable after the hub moves into the
    /// orchestrator
    pub fn dropped_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::capture::FlowRef;
    use crate::logic::detect::{AnomalyScore, AttackType, ScoreMethod};
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;

    struct CountingNotifier {
        calls: AtomicUsize,
        fail: bool,
    }

    impl IncidentNotifier for CountingNotifier {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn notify(&self, _incident: &Incident) -> Result<(), NotifyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(NotifyError("boom".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn incident() -> Incident {
        Incident::new(AnomalyScore {
            score: 0.9,
            confidence: 0.8,
            method: ScoreMethod::Statistical,
            attack_type: AttackType::PortScan,
            explanation: String::new(),
            triggered: vec![],
            flow: FlowRef::default(),
            observed_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_fanout_reaches_all_subscribers() {
        let a = Arc::new(CountingNotifier { calls: AtomicUsize::new(0), fail: false });
        let b = Arc::new(CountingNotifier { calls: AtomicUsize::new(0), fail: true });

        let (hub, handle) = NotifyHub::start(
            vec![a.clone(), b.clone()],
            16,
            Duration::from_secs(1),
        );

        hub.publish(&incident());
        hub.publish(&incident());
        drop(hub);
        handle.await.unwrap();

        assert_eq!(a.calls.load(Ordering::SeqCst), 2);
        // A failing subscriber still gets every event and never blocks others
        assert_eq!(b.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_full_queue_drops_and_counts() {
        // No worker consuming: spawn with a subscriber that blocks forever is
        // complex; instead use capacity 1 and publish before the worker runs.
        let slow = Arc::new(CountingNotifier { calls: AtomicUsize::new(0), fail: false });
        let (hub, _handle) = NotifyHub::start(vec![slow], 1, Duration::from_secs(1));

        for _ in 0..50 {
            hub.publish(&incident());
        }
        assert!(hub.dropped_count() > 0, "overflow must be counted, not silent");
    }
}
