//! Monitor Configuration
//!
//! One serde struct for the whole pipeline, validated before anything
//! starts. Invalid thresholds or a policy entry naming an unknown action
//! kind abort startup - a bad config must never reach the packet path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};

use crate::logic::incident::Severity;

// ============================================================================
// ERROR HANDLING
// ============================================================================

/// Fatal at startup only.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(String),
    InvalidThreshold { name: &'static str, value: f32 },
    InvalidValue { name: &'static str, detail: String },
    InvalidPolicy { detail: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "config i/o error: {}", e),
            ConfigError::Parse(e) => write!(f, "config parse error: {}", e),
            ConfigError::InvalidThreshold { name, value } => {
                write!(f, "threshold '{}' out of range [0,1]: {}", name, value)
            }
            ConfigError::InvalidValue { name, detail } => {
                write!(f, "invalid '{}': {}", name, detail)
            }
            ConfigError::InvalidPolicy { detail } => write!(f, "invalid policy table: {}", detail),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    // Capture boundary (opaque pass-through to the packet source)
    pub interface: String,
    pub filter: String,
    /// Stop ingesting after this many seconds (None = until end of stream)
    pub capture_duration_secs: Option<u64>,

    // Feature extraction
    pub max_tracked_flows: usize,
    pub flow_idle_secs: u64,
    pub flow_window_secs: u64,
    pub host_window_secs: u64,

    // Profiling
    pub profile_decay: f32,
    pub profile_min_samples: u64,
    pub max_profiled_hosts: usize,

    // Detection
    pub z_threshold: f32,
    pub anomaly_threshold: f32,
    pub confidence_threshold: f32,
    pub model_update_interval_secs: u64,

    // Orchestration
    pub response_threshold: f32,
    pub incident_quiet_secs: i64,
    pub incident_max_age_secs: i64,

    // Response engine
    pub max_concurrent_actions: usize,
    pub max_actions_per_minute: u32,
    pub dry_run: bool,
    pub action_default_timeout_secs: u64,
    pub backend_timeout_secs: u64,
    pub backend_max_retries: u32,
    pub quarantine_vlan_id: u16,
    pub bandwidth_limit: String,

    // Plumbing
    pub queue_size: usize,
    pub notify_queue_size: usize,
    pub notify_timeout_secs: u64,
    pub webhook_url: Option<String>,
    pub webhook_min_severity: String,
    pub db_path: Option<PathBuf>,

    /// Overrides for the response policy table, keyed
    /// `"<severity>/<attack_type>"` with ordered action-kind lists
    pub policy: HashMap<String, Vec<String>>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interface: "any".to_string(),
            filter: String::new(),
            capture_duration_secs: None,

            max_tracked_flows: 4096,
            flow_idle_secs: 30,
            flow_window_secs: 10,
            host_window_secs: 60,

            profile_decay: 0.05,
            profile_min_samples: 30,
            max_profiled_hosts: 4096,

            z_threshold: 3.0,
            anomaly_threshold: 0.7,
            confidence_threshold: 0.6,
            model_update_interval_secs: 300,

            response_threshold: 0.8,
            incident_quiet_secs: 300,
            incident_max_age_secs: 3600,

            max_concurrent_actions: 10,
            max_actions_per_minute: 60,
            dry_run: false,
            action_default_timeout_secs: 300,
            backend_timeout_secs: 5,
            backend_max_retries: 2,
            quarantine_vlan_id: 666,
            bandwidth_limit: "1mbit".to_string(),

            queue_size: 1024,
            notify_queue_size: 256,
            notify_timeout_secs: 5,
            webhook_url: None,
            webhook_min_severity: "error".to_string(),
            db_path: None,

            policy: HashMap::new(),
        }
    }
}

impl MonitorConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let cfg: MonitorConfig =
            serde_json::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("anomaly_threshold", self.anomaly_threshold),
            ("confidence_threshold", self.confidence_threshold),
            ("response_threshold", self.response_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidThreshold { name, value });
            }
        }

        if self.z_threshold <= 0.0 {
            return Err(ConfigError::InvalidValue {
                name: "z_threshold",
                detail: "must be positive".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.profile_decay) || self.profile_decay == 0.0 {
            return Err(ConfigError::InvalidValue {
                name: "profile_decay",
                detail: format!("must be in (0,1], got {}", self.profile_decay),
            });
        }
        if self.max_concurrent_actions == 0 {
            return Err(ConfigError::InvalidValue {
                name: "max_concurrent_actions",
                detail: "must be at least 1".to_string(),
            });
        }
        if self.model_update_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                name: "model_update_interval_secs",
                detail: "must be at least 1".to_string(),
            });
        }
        if self.queue_size == 0 {
            return Err(ConfigError::InvalidValue {
                name: "queue_size",
                detail: "must be at least 1".to_string(),
            });
        }

        self.webhook_severity()?;

        // Policy keys and action kinds must resolve before startup
        crate::logic::policy::PolicyTable::from_config(&self.policy).map(|_| ())
    }

    pub fn webhook_severity(&self) -> Result<Severity, ConfigError> {
        Severity::from_str(&self.webhook_min_severity).ok_or_else(|| ConfigError::InvalidValue {
            name: "webhook_min_severity",
            detail: format!("unknown severity '{}'", self.webhook_min_severity),
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(MonitorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_bad_threshold_rejected() {
        let cfg = MonitorConfig { anomaly_threshold: 1.5, ..Default::default() };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidThreshold { name: "anomaly_threshold", .. })
        ));
    }

    #[test]
    fn test_unknown_policy_action_rejected() {
        let mut cfg = MonitorConfig::default();
        cfg.policy.insert(
            "critical/ddos".to_string(),
            vec!["format_disk".to_string()],
        );
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidPolicy { .. })));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let cfg = MonitorConfig { max_concurrent_actions: 0, ..Default::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let cfg = MonitorConfig { dry_run: true, ..Default::default() };
        std::fs::write(&path, serde_json::to_string_pretty(&cfg).unwrap()).unwrap();

        let loaded = MonitorConfig::load(&path).unwrap();
        assert!(loaded.dry_run);
        assert_eq!(loaded.interface, "any");
    }
}
