//! Response Backends - pluggable enforcement
//!
//! Each backend knows how to apply one class of containment and how to undo
//! it. The engine owns timing, retries, and rollback; backends only talk to
//! the enforcement plane (iptables, tc, switch API, conntrack).

use std::collections::HashMap;
use std::process::Command;
use std::sync::Arc;

#[cfg(test)]
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::types::{ActionKind, ActionRequest};

// ============================================================================
// BACKEND ERROR
// ============================================================================

#[derive(Debug, Clone)]
pub struct BackendError(pub String);

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BackendError {}

// ============================================================================
// TRAIT
// ============================================================================

pub trait ResponseBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Apply the enforcement. Returns a human-readable detail for the audit
    /// record.
    fn apply(&self, req: &ActionRequest) -> Result<String, BackendError>;

    /// Inverse operation (unblock, restore bandwidth, remove quarantine).
    fn revert(&self, req: &ActionRequest) -> Result<String, BackendError>;
}

/// The full backend set the engine dispatches over.
pub type BackendMap = HashMap<ActionKind, Arc<dyn ResponseBackend>>;

/// Standard system-command backends for every action kind.
pub fn system_backends(quarantine_vlan: u16, bandwidth_limit: &str) -> BackendMap {
    let mut map: BackendMap = HashMap::new();
    map.insert(ActionKind::FirewallBlock, Arc::new(IptablesBackend));
    map.insert(
        ActionKind::TrafficShape,
        Arc::new(TrafficControlBackend { default_limit: bandwidth_limit.to_string() }),
    );
    map.insert(
        ActionKind::QuarantineVlan,
        Arc::new(QuarantineBackend { vlan_id: quarantine_vlan }),
    );
    map.insert(ActionKind::ConnectionReset, Arc::new(ConnResetBackend));
    map.insert(ActionKind::NotifyOnly, Arc::new(NotifyOnlyBackend));
    map
}

// ============================================================================
// COMMAND HELPER
// ============================================================================

fn run_command(program: &str, args: &[&str]) -> Result<String, BackendError> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| BackendError(format!("failed to run {}: {}", program, e)))?;

    if output.status.success() {
        Ok(format!("{} {}", program, args.join(" ")))
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(BackendError(format!(
            "{} exited {}: {}",
            program,
            output.status.code().unwrap_or(-1),
            stderr.trim()
        )))
    }
}

// ============================================================================
// FIREWALL (iptables)
// ============================================================================

pub struct IptablesBackend;

impl ResponseBackend for IptablesBackend {
    fn name(&self) -> &'static str {
        "iptables"
    }

    fn apply(&self, req: &ActionRequest) -> Result<String, BackendError> {
        let ip = req.target.ip.to_string();
        let mut args: Vec<&str> = vec!["-I", "INPUT", "-s", &ip, "-j", "DROP"];
        let port;
        if let Some(p) = req.target.port {
            port = p.to_string();
            args.extend_from_slice(&["-p", "tcp", "--dport", &port]);
        }
        run_command("iptables", &args)
    }

    fn revert(&self, req: &ActionRequest) -> Result<String, BackendError> {
        let ip = req.target.ip.to_string();
        let mut args: Vec<&str> = vec!["-D", "INPUT", "-s", &ip, "-j", "DROP"];
        let port;
        if let Some(p) = req.target.port {
            port = p.to_string();
            args.extend_from_slice(&["-p", "tcp", "--dport", &port]);
        }
        run_command("iptables", &args)
    }
}

// ============================================================================
// TRAFFIC SHAPING (tc)
// ============================================================================

pub struct TrafficControlBackend {
    default_limit: String,
}

impl ResponseBackend for TrafficControlBackend {
    fn name(&self) -> &'static str {
        "tc"
    }

    fn apply(&self, req: &ActionRequest) -> Result<String, BackendError> {
        let iface = req
            .params
            .get("interface")
            .map(String::as_str)
            .unwrap_or("eth0");
        let limit = req
            .params
            .get("bandwidth_limit")
            .cloned()
            .unwrap_or_else(|| self.default_limit.clone());
        let ip = req.target.ip.to_string();

        run_command("tc", &["qdisc", "add", "dev", iface, "root", "handle", "1:", "htb"])?;
        run_command(
            "tc",
            &["class", "add", "dev", iface, "parent", "1:", "classid", "1:1", "htb", "rate", &limit],
        )?;
        run_command(
            "tc",
            &[
                "filter", "add", "dev", iface, "protocol", "ip", "parent", "1:0", "prio", "1",
                "u32", "match", "ip", "src", &ip, "flowid", "1:1",
            ],
        )
    }

    fn revert(&self, req: &ActionRequest) -> Result<String, BackendError> {
        let iface = req
            .params
            .get("interface")
            .map(String::as_str)
            .unwrap_or("eth0");
        // Deleting the qdisc removes the class and filter with it
        run_command("tc", &["qdisc", "del", "dev", iface, "root"])
    }
}

// ============================================================================
// QUARANTINE VLAN
// ============================================================================

/// Reassigns the host's switch port to the quarantine VLAN. The concrete
/// switch integration is deployment-specific; the hook script receives the
/// target and VLAN id.
pub struct QuarantineBackend {
    vlan_id: u16,
}

impl ResponseBackend for QuarantineBackend {
    fn name(&self) -> &'static str {
        "quarantine"
    }

    fn apply(&self, req: &ActionRequest) -> Result<String, BackendError> {
        let vlan = self.vlan_id.to_string();
        run_command(
            "net-quarantine",
            &["assign", &req.target.ip.to_string(), "--vlan", &vlan],
        )
    }

    fn revert(&self, req: &ActionRequest) -> Result<String, BackendError> {
        run_command("net-quarantine", &["release", &req.target.ip.to_string()])
    }
}

// ============================================================================
// CONNECTION RESET (ss -K)
// ============================================================================

pub struct ConnResetBackend;

impl ResponseBackend for ConnResetBackend {
    fn name(&self) -> &'static str {
        "conn_reset"
    }

    fn apply(&self, req: &ActionRequest) -> Result<String, BackendError> {
        let ip = req.target.ip.to_string();
        match req.target.port {
            Some(p) => {
                let port = format!("= {}", p);
                run_command("ss", &["-K", "dst", &ip, "dport", &port])
            }
            None => run_command("ss", &["-K", "dst", &ip]),
        }
    }

    fn revert(&self, _req: &ActionRequest) -> Result<String, BackendError> {
        // A reset has no inverse; rollback is bookkeeping only
        Ok("nothing to revert".to_string())
    }
}

// ============================================================================
// NOTIFY ONLY
// ============================================================================

pub struct NotifyOnlyBackend;

impl ResponseBackend for NotifyOnlyBackend {
    fn name(&self) -> &'static str {
        "notify_only"
    }

    fn apply(&self, req: &ActionRequest) -> Result<String, BackendError> {
        log::info!(
            "Notify-only action for incident {} target {}",
            req.incident_id,
            req.target
        );
        Ok("logged".to_string())
    }

    fn revert(&self, _req: &ActionRequest) -> Result<String, BackendError> {
        Ok("nothing to revert".to_string())
    }
}

// ============================================================================
// MOCK BACKEND (tests)
// ============================================================================

/// Counting backend with failure injection, shared by the engine and
/// orchestrator tests.
#[cfg(test)]
pub struct MockBackend {
    pub applies: AtomicUsize,
    pub reverts: AtomicUsize,
    pub fail_apply: AtomicBool,
}

#[cfg(test)]
impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            applies: AtomicUsize::new(0),
            reverts: AtomicUsize::new(0),
            fail_apply: AtomicBool::new(false),
        })
    }

    pub fn apply_count(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }

    pub fn revert_count(&self) -> usize {
        self.reverts.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_apply.store(failing, Ordering::SeqCst);
    }
}

#[cfg(test)]
impl ResponseBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn apply(&self, _req: &ActionRequest) -> Result<String, BackendError> {
        self.applies.fetch_add(1, Ordering::SeqCst);
        if self.fail_apply.load(Ordering::SeqCst) {
            Err(BackendError("injected failure".to_string()))
        } else {
            Ok("applied".to_string())
        }
    }

    fn revert(&self, _req: &ActionRequest) -> Result<String, BackendError> {
        self.reverts.fetch_add(1, Ordering::SeqCst);
        Ok("reverted".to_string())
    }
}
