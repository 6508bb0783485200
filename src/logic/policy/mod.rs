//! Response Policy Table
//!
//! Data, not code: an explicit `(severity, attack_type) -> ordered actions`
//! mapping loaded at startup and validated before the pipeline runs. An
//! entry naming an unknown severity, attack type, or action kind is a
//! configuration error, never a runtime surprise.

use std::collections::HashMap;

use crate::logic::config::ConfigError;
use crate::logic::detect::AttackType;
use crate::logic::incident::Severity;
use crate::logic::response::ActionKind;

// ============================================================================
// POLICY TABLE
// ============================================================================

#[derive(Debug, Clone)]
pub struct PolicyTable {
    rules: HashMap<(Severity, AttackType), Vec<ActionKind>>,
}

impl PolicyTable {
    /// Built-in policy, mirroring severity-proportional containment:
    /// warnings shape traffic, errors block, criticals quarantine.
    pub fn default_table() -> Self {
        let mut rules: HashMap<(Severity, AttackType), Vec<ActionKind>> = HashMap::new();

        use ActionKind::*;
        use AttackType::*;
        use Severity::*;

        for &attack in AttackType::ALL {
            rules.insert((Info, attack), vec![NotifyOnly]);
        }

        rules.insert((Warning, PortScan), vec![TrafficShape, NotifyOnly]);
        rules.insert((Warning, BruteForce), vec![TrafficShape, NotifyOnly]);
        rules.insert((Warning, Ddos), vec![TrafficShape, NotifyOnly]);
        rules.insert((Warning, DnsTunneling), vec![NotifyOnly]);
        rules.insert((Warning, Exfiltration), vec![TrafficShape, NotifyOnly]);
        rules.insert((Warning, Unknown), vec![NotifyOnly]);

        rules.insert((Error, PortScan), vec![FirewallBlock, NotifyOnly]);
        rules.insert((Error, BruteForce), vec![FirewallBlock, ConnectionReset, NotifyOnly]);
        rules.insert((Error, Ddos), vec![FirewallBlock, TrafficShape, NotifyOnly]);
        rules.insert((Error, DnsTunneling), vec![FirewallBlock, NotifyOnly]);
        rules.insert((Error, Exfiltration), vec![FirewallBlock, ConnectionReset, NotifyOnly]);
        rules.insert((Error, Unknown), vec![TrafficShape, NotifyOnly]);

        rules.insert((Critical, PortScan), vec![FirewallBlock, QuarantineVlan, NotifyOnly]);
        rules.insert((Critical, BruteForce), vec![FirewallBlock, ConnectionReset, QuarantineVlan, NotifyOnly]);
        rules.insert((Critical, Ddos), vec![FirewallBlock, TrafficShape, NotifyOnly]);
        rules.insert((Critical, DnsTunneling), vec![FirewallBlock, QuarantineVlan, NotifyOnly]);
        rules.insert((Critical, Exfiltration), vec![FirewallBlock, ConnectionReset, QuarantineVlan, NotifyOnly]);
        rules.insert((Critical, Unknown), vec![FirewallBlock, NotifyOnly]);

        Self { rules }
    }

    /// Build from configuration text keys, e.g. `"critical/port_scan"` ->
    /// `["firewall_block", "quarantine_vlan"]`. Unknown keys fail fast.
    pub fn from_config(
        entries: &HashMap<String, Vec<String>>,
    ) -> Result<Self, ConfigError> {
        let mut table = Self::default_table();

        for (key, action_names) in entries {
            let (severity_str, attack_str) = key.split_once('/').ok_or_else(|| {
                ConfigError::InvalidPolicy {
                    detail: format!("policy key '{}' is not '<severity>/<attack_type>'", key),
                }
            })?;

            let severity = Severity::from_str(severity_str).ok_or_else(|| {
                ConfigError::InvalidPolicy {
                    detail: format!("unknown severity '{}' in policy key '{}'", severity_str, key),
                }
            })?;
            let attack = AttackType::from_str(attack_str).ok_or_else(|| {
                ConfigError::InvalidPolicy {
                    detail: format!("unknown attack type '{}' in policy key '{}'", attack_str, key),
                }
            })?;

            let mut actions = Vec::with_capacity(action_names.len());
            for name in action_names {
                let kind = ActionKind::from_str(name).ok_or_else(|| {
                    ConfigError::InvalidPolicy {
                        detail: format!("unknown action type '{}' in policy key '{}'", name, key),
                    }
                })?;
                actions.push(kind);
            }

            table.rules.insert((severity, attack), actions);
        }

        Ok(table)
    }

    /// Ordered response actions for an incident's current classification.
    pub fn actions_for(&self, severity: Severity, attack: AttackType) -> &[ActionKind] {
        self.rules
            .get(&(severity, attack))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table_covers_all_cells() {
        let table = PolicyTable::default_table();
        for &severity in Severity::ALL {
            for &attack in AttackType::ALL {
                assert!(
                    !table.actions_for(severity, attack).is_empty(),
                    "missing policy for {:?}/{:?}",
                    severity,
                    attack
                );
            }
        }
    }

    #[test]
    fn test_critical_escalates_containment() {
        let table = PolicyTable::default_table();
        let actions = table.actions_for(Severity::Critical, AttackType::BruteForce);
        assert!(actions.contains(&ActionKind::FirewallBlock));
        assert!(actions.contains(&ActionKind::QuarantineVlan));
    }

    #[test]
    fn test_config_override() {
        let mut entries = HashMap::new();
        entries.insert(
            "warning/port_scan".to_string(),
            vec!["notify_only".to_string()],
        );
        let table = PolicyTable::from_config(&entries).unwrap();
        assert_eq!(
            table.actions_for(Severity::Warning, AttackType::PortScan),
            &[ActionKind::NotifyOnly]
        );
    }

    #[test]
    fn test_unknown_action_rejected() {
        let mut entries = HashMap::new();
        entries.insert(
            "warning/port_scan".to_string(),
            vec!["launch_missiles".to_string()],
        );
        assert!(PolicyTable::from_config(&entries).is_err());
    }

    #[test]
    fn test_malformed_key_rejected() {
        let mut entries = HashMap::new();
        entries.insert("warning".to_string(), vec!["notify_only".to_string()]);
        assert!(PolicyTable::from_config(&entries).is_err());

        let mut entries = HashMap::new();
        entries.insert("loud/port_scan".to_string(), vec!["notify_only".to_string()]);
        assert!(PolicyTable::from_config(&entries).is_err());
    }
}
