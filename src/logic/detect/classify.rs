//! Attack Classification - rule table over triggered features
//!
//! Deterministic mapping from what tripped the statistical scorer plus the
//! flow's shape to an attack type. First matching rule wins; the order goes
//! from the most specific signature to the most generic.

use crate::logic::capture::{FlowRef, Protocol};
use crate::logic::features::FeatureVector;
use super::types::AttackType;

/// Ports where repeated hammering reads as credential guessing
pub const AUTH_PORTS: &[u16] = &[22, 23, 3389, 445, 135, 139, 1433, 3306, 5432];

/// Rule thresholds
const PORT_SCAN_MIN_PORTS: f32 = 20.0;
const PORT_SCAN_MAX_DURATION: f32 = 5.0;
const BRUTE_FORCE_MIN_RATE: f32 = 5.0;
const DNS_TUNNEL_MIN_RATE: f32 = 50.0;
const DNS_TUNNEL_MIN_QUERY_LEN: f32 = 50.0;
const DDOS_MIN_RATE: f32 = 100.0;
const EXFIL_MIN_BYTE_RATE: f32 = 100_000.0;
const EXFIL_MIN_DURATION: f32 = 10.0;

/// A fixed-threshold rule match. These fire from the very first vector -
/// no baseline required - so a scan from a never-seen host is still caught.
#[derive(Debug, Clone)]
pub struct Signature {
    pub attack: AttackType,
    pub score: f32,
    pub reason: String,
}

/// Fixed-threshold attack signatures, first match wins. The magnitude
/// scaling (ports/100, rate/1000, ...) keeps small brushes sub-threshold
/// while real attacks saturate.
pub fn signature(flow: &FlowRef, vector: &FeatureVector) -> Option<Signature> {
    let get = |name: &str| vector.get_by_name(name).unwrap_or(0.0);

    let ports = get("unique_dst_ports");
    if ports >= PORT_SCAN_MIN_PORTS
        && get("syn_ratio") >= 0.5
        && get("duration_secs") <= PORT_SCAN_MAX_DURATION
    {
        return Some(Signature {
            attack: AttackType::PortScan,
            score: (ports / 100.0).clamp(0.5, 1.0),
            reason: format!("{} distinct ports probed", ports as u32),
        });
    }

    let rate = get("pkt_rate");
    let dns_len = get("mean_dns_query_len");
    if flow.dst_port == 53
        && flow.protocol == Protocol::Udp
        && (rate >= DNS_TUNNEL_MIN_RATE || dns_len >= DNS_TUNNEL_MIN_QUERY_LEN)
    {
        return Some(Signature {
            attack: AttackType::DnsTunneling,
            score: (0.5 + rate / 200.0 + dns_len / 200.0).min(1.0),
            reason: format!("{:.0} DNS queries/s, mean length {:.0}", rate, dns_len),
        });
    }

    if AUTH_PORTS.contains(&flow.dst_port) && rate >= BRUTE_FORCE_MIN_RATE {
        return Some(Signature {
            attack: AttackType::BruteForce,
            score: (rate / 25.0).clamp(0.4, 1.0),
            reason: format!("{:.0} attempts/s against port {}", rate, flow.dst_port),
        });
    }

    if rate >= DDOS_MIN_RATE {
        return Some(Signature {
            attack: AttackType::Ddos,
            score: (rate / 1000.0).clamp(0.5, 1.0),
            reason: format!("{:.0} packets/s flood", rate),
        });
    }

    let byte_rate = get("byte_rate");
    if byte_rate >= EXFIL_MIN_BYTE_RATE && get("duration_secs") >= EXFIL_MIN_DURATION {
        return Some(Signature {
            attack: AttackType::Exfiltration,
            score: (byte_rate / 1_000_000.0).clamp(0.5, 1.0),
            reason: format!("sustained {:.0} B/s outbound", byte_rate),
        });
    }

    None
}

/// Attack type for a vector: a signature match wins, otherwise the
/// features that tripped the statistical scorer decide.
pub fn classify(flow: &FlowRef, vector: &FeatureVector, triggered: &[String]) -> AttackType {
    if let Some(sig) = signature(flow, vector) {
        return sig.attack;
    }

    let get = |name: &str| vector.get_by_name(name).unwrap_or(0.0);
    let tripped = |name: &str| triggered.iter().any(|t| t == name);

    if tripped("unique_dst_ports") || tripped("dst_port_entropy") {
        return AttackType::PortScan;
    }
    if flow.dst_port == 53
        && flow.protocol == Protocol::Udp
        && (tripped("pkt_rate") || tripped("byte_rate"))
    {
        return AttackType::DnsTunneling;
    }
    if AUTH_PORTS.contains(&flow.dst_port) && tripped("pkt_rate") {
        return AttackType::BruteForce;
    }
    if tripped("pkt_rate") && tripped("byte_rate") {
        return AttackType::Ddos;
    }
    if tripped("byte_rate") && get("duration_secs") >= EXFIL_MIN_DURATION {
        return AttackType::Exfiltration;
    }

    AttackType::Unknown
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::features::layout::feature_index;

    fn flow(dst_port: u16, protocol: Protocol) -> FlowRef {
        FlowRef {
            src_ip: "10.0.0.1".parse().unwrap(),
            dst_ip: "10.0.0.2".parse().unwrap(),
            src_port: 40000,
            dst_port,
            protocol,
        }
    }

    fn vector(pairs: &[(&str, f32)]) -> FeatureVector {
        let mut v = FeatureVector::new();
        for (name, value) in pairs {
            v.set(feature_index(name).unwrap(), *value);
        }
        v
    }

    #[test]
    fn test_port_scan_shape() {
        let v = vector(&[
            ("unique_dst_ports", 200.0),
            ("syn_ratio", 1.0),
            ("duration_secs", 2.0),
        ]);
        assert_eq!(classify(&flow(8080, Protocol::Tcp), &v, &[]), AttackType::PortScan);
    }

    #[test]
    fn test_brute_force_on_ssh() {
        let v = vector(&[("pkt_rate", 20.0)]);
        assert_eq!(classify(&flow(22, Protocol::Tcp), &v, &[]), AttackType::BruteForce);
    }

    #[test]
    fn test_dns_tunneling_by_rate() {
        let v = vector(&[("pkt_rate", 80.0)]);
        assert_eq!(classify(&flow(53, Protocol::Udp), &v, &[]), AttackType::DnsTunneling);
    }

    #[test]
    fn test_dns_tunneling_by_query_length() {
        // Slow but with oversized encoded labels
        let v = vector(&[("pkt_rate", 2.0), ("mean_dns_query_len", 120.0)]);
        assert_eq!(classify(&flow(53, Protocol::Udp), &v, &[]), AttackType::DnsTunneling);
    }

    #[test]
    fn test_ddos_volume() {
        let v = vector(&[("pkt_rate", 5000.0)]);
        assert_eq!(classify(&flow(80, Protocol::Tcp), &v, &[]), AttackType::Ddos);
    }

    #[test]
    fn test_exfiltration_sustained_transfer() {
        let v = vector(&[("byte_rate", 500_000.0), ("duration_secs", 60.0)]);
        assert_eq!(classify(&flow(443, Protocol::Tcp), &v, &[]), AttackType::Exfiltration);
    }

    #[test]
    fn test_quiet_flow_is_unknown() {
        let v = vector(&[("pkt_rate", 2.0)]);
        assert_eq!(classify(&flow(443, Protocol::Tcp), &v, &[]), AttackType::Unknown);
    }

    #[test]
    fn test_signature_scales_with_magnitude() {
        let small = vector(&[
            ("unique_dst_ports", 25.0),
            ("syn_ratio", 1.0),
            ("duration_secs", 1.0),
        ]);
        let large = vector(&[
            ("unique_dst_ports", 200.0),
            ("syn_ratio", 1.0),
            ("duration_secs", 1.0),
        ]);
        let f = flow(8080, Protocol::Tcp);

        let small_sig = signature(&f, &small).unwrap();
        let large_sig = signature(&f, &large).unwrap();
        assert!(small_sig.score < large_sig.score);
        assert_eq!(large_sig.score, 1.0);
    }

    #[test]
    fn test_no_signature_without_attack_shape() {
        let v = vector(&[("pkt_rate", 3.0), ("byte_rate", 500.0)]);
        assert!(signature(&flow(443, Protocol::Tcp), &v).is_none());
    }

    #[test]
    fn test_trigger_fallback_classification() {
        let v = vector(&[("duration_secs", 30.0)]);
        let attack = classify(
            &flow(443, Protocol::Tcp),
            &v,
            &["byte_rate".to_string()],
        );
        assert_eq!(attack, AttackType::Exfiltration);
    }
}
