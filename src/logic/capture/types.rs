//! Capture Types - Normalized packet and flow records
//!
//! The capture backend (live NIC, pcap replay) lives outside the core; it
//! hands us decoded `PacketRecord`s through the `PacketSource` trait.

use std::net::{IpAddr, Ipv4Addr};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// PROTOCOL
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Other(u8),
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
            Protocol::Other(_) => "other",
        }
    }
}

// ============================================================================
// TCP FLAGS
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
    pub urg: bool,
}

impl TcpFlags {
    pub fn syn_only() -> Self {
        Self { syn: true, ..Default::default() }
    }

    /// Flow-terminating flags
    pub fn is_teardown(&self) -> bool {
        self.fin || self.rst
    }
}

// ============================================================================
// PACKET RECORD
// ============================================================================

/// One observed packet, produced once by the capture boundary. Immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketRecord {
    pub ts: DateTime<Utc>,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: Protocol,
    pub length: u32,
    #[serde(default)]
    pub tcp_flags: Option<TcpFlags>,
    /// Query name for UDP/53 traffic, when the backend decoded it
    #[serde(default)]
    pub dns_query: Option<String>,
}

// ============================================================================
// FLOW KEY
// ============================================================================

/// Canonical 5-tuple. Both directions of a flow map to the same key; the
/// initiating endpoint is recovered from the first packet seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowKey {
    pub ip_a: IpAddr,
    pub port_a: u16,
    pub ip_b: IpAddr,
    pub port_b: u16,
    pub protocol: Protocol,
}

impl FlowKey {
    pub fn from_record(rec: &PacketRecord) -> Self {
        let fwd = (rec.src_ip, rec.src_port) <= (rec.dst_ip, rec.dst_port);
        if fwd {
            Self {
                ip_a: rec.src_ip,
                port_a: rec.src_port,
                ip_b: rec.dst_ip,
                port_b: rec.dst_port,
                protocol: rec.protocol,
            }
        } else {
            Self {
                ip_a: rec.dst_ip,
                port_a: rec.dst_port,
                ip_b: rec.src_ip,
                port_b: rec.src_port,
                protocol: rec.protocol,
            }
        }
    }
}

// ============================================================================
// FLOW REFERENCE
// ============================================================================

/// Directionful flow identity carried with every feature vector and anomaly
/// score, so incidents can attribute source and target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowRef {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: Protocol,
}

impl FlowRef {
    pub fn from_record(rec: &PacketRecord) -> Self {
        Self {
            src_ip: rec.src_ip,
            dst_ip: rec.dst_ip,
            src_port: rec.src_port,
            dst_port: rec.dst_port,
            protocol: rec.protocol,
        }
    }
}

impl Default for FlowRef {
    fn default() -> Self {
        Self {
            src_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dst_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            src_port: 0,
            dst_port: 0,
            protocol: Protocol::Other(0),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(src: &str, sport: u16, dst: &str, dport: u16) -> PacketRecord {
        PacketRecord {
            ts: Utc::now(),
            src_ip: src.parse().unwrap(),
            dst_ip: dst.parse().unwrap(),
            src_port: sport,
            dst_port: dport,
            protocol: Protocol::Tcp,
            length: 60,
            tcp_flags: Some(TcpFlags::syn_only()),
            dns_query: None,
        }
    }

    #[test]
    fn test_flow_key_bidirectional() {
        let fwd = record("10.0.0.1", 50000, "10.0.0.2", 443);
        let rev = record("10.0.0.2", 443, "10.0.0.1", 50000);
        assert_eq!(FlowKey::from_record(&fwd), FlowKey::from_record(&rev));
    }

    #[test]
    fn test_flow_ref_keeps_direction() {
        let fwd = record("10.0.0.1", 50000, "10.0.0.2", 443);
        let r = FlowRef::from_record(&fwd);
        assert_eq!(r.src_port, 50000);
        assert_eq!(r.dst_port, 443);
    }
}
