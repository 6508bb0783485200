//! Feature Extractor - packets in, feature vectors out
//!
//! Aggregates `PacketRecord`s into per-flow stats and emits a versioned
//! `FeatureVector` when a flow closes (FIN/RST), goes idle, or crosses the
//! sliding-window boundary of a long-lived flow. The dual trigger catches
//! slow scans without letting long transfers pin memory.

use std::collections::HashMap;
use std::net::IpAddr;
use chrono::{DateTime, Timelike, Utc};

use crate::logic::capture::{FlowKey, PacketRecord, Protocol};
use super::flow::{FlowStats, FlowTable, HostWindow};
use super::vector::{FeatureVector, FlowFeatures};

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub max_tracked_flows: usize,
    pub flow_idle_secs: u64,
    pub flow_window_secs: u64,
    pub host_window_secs: u64,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            max_tracked_flows: 4096,
            flow_idle_secs: 30,
            flow_window_secs: 10,
            host_window_secs: 60,
        }
    }
}

// ============================================================================
// EXTRACTOR
// ============================================================================

pub struct FeatureExtractor {
    cfg: ExtractorConfig,
    table: FlowTable,
    hosts: HashMap<IpAddr, HostWindow>,
    pub packets_seen: u64,
    pub malformed_dropped: u64,
    pub vectors_emitted: u64,
}

impl FeatureExtractor {
    pub fn new(cfg: ExtractorConfig) -> Self {
        let table = FlowTable::new(cfg.max_tracked_flows);
        Self {
            cfg,
            table,
            hosts: HashMap::new(),
            packets_seen: 0,
            malformed_dropped: 0,
            vectors_emitted: 0,
        }
    }

    /// Process one record. May emit zero, one, or two vectors (a table
    /// eviction plus the record's own flow closing). Malformed records are
    /// dropped and counted, never surfaced as errors.
    pub fn ingest(&mut self, rec: &PacketRecord) -> Vec<FlowFeatures> {
        if let Err(reason) = validate(rec) {
            self.malformed_dropped += 1;
            log::debug!("Dropped malformed record: {}", reason);
            return Vec::new();
        }

        self.packets_seen += 1;
        let mut emitted = Vec::new();

        // Per-source rolling window, bounded like the flow table so a
        // spoofed-source flood cannot grow the map
        if self.hosts.len() >= self.cfg.max_tracked_flows && !self.hosts.contains_key(&rec.src_ip)
        {
            if let Some(oldest) = self
                .hosts
                .iter()
                .min_by_key(|(_, w)| w.started)
                .map(|(ip, _)| *ip)
            {
                self.hosts.remove(&oldest);
            }
        }
        let window_secs = self.cfg.host_window_secs as i64;
        let win = self
            .hosts
            .entry(rec.src_ip)
            .or_insert_with(|| HostWindow::new(rec.ts));
        if (rec.ts - win.started).num_seconds() >= window_secs {
            win.reset(rec.ts);
        }
        win.observe(rec);

        // Flow table update; a full table rotates out the oldest-idle flow
        if let Some(evicted) = self.table.observe(rec) {
            emitted.push(self.finalize(evicted, rec.ts));
        }

        let key = FlowKey::from_record(rec);
        let teardown = rec.tcp_flags.map(|f| f.is_teardown()).unwrap_or(false);

        if teardown {
            if let Some(stats) = self.table.take(&key) {
                emitted.push(self.finalize(stats, rec.ts));
            }
        } else if let Some(stats) = self.table.get_mut(&key) {
            // Sliding window boundary for long-lived flows
            if (rec.ts - stats.window_started).num_seconds() >= self.cfg.flow_window_secs as i64 {
                stats.window_started = rec.ts;
                let snapshot = stats.clone();
                emitted.push(self.finalize(snapshot, rec.ts));
            }
        }

        emitted
    }

    /// Emit vectors for flows idle past the timeout. Driven by the pipeline
    /// on a timer so quiet flows still close.
    pub fn sweep_idle(&mut self, now: DateTime<Utc>) -> Vec<FlowFeatures> {
        let expired = self.table.sweep_idle(now, self.cfg.flow_idle_secs);
        expired
            .into_iter()
            .map(|stats| self.finalize(stats, now))
            .collect()
    }

    /// Flush everything still tracked (shutdown path)
    pub fn flush(&mut self, now: DateTime<Utc>) -> Vec<FlowFeatures> {
        let remaining = self.table.drain();
        remaining
            .into_iter()
            .map(|stats| self.finalize(stats, now))
            .collect()
    }

    pub fn tracked_flows(&self) -> usize {
        self.table.len()
    }

    fn finalize(&mut self, stats: FlowStats, now: DateTime<Utc>) -> FlowFeatures {
        self.vectors_emitted += 1;
        let vector = self.make_vector(&stats, now);
        FlowFeatures {
            flow: stats.flow,
            vector,
            captured_at: now,
        }
    }

    fn make_vector(&self, stats: &FlowStats, now: DateTime<Utc>) -> FeatureVector {
        // Sub-second flows get a floor so single-packet flows do not
        // explode the per-second rates
        let elapsed = stats.duration_secs().max(0.1);
        let packets = stats.packets.max(1) as f32;

        let mut v = FeatureVector::new();
        v.values[0] = stats.packets as f32 / elapsed;
        v.values[1] = stats.bytes as f32 / elapsed;
        v.values[2] = stats.mean_size();
        v.values[3] = stats.size_std();
        v.values[4] = stats.duration_secs();
        v.values[5] = stats.syn_count as f32 / packets;
        v.values[6] = stats.fin_rst_count as f32 / packets;

        if let Some(win) = self.hosts.get(&stats.flow.src_ip) {
            v.values[7] = win.unique_dst_ports() as f32;
            v.values[8] = win.port_entropy();
            v.values[9] = win.dst_host_count() as f32;
            v.values[10] = win.protocol_entropy();
        }

        v.values[11] = stats.mean_dns_query_len();
        v.values[12] = now.hour() as f32 / 24.0;
        v
    }
}

fn validate(rec: &PacketRecord) -> Result<(), String> {
    if rec.length == 0 || rec.length > 65_535 {
        return Err(format!("inconsistent length {}", rec.length));
    }
    match rec.protocol {
        Protocol::Tcp | Protocol::Udp if rec.dst_port == 0 => {
            Err("zero destination port".to_string())
        }
        _ => Ok(()),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::capture::TcpFlags;
    use chrono::Duration;

    fn record(dport: u16, length: u32, flags: TcpFlags, ts: DateTime<Utc>) -> PacketRecord {
        PacketRecord {
            ts,
            src_ip: "10.1.1.1".parse().unwrap(),
            dst_ip: "10.1.1.2".parse().unwrap(),
            src_port: 40000,
            dst_port: dport,
            protocol: Protocol::Tcp,
            length,
            tcp_flags: Some(flags),
            dns_query: None,
        }
    }

    #[test]
    fn test_malformed_dropped_and_counted() {
        let mut ex = FeatureExtractor::new(ExtractorConfig::default());
        let out = ex.ingest(&record(80, 0, TcpFlags::default(), Utc::now()));
        assert!(out.is_empty());
        assert_eq!(ex.malformed_dropped, 1);
        assert_eq!(ex.packets_seen, 0);
    }

    #[test]
    fn test_fin_closes_flow_and_emits() {
        let t0 = Utc::now();
        let mut ex = FeatureExtractor::new(ExtractorConfig::default());

        assert!(ex.ingest(&record(80, 100, TcpFlags::syn_only(), t0)).is_empty());
        let fin = TcpFlags { fin: true, ack: true, ..Default::default() };
        let out = ex.ingest(&record(80, 100, fin, t0 + Duration::seconds(1)));

        assert_eq!(out.len(), 1);
        assert_eq!(ex.tracked_flows(), 0);
        let v = &out[0].vector;
        assert!(v.get_by_name("pkt_rate").unwrap() > 0.0);
        assert!((v.get_by_name("mean_pkt_size").unwrap() - 100.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_window_boundary_emits_without_closing() {
        let t0 = Utc::now();
        let cfg = ExtractorConfig { flow_window_secs: 5, ..Default::default() };
        let mut ex = FeatureExtractor::new(cfg);

        ex.ingest(&record(443, 500, TcpFlags::default(), t0));
        let out = ex.ingest(&record(443, 500, TcpFlags::default(), t0 + Duration::seconds(6)));

        assert_eq!(out.len(), 1, "window crossing should emit a snapshot");
        assert_eq!(ex.tracked_flows(), 1, "flow stays tracked after snapshot");
    }

    #[test]
    fn test_idle_sweep_emits() {
        let t0 = Utc::now();
        let cfg = ExtractorConfig { flow_idle_secs: 10, ..Default::default() };
        let mut ex = FeatureExtractor::new(cfg);

        ex.ingest(&record(22, 80, TcpFlags::syn_only(), t0));
        let out = ex.sweep_idle(t0 + Duration::seconds(15));

        assert_eq!(out.len(), 1);
        assert_eq!(ex.tracked_flows(), 0);
    }

    #[test]
    fn test_port_diversity_reaches_vector() {
        let t0 = Utc::now();
        let mut ex = FeatureExtractor::new(ExtractorConfig::default());

        // Scanner shape: many distinct ports from one source
        for port in 1..=100u16 {
            ex.ingest(&record(port, 60, TcpFlags::syn_only(), t0));
        }
        let fin = TcpFlags { rst: true, ..Default::default() };
        let out = ex.ingest(&record(100, 60, fin, t0 + Duration::seconds(1)));

        let v = &out[0].vector;
        assert!(v.get_by_name("unique_dst_ports").unwrap() >= 100.0);
        assert!(v.get_by_name("dst_port_entropy").unwrap() > 4.0);
        assert!(v.get_by_name("syn_ratio").unwrap() >= 0.5);
    }
}
