//! Flow Tracking - FlowStats aggregation and the bounded flow table
//!
//! FlowStats is owned exclusively by the FeatureExtractor. The table is
//! bounded: under a packet flood the oldest-idle flow is rotated out (and
//! emitted) rather than letting memory grow with the attack.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use chrono::{DateTime, Utc};

use crate::logic::capture::{FlowKey, FlowRef, PacketRecord, Protocol};

/// Caps on the per-source window sets so a scanner cannot inflate us
const MAX_WINDOW_PORTS: usize = 4096;
const MAX_WINDOW_HOSTS: usize = 1024;

// ============================================================================
// FLOW STATS
// ============================================================================

#[derive(Debug, Clone)]
pub struct FlowStats {
    pub key: FlowKey,
    /// Direction of the first observed packet (the initiator)
    pub flow: FlowRef,
    pub first_ts: DateTime<Utc>,
    pub last_ts: DateTime<Utc>,
    pub packets: u64,
    pub bytes: u64,
    pub syn_count: u64,
    pub fin_rst_count: u64,
    size_sum: f64,
    size_sumsq: f64,
    dns_len_sum: u64,
    dns_count: u64,
    /// Start of the current emission window for long-lived flows
    pub window_started: DateTime<Utc>,
}

impl FlowStats {
    pub fn new(rec: &PacketRecord) -> Self {
        let mut stats = Self {
            key: FlowKey::from_record(rec),
            flow: FlowRef::from_record(rec),
            first_ts: rec.ts,
            last_ts: rec.ts,
            packets: 0,
            bytes: 0,
            syn_count: 0,
            fin_rst_count: 0,
            size_sum: 0.0,
            size_sumsq: 0.0,
            dns_len_sum: 0,
            dns_count: 0,
            window_started: rec.ts,
        };
        stats.update(rec);
        stats
    }

    pub fn update(&mut self, rec: &PacketRecord) {
        self.last_ts = self.last_ts.max(rec.ts);
        self.packets += 1;
        self.bytes += rec.length as u64;
        self.size_sum += rec.length as f64;
        self.size_sumsq += (rec.length as f64) * (rec.length as f64);
        if let Some(flags) = rec.tcp_flags {
            if flags.syn {
                self.syn_count += 1;
            }
            if flags.is_teardown() {
                self.fin_rst_count += 1;
            }
        }
        if let Some(query) = &rec.dns_query {
            self.dns_len_sum += query.len() as u64;
            self.dns_count += 1;
        }
    }

    pub fn duration_secs(&self) -> f32 {
        (self.last_ts - self.first_ts).num_milliseconds().max(0) as f32 / 1000.0
    }

    pub fn mean_size(&self) -> f32 {
        if self.packets == 0 {
            return 0.0;
        }
        (self.size_sum / self.packets as f64) as f32
    }

    pub fn size_std(&self) -> f32 {
        if self.packets < 2 {
            return 0.0;
        }
        let n = self.packets as f64;
        let mean = self.size_sum / n;
        let var = (self.size_sumsq / n - mean * mean).max(0.0);
        var.sqrt() as f32
    }

    pub fn mean_dns_query_len(&self) -> f32 {
        if self.dns_count == 0 {
            return 0.0;
        }
        self.dns_len_sum as f32 / self.dns_count as f32
    }
}

// ============================================================================
// FLOW TABLE
// ============================================================================

pub struct FlowTable {
    flows: HashMap<FlowKey, FlowStats>,
    max_flows: usize,
}

impl FlowTable {
    pub fn new(max_flows: usize) -> Self {
        Self {
            flows: HashMap::new(),
            max_flows: max_flows.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    /// Update the flow for a record. When the table is full and the record
    /// opens a new flow, the oldest-idle flow is evicted and returned so the
    /// caller can emit its features before dropping it.
    pub fn observe(&mut self, rec: &PacketRecord) -> Option<FlowStats> {
        let key = FlowKey::from_record(rec);
        if let Some(stats) = self.flows.get_mut(&key) {
            stats.update(rec);
            return None;
        }

        let evicted = if self.flows.len() >= self.max_flows {
            self.evict_oldest_idle()
        } else {
            None
        };

        self.flows.insert(key, FlowStats::new(rec));
        evicted
    }

    /// Remove and return a flow (used on FIN/RST close)
    pub fn take(&mut self, key: &FlowKey) -> Option<FlowStats> {
        self.flows.remove(key)
    }

    pub fn get_mut(&mut self, key: &FlowKey) -> Option<&mut FlowStats> {
        self.flows.get_mut(key)
    }

    /// Remove and return every flow idle longer than `idle_secs`
    pub fn sweep_idle(&mut self, now: DateTime<Utc>, idle_secs: u64) -> Vec<FlowStats> {
        let expired: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|(_, s)| (now - s.last_ts).num_seconds() >= idle_secs as i64)
            .map(|(k, _)| *k)
            .collect();

        expired
            .iter()
            .filter_map(|k| self.flows.remove(k))
            .collect()
    }

    /// Drain everything (shutdown path)
    pub fn drain(&mut self) -> Vec<FlowStats> {
        self.flows.drain().map(|(_, s)| s).collect()
    }

    fn evict_oldest_idle(&mut self) -> Option<FlowStats> {
        let oldest = self
            .flows
            .iter()
            .min_by_key(|(_, s)| s.last_ts)
            .map(|(k, _)| *k)?;
        self.flows.remove(&oldest)
    }
}

// ============================================================================
// PER-SOURCE HOST WINDOW
// ============================================================================

/// Rolling per-source counters backing the entropy/diversity features.
#[derive(Debug)]
pub struct HostWindow {
    pub started: DateTime<Utc>,
    dst_ports: HashMap<u16, u32>,
    dst_hosts: HashSet<IpAddr>,
    protocols: HashMap<Protocol, u32>,
}

impl HostWindow {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            started: now,
            dst_ports: HashMap::new(),
            dst_hosts: HashSet::new(),
            protocols: HashMap::new(),
        }
    }

    pub fn observe(&mut self, rec: &PacketRecord) {
        if self.dst_ports.len() < MAX_WINDOW_PORTS || self.dst_ports.contains_key(&rec.dst_port) {
            *self.dst_ports.entry(rec.dst_port).or_insert(0) += 1;
        }
        if self.dst_hosts.len() < MAX_WINDOW_HOSTS {
            self.dst_hosts.insert(rec.dst_ip);
        }
        *self.protocols.entry(rec.protocol).or_insert(0) += 1;
    }

    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.started = now;
        self.dst_ports.clear();
        self.dst_hosts.clear();
        self.protocols.clear();
    }

    pub fn unique_dst_ports(&self) -> usize {
        self.dst_ports.len()
    }

    pub fn dst_host_count(&self) -> usize {
        self.dst_hosts.len()
    }

    pub fn port_entropy(&self) -> f32 {
        shannon_entropy(self.dst_ports.values().copied())
    }

    pub fn protocol_entropy(&self) -> f32 {
        shannon_entropy(self.protocols.values().copied())
    }
}

/// Shannon entropy in bits over observed category counts
pub fn shannon_entropy(counts: impl Iterator<Item = u32>) -> f32 {
    let counts: Vec<u32> = counts.filter(|&c| c > 0).collect();
    let total: u64 = counts.iter().map(|&c| c as u64).sum();
    if total == 0 {
        return 0.0;
    }
    let mut entropy = 0.0f64;
    for c in counts {
        let p = c as f64 / total as f64;
        entropy -= p * p.log2();
    }
    entropy as f32
}

// ============================================================================
// TESTS
// ============================================================================
