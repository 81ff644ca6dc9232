//! Agent metrics

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Counters for the capture dispatcher and flow pipeline
#[derive(Debug, Default)]
pub struct FlowMetrics {
    probes_started: AtomicU64,
    probes_stopped: AtomicU64,
    flows_updated: AtomicU64,
    flows_expired: AtomicU64,
    queries_served: AtomicU64,
}

impl FlowMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn probe_started(&self) {
        self.probes_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn probe_stopped(&self) {
        self.probes_stopped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flows_updated(&self, count: u64) {
        self.flows_updated.fetch_add(count, Ordering::Relaxed);
    }

    pub fn flows_expired(&self, count: u64) {
        self.flows_expired.fetch_add(count, Ordering::Relaxed);
    }

    pub fn query_served(&self) {
        self.queries_served.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let started = self.probes_started.load(Ordering::Relaxed);
        let stopped = self.probes_stopped.load(Ordering::Relaxed);
        MetricsSnapshot {
            probes_started: started,
            probes_stopped: stopped,
            probes_active: started.saturating_sub(stopped),
            flows_updated: self.flows_updated.load(Ordering::Relaxed),
            flows_expired: self.flows_expired.load(Ordering::Relaxed),
            queries_served: self.queries_served.load(Ordering::Relaxed),
        }
    }

    /// Export as Prometheus text format
    pub fn prometheus(&self) -> String {
        let snap = self.snapshot();
        let mut output = String::new();
        output.push_str("# HELP probes_active Probes currently running\n");
        output.push_str(&format!("probes_active {}\n", snap.probes_active));
        output.push_str("# HELP probes_started_total Probes started since boot\n");
        output.push_str(&format!("probes_started_total {}\n", snap.probes_started));
        output.push_str("# HELP probes_stopped_total Probes stopped since boot\n");
        output.push_str(&format!("probes_stopped_total {}\n", snap.probes_stopped));
        output.push_str("# HELP flows_updated_total Flows reported by update ticks\n");
        output.push_str(&format!("flows_updated_total {}\n", snap.flows_updated));
        output.push_str("# HELP flows_expired_total Flows removed by expiration\n");
        output.push_str(&format!("flows_expired_total {}\n", snap.flows_expired));
        output.push_str("# HELP queries_served_total Flow search queries served\n");
        output.push_str(&format!("queries_served_total {}\n", snap.queries_served));
        output
    }
}

/// Snapshot of all counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub probes_started: u64,
    pub probes_stopped: u64,
    pub probes_active: u64,
    pub flows_updated: u64,
    pub flows_expired: u64,
    pub queries_served: u64,
}
