// ABOUTME: Metrics and observability for the cluster transport
//
// Tracks:
// - Fan-out: calls, partial and total failures, fault records
// - Pool: acquisitions, exhausted outcomes, resources created/destroyed
// - Heartbeat: announcements sent and failed, socket reopens
// - Gate: permits granted and denied

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Transport-wide counters
#[derive(Debug, Default)]
pub struct TransportMetrics {
    pub fanout_calls: AtomicU64,
    pub fanout_partial_failures: AtomicU64,
    pub fanout_total_failures: AtomicU64,
    pub fault_records: AtomicU64,
    pub pool_acquired: AtomicU64,
    pub pool_exhausted: AtomicU64,
    pub resources_created: AtomicU64,
    pub resources_destroyed: AtomicU64,
    pub heartbeats_sent: AtomicU64,
    pub heartbeats_failed: AtomicU64,
    pub heartbeat_reopens: AtomicU64,
    pub gate_granted: AtomicU64,
    pub gate_denied: AtomicU64,
}

impl TransportMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            fanout_calls: load(&self.fanout_calls),
            fanout_partial_failures: load(&self.fanout_partial_failures),
            fanout_total_failures: load(&self.fanout_total_failures),
            fault_records: load(&self.fault_records),
            pool_acquired: load(&self.pool_acquired),
            pool_exhausted: load(&self.pool_exhausted),
            resources_created: load(&self.resources_created),
            resources_destroyed: load(&self.resources_destroyed),
            heartbeats_sent: load(&self.heartbeats_sent),
            heartbeats_failed: load(&self.heartbeats_failed),
            heartbeat_reopens: load(&self.heartbeat_reopens),
            gate_granted: load(&self.gate_granted),
            gate_denied: load(&self.gate_denied),
        }
    }
}

/// Plain copy of [`TransportMetrics`] for reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub fanout_calls: u64,
    pub fanout_partial_failures: u64,
    pub fanout_total_failures: u64,
    pub fault_records: u64,
    pub pool_acquired: u64,
    pub pool_exhausted: u64,
    pub resources_created: u64,
    pub resources_destroyed: u64,
    pub heartbeats_sent: u64,
    pub heartbeats_failed: u64,
    pub heartbeat_reopens: u64,
    pub gate_granted: u64,
    pub gate_denied: u64,
}
