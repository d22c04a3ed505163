//! Process-wide counters shared by every lane, the sink adapter and the API.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Lock-free counters. Cloned around as `Arc<EngineMetrics>`.
#[derive(Debug)]
pub struct EngineMetrics {
    started: Instant,
    readings_processed: AtomicU64,
    late_drops: AtomicU64,
    violations: AtomicU64,
    commands_emitted: AtomicU64,
    commands_suppressed: AtomicU64,
    emission_failures: AtomicU64,
    redeliveries: AtomicU64,
    deliveries_abandoned: AtomicU64,
    submits_rejected: AtomicU64,
    decode_errors: AtomicU64,
    sink_writes: AtomicU64,
    sink_failures: AtomicU64,
    sink_timeouts: AtomicU64,
    committed_offset: AtomicU64,
    lane_processed: Vec<AtomicU64>,
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub readings_processed: u64,
    pub late_drops: u64,
    pub violations: u64,
    pub commands_emitted: u64,
    pub commands_suppressed: u64,
    pub emission_failures: u64,
    pub redeliveries: u64,
    pub deliveries_abandoned: u64,
    pub submits_rejected: u64,
    pub decode_errors: u64,
    pub sink_writes: u64,
    pub sink_failures: u64,
    pub sink_timeouts: u64,
    pub committed_offset: u64,
    pub lane_processed: Vec<u64>,
}

macro_rules! counter {
    ($incr:ident, $field:ident) => {
        pub fn $incr(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl EngineMetrics {
    pub fn new(partition_count: usize) -> Self {
        Self {
            started: Instant::now(),
            readings_processed: AtomicU64::new(0),
            late_drops: AtomicU64::new(0),
            violations: AtomicU64::new(0),
            commands_emitted: AtomicU64::new(0),
            commands_suppressed: AtomicU64::new(0),
            emission_failures: AtomicU64::new(0),
            redeliveries: AtomicU64::new(0),
            deliveries_abandoned: AtomicU64::new(0),
            submits_rejected: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            sink_writes: AtomicU64::new(0),
            sink_failures: AtomicU64::new(0),
            sink_timeouts: AtomicU64::new(0),
            committed_offset: AtomicU64::new(0),
            lane_processed: (0..partition_count).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    counter!(record_late_drop, late_drops);
    counter!(record_violation, violations);
    counter!(record_command_emitted, commands_emitted);
    counter!(record_command_suppressed, commands_suppressed);
    counter!(record_emission_failure, emission_failures);
    counter!(record_redelivery, redeliveries);
    counter!(record_abandoned, deliveries_abandoned);
    counter!(record_submit_rejected, submits_rejected);
    counter!(record_decode_error, decode_errors);
    counter!(record_sink_write, sink_writes);
    counter!(record_sink_failure, sink_failures);
    counter!(record_sink_timeout, sink_timeouts);

    /// One reading fully processed by `lane`.
    pub fn record_processed(&self, lane: usize) {
        self.readings_processed.fetch_add(1, Ordering::Relaxed);
        if let Some(counter) = self.lane_processed.get(lane) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn set_committed_offset(&self, offset: u64) {
        self.committed_offset.store(offset, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            uptime_secs: self.started.elapsed().as_secs(),
            readings_processed: load(&self.readings_processed),
            late_drops: load(&self.late_drops),
            violations: load(&self.violations),
            commands_emitted: load(&self.commands_emitted),
            commands_suppressed: load(&self.commands_suppressed),
            emission_failures: load(&self.emission_failures),
            redeliveries: load(&self.redeliveries),
            deliveries_abandoned: load(&self.deliveries_abandoned),
            submits_rejected: load(&self.submits_rejected),
            decode_errors: load(&self.decode_errors),
            sink_writes: load(&self.sink_writes),
            sink_failures: load(&self.sink_failures),
            sink_timeouts: load(&self.sink_timeouts),
            committed_offset: load(&self.committed_offset),
            lane_processed: self.lane_processed.iter().map(load).collect(),
        }
    }
}
