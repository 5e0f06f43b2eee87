//! Metrics collection for observability
//!
//! Counters go to the global `metrics` recorder (installed by the CLI when
//! enabled) and to an in-process [`SyncMetrics`] so the status API can report
//! them without a recorder.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Instant;

mod collector;

pub use collector::{MetricsSnapshot, SyncMetrics};

pub const OUTBOUND_SYNCS: &str = "sync.outbound.total";
pub const INBOUND_APPLIES: &str = "sync.inbound.applied";
pub const UNCHANGED_SKIPS: &str = "sync.unchanged.total";
pub const INTEGRITY_REJECTIONS: &str = "sync.integrity.rejected";
pub const CONFLICTS: &str = "sync.conflicts.total";
pub const ECHO_SUPPRESSED: &str = "sync.echo.suppressed";
pub const BROADCAST_DELIVERIES: &str = "comms.broadcast.delivered";
pub const MESSAGES_RECEIVED: &str = "comms.messages.received";
pub const ACTIVE_CONNECTIONS: &str = "comms.connections.active";
pub const WATCHER_RESTARTS: &str = "watch.restarts.total";
pub const APPLY_DURATION_MS: &str = "sync.apply.duration_ms";

/// Initialize metrics with descriptions
pub fn init_metrics() {
    describe_counter!(OUTBOUND_SYNCS, "Local changes recorded and broadcast");
    describe_counter!(INBOUND_APPLIES, "Remote changes written to the workspace");
    describe_counter!(UNCHANGED_SKIPS, "Sync tasks skipped because the ledger hash matched");
    describe_counter!(INTEGRITY_REJECTIONS, "Inbound messages dropped on hash mismatch");
    describe_counter!(CONFLICTS, "Conflicts routed to the resolver");
    describe_counter!(ECHO_SUPPRESSED, "Watcher events dropped as echoes of inbound writes");
    describe_counter!(BROADCAST_DELIVERIES, "Frames delivered by broadcast");
    describe_counter!(MESSAGES_RECEIVED, "Frames decoded from peers");
    describe_gauge!(ACTIVE_CONNECTIONS, "Connections currently open");
    describe_counter!(WATCHER_RESTARTS, "Watcher restarts after a failure");
    describe_histogram!(APPLY_DURATION_MS, "Inbound apply duration in milliseconds");
}

/// Record a counter metric
pub fn record_counter(name: &'static str, value: u64) {
    counter!(name).increment(value);
}

/// Record a gauge metric
pub fn record_gauge(name: &'static str, value: f64) {
    gauge!(name).set(value);
}

/// Timer for measuring operation duration
pub struct Timer {
    name: &'static str,
    start: Instant,
}

impl Timer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }

    /// Stop the timer and record the duration
    pub fn stop(self) {
        let duration = self.start.elapsed();
        histogram!(self.name).record(duration.as_secs_f64() * 1000.0);
    }
}
