//! In-process sync counters

use super::*;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Point-in-time copy of [`SyncMetrics`]
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: SystemTime,
    pub outbound_syncs: u64,
    pub inbound_applies: u64,
    pub unchanged_skips: u64,
    pub integrity_rejections: u64,
    pub conflicts: u64,
    pub echo_suppressed: u64,
    pub broadcast_deliveries: u64,
    pub watcher_restarts: u64,
}

/// Counters shared by the engine tasks
#[derive(Debug, Default)]
pub struct SyncMetrics {
    outbound_syncs: AtomicU64,
    inbound_applies: AtomicU64,
    unchanged_skips: AtomicU64,
    integrity_rejections: AtomicU64,
    conflicts: AtomicU64,
    echo_suppressed: AtomicU64,
    broadcast_deliveries: AtomicU64,
    watcher_restarts: AtomicU64,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_outbound(&self) {
        self.outbound_syncs.fetch_add(1, Ordering::Relaxed);
        record_counter(OUTBOUND_SYNCS, 1);
    }

    pub fn inc_inbound(&self) {
        self.inbound_applies.fetch_add(1, Ordering::Relaxed);
        record_counter(INBOUND_APPLIES, 1);
    }

    pub fn inc_unchanged(&self) {
        self.unchanged_skips.fetch_add(1, Ordering::Relaxed);
        record_counter(UNCHANGED_SKIPS, 1);
    }

    pub fn inc_integrity_rejection(&self) {
        self.integrity_rejections.fetch_add(1, Ordering::Relaxed);
        record_counter(INTEGRITY_REJECTIONS, 1);
    }

    pub fn inc_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
        record_counter(CONFLICTS, 1);
    }

    pub fn inc_echo_suppressed(&self) {
        self.echo_suppressed.fetch_add(1, Ordering::Relaxed);
        record_counter(ECHO_SUPPRESSED, 1);
    }

    pub fn add_broadcast_deliveries(&self, delivered: usize) {
        self.broadcast_deliveries
            .fetch_add(delivered as u64, Ordering::Relaxed);
        record_counter(BROADCAST_DELIVERIES, delivered as u64);
    }

    pub fn inc_watcher_restart(&self) {
        self.watcher_restarts.fetch_add(1, Ordering::Relaxed);
        record_counter(WATCHER_RESTARTS, 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: SystemTime::now(),
            outbound_syncs: self.outbound_syncs.load(Ordering::Relaxed),
            inbound_applies: self.inbound_applies.load(Ordering::Relaxed),
            unchanged_skips: self.unchanged_skips.load(Ordering::Relaxed),
            integrity_rejections: self.integrity_rejections.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            echo_suppressed: self.echo_suppressed.load(Ordering::Relaxed),
            broadcast_deliveries: self.broadcast_deliveries.load(Ordering::Relaxed),
            watcher_restarts: self.watcher_restarts.load(Ordering::Relaxed),
        }
    }
}
