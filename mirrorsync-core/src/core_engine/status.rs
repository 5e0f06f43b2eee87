use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use super::EngineState;
use crate::core_watch::WatchStrategy;
use crate::health::{ComponentHealth, HealthStatus};
use crate::metrics::MetricsSnapshot;

/// Point-in-time view of a running (or stopped) engine
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub health: HealthStatus,
    pub session_id: String,
    pub listen_address: Option<SocketAddr>,
    pub watch_strategy: Option<WatchStrategy>,
    pub active_connections: usize,
    pub pending_conflicts: usize,
    /// Most recent sync timestamp per path during this run
    pub last_sync: HashMap<String, f64>,
    pub last_successful_sync_at: Option<f64>,
    pub metrics: MetricsSnapshot,
    pub components: Vec<ComponentHealth>,
}

#[derive(Debug, Default)]
struct Activity {
    last_sync: HashMap<String, f64>,
    last_successful_sync_at: Option<f64>,
    watch_strategy: Option<WatchStrategy>,
}

/// Sync activity recorded by the worker and read by `status()`
#[derive(Debug, Clone, Default)]
pub(crate) struct ActivityLog(Arc<Mutex<Activity>>);

impl ActivityLog {
    fn lock(&self) -> MutexGuard<'_, Activity> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_sync(&self, path: &str, at: f64) {
        let mut activity = self.lock();
        activity.last_sync.insert(path.to_string(), at);
        activity.last_successful_sync_at = Some(at);
    }

    pub fn set_watch_strategy(&self, strategy: WatchStrategy) {
        self.lock().watch_strategy = Some(strategy);
    }

    pub fn last_sync(&self) -> HashMap<String, f64> {
        self.lock().last_sync.clone()
    }

    pub fn last_successful_sync_at(&self) -> Option<f64> {
        self.lock().last_successful_sync_at
    }

    pub fn watch_strategy(&self) -> Option<WatchStrategy> {
        self.lock().watch_strategy
    }
}
