//! Component health tracking for the engine status API

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;

/// Health status as surfaced to operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Running,
    Degraded,
    Error,
}

/// Component health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
    pub last_check: SystemTime,
}

impl ComponentHealth {
    pub fn running(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Running,
            message: None,
            last_check: SystemTime::now(),
        }
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            last_check: SystemTime::now(),
        }
    }

    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Error,
            message: Some(message.into()),
            last_check: SystemTime::now(),
        }
    }
}

/// Aggregated health report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
    pub uptime_seconds: u64,
}

/// Per-component health registry
#[derive(Clone)]
pub struct HealthChecker {
    start_time: SystemTime,
    components: Arc<RwLock<Vec<ComponentHealth>>>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self {
            start_time: SystemTime::now(),
            components: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Insert or replace a component's health
    pub async fn set(&self, health: ComponentHealth) {
        let mut components = self.components.write().await;
        match components.iter_mut().find(|c| c.name == health.name) {
            Some(existing) => *existing = health,
            None => components.push(health),
        }
    }

    pub async fn component(&self, name: &str) -> Option<ComponentHealth> {
        self.components
            .read()
            .await
            .iter()
            .find(|c| c.name == name)
            .cloned()
    }

    /// Worst component status wins
    pub async fn report(&self) -> HealthReport {
        let components = self.components.read().await.clone();

        let status = if components.iter().any(|c| c.status == HealthStatus::Error) {
            HealthStatus::Error
        } else if components.iter().any(|c| c.status == HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Running
        };

        let uptime = self
            .start_time
            .elapsed()
            .unwrap_or(Duration::from_secs(0))
            .as_secs();

        HealthReport {
            status,
            components,
            uptime_seconds: uptime,
        }
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

/// Built-in health checks
pub mod checks {
    use super::*;

    pub const COMMS: &str = "comms";
    pub const WATCHER: &str = "watcher";
    pub const LEDGER: &str = "ledger";

    /// A configured remote with no live connection is degraded, not failed
    pub fn check_comms(active_connections: usize, remote_configured: bool) -> ComponentHealth {
        if remote_configured && active_connections == 0 {
            ComponentHealth::degraded(COMMS, "No connection to remote; changes held locally")
        } else {
            ComponentHealth::running(COMMS)
        }
    }

    pub fn check_watcher(last_error: Option<&str>) -> ComponentHealth {
        match last_error {
            Some(err) => ComponentHealth::degraded(WATCHER, format!("Restarting watcher: {}", err)),
            None => ComponentHealth::running(WATCHER),
        }
    }
}
