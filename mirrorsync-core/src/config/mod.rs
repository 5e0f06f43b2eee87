//! Configuration management for MirrorSync
//!
//! Configuration is read from a TOML file and/or `MIRRORSYNC_*` environment
//! variables. Every option has a default except `workspace_root`.

use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

mod error;

pub use error::ConfigError;

use crate::core_sync::ConflictStrategy;
use crate::core_watch::{IgnoreMatcher, WatchMode};

/// Directory inside the workspace reserved for engine state
pub const STATE_DIR_NAME: &str = ".mirrorsync";

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Directory mirrored by this node
    pub workspace_root: PathBuf,

    /// Peer to dial on startup (`host:port`)
    pub remote_endpoint: Option<String>,

    /// Address the listener binds; empty disables listening
    pub listen_address: String,

    /// Quiet period before a burst of writes to one path is emitted
    pub debounce_window_ms: u64,

    /// Tree scan cadence when native notifications are unavailable
    pub poll_interval_ms: u64,

    pub heartbeat_interval_sec: u64,

    pub reconnect_interval_sec: u64,

    pub conflict_strategy: ConflictStrategy,

    /// Glob patterns (relative to the workspace root) never synchronized
    pub ignore_patterns: Vec<String>,

    /// Sync tasks processed per drain tick
    pub sync_batch_size: usize,

    pub watch_mode: WatchMode,

    /// Start in local-only mode when the remote cannot be dialed
    pub offline_mode: bool,

    /// Ledger database location; defaults to `<root>/.mirrorsync/ledger.db`
    pub ledger_path: Option<PathBuf>,

    /// Superseded ledger rows kept for diagnostics
    pub history_retention: usize,

    pub max_frame_bytes: usize,

    pub drain_interval_ms: u64,

    pub queue_capacity: usize,

    /// Ask the version-control collaborator to commit after each synced batch
    pub auto_commit: bool,

    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    pub logging: LoggingConfig,

    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include target module
    pub with_target: bool,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Install the Prometheus exporter
    pub enabled: bool,

    /// Exporter bind address
    pub bind_address: SocketAddr,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::new(),
            remote_endpoint: None,
            listen_address: "0.0.0.0:7420".to_string(),
            debounce_window_ms: 500,
            poll_interval_ms: 1000,
            heartbeat_interval_sec: 30,
            reconnect_interval_sec: 5,
            conflict_strategy: ConflictStrategy::LatestWins,
            ignore_patterns: default_ignore_patterns(),
            sync_batch_size: 10,
            watch_mode: WatchMode::Auto,
            offline_mode: false,
            ledger_path: None,
            history_retention: 1000,
            max_frame_bytes: 32 * 1024 * 1024, // 32 MiB
            drain_interval_ms: 100,
            queue_capacity: 1024,
            auto_commit: false,
            shutdown_timeout: Duration::from_secs(5),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_target: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: SocketAddr::from(([127, 0, 0, 1], 9464)),
        }
    }
}

/// Patterns ignored when the config does not list any
pub fn default_ignore_patterns() -> Vec<String> {
    vec![
        ".git/*".to_string(),
        "node_modules/*".to_string(),
        "*.tmp".to_string(),
    ]
}

impl MirrorConfig {
    /// Default configuration for a workspace
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            ..Default::default()
        }
    }

    /// Load configuration from environment variables
    ///
    /// Environment variables follow the pattern: MIRRORSYNC_<KEY>
    /// Example: MIRRORSYNC_REMOTE_ENDPOINT=10.0.0.2:7420
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::default().with_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = toml::from_str(&contents)?;

        config.validate()?;
        Ok(config)
    }

    /// Apply `MIRRORSYNC_*` variables on top of this configuration
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Ok(root) = env::var("MIRRORSYNC_WORKSPACE_ROOT") {
            self.workspace_root = PathBuf::from(root);
        }
        if let Ok(endpoint) = env::var("MIRRORSYNC_REMOTE_ENDPOINT") {
            self.remote_endpoint = Some(endpoint).filter(|e| !e.is_empty());
        }
        if let Ok(addr) = env::var("MIRRORSYNC_LISTEN_ADDRESS") {
            self.listen_address = addr;
        }
        if let Ok(value) = env::var("MIRRORSYNC_DEBOUNCE_WINDOW_MS") {
            self.debounce_window_ms = parse_var("MIRRORSYNC_DEBOUNCE_WINDOW_MS", &value)?;
        }
        if let Ok(value) = env::var("MIRRORSYNC_SYNC_BATCH_SIZE") {
            self.sync_batch_size = parse_var("MIRRORSYNC_SYNC_BATCH_SIZE", &value)?;
        }
        if let Ok(value) = env::var("MIRRORSYNC_CONFLICT_STRATEGY") {
            self.conflict_strategy = parse_var("MIRRORSYNC_CONFLICT_STRATEGY", &value)?;
        }
        if let Ok(value) = env::var("MIRRORSYNC_WATCH_MODE") {
            self.watch_mode = parse_var("MIRRORSYNC_WATCH_MODE", &value)?;
        }
        if let Ok(value) = env::var("MIRRORSYNC_OFFLINE_MODE") {
            self.offline_mode = parse_var("MIRRORSYNC_OFFLINE_MODE", &value)?;
        }

        // Logging config
        if let Ok(level) = env::var("MIRRORSYNC_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(json) = env::var("MIRRORSYNC_LOG_JSON") {
            self.logging.json_format = parse_var("MIRRORSYNC_LOG_JSON", &json)?;
        }

        Ok(self)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workspace_root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "workspace_root is required".to_string(),
            ));
        }

        if self.debounce_window_ms == 0 || self.poll_interval_ms == 0 || self.drain_interval_ms == 0
        {
            return Err(ConfigError::Invalid(
                "debounce, poll and drain intervals must be greater than 0".to_string(),
            ));
        }

        if self.heartbeat_interval_sec == 0 || self.reconnect_interval_sec == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat and reconnect intervals must be greater than 0".to_string(),
            ));
        }

        if self.sync_batch_size == 0 || self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "sync_batch_size and queue_capacity must be greater than 0".to_string(),
            ));
        }

        if self.max_frame_bytes < 1024 {
            return Err(ConfigError::Invalid(
                "max_frame_bytes must be at least 1024".to_string(),
            ));
        }

        IgnoreMatcher::new(&self.ignore_patterns)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)?;

        std::fs::write(path, contents).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(())
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_sec)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_sec)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    /// Resolved ledger database path
    pub fn ledger_path(&self) -> PathBuf {
        self.ledger_path.clone().unwrap_or_else(|| {
            self.workspace_root
                .join(STATE_DIR_NAME)
                .join("ledger.db")
        })
    }

    /// Configured ignore patterns plus the engine state directory
    pub fn effective_ignore_patterns(&self) -> Vec<String> {
        let mut patterns = self.ignore_patterns.clone();
        let state = format!("{}/*", STATE_DIR_NAME);
        if !patterns.contains(&state) {
            patterns.push(state);
        }
        patterns
    }
}

fn parse_var<T>(var: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::Env {
        var: var.to_string(),
        reason: e.to_string(),
    })
}
