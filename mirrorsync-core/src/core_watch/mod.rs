//! Workspace change detection
//!
//! Two strategies produce the same debounced stream of [`ChangeEvent`]s:
//! native OS notifications ([`NativeWatcher`]) and periodic tree scans
//! ([`PollingWatcher`]). [`probe_strategy`] picks one for a given root.
//!
//! A stream item of `Err` is terminal: the watcher has stopped and the caller
//! decides whether to restart it.

mod debounce;
mod error;
mod event;
mod ignore;
mod native;
mod poll;
mod walk;

pub use debounce::{classify, Debouncer};
pub use error::WatchError;
pub use event::{relative_path, system_time_secs, unix_now, ChangeEvent, ChangeKind};
pub use ignore::{IgnoreMatcher, SharedIgnore};
pub use native::NativeWatcher;
pub use poll::{diff_snapshots, PollingWatcher};
pub use walk::{scan_tree, scan_tree_async, Fingerprint, Snapshot};

pub(crate) use ignore::{read_ignore, replace_ignore};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::{default_ignore_patterns, MirrorConfig, STATE_DIR_NAME};

/// Buffered events between a watcher task and its consumer
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Debounced changes; an `Err` item ends the stream
pub type WatchStream = mpsc::Receiver<Result<ChangeEvent, WatchError>>;

/// Strategy preference from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchMode {
    /// Native when the platform supports it for the root, polling otherwise
    #[default]
    Auto,
    Native,
    Poll,
}

impl FromStr for WatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "native" => Ok(Self::Native),
            "poll" | "polling" => Ok(Self::Poll),
            other => Err(format!("unknown watch mode '{}'", other)),
        }
    }
}

/// Strategy actually in use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchStrategy {
    Native,
    Polling,
}

impl fmt::Display for WatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => write!(f, "native"),
            Self::Polling => write!(f, "polling"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub debounce_window: Duration,
    pub poll_interval: Duration,
    pub ignore_patterns: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        let mut ignore_patterns = default_ignore_patterns();
        ignore_patterns.push(format!("{}/*", STATE_DIR_NAME));
        Self {
            debounce_window: Duration::from_millis(500),
            poll_interval: Duration::from_secs(1),
            ignore_patterns,
        }
    }
}

impl From<&MirrorConfig> for WatchConfig {
    fn from(config: &MirrorConfig) -> Self {
        Self {
            debounce_window: config.debounce_window(),
            poll_interval: config.poll_interval(),
            ignore_patterns: config.effective_ignore_patterns(),
        }
    }
}

/// A source of debounced change events for one root.
///
/// A watcher is started once; after `stop` (or a terminal error) a fresh
/// instance is needed.
#[async_trait]
pub trait Watcher: Send {
    async fn start(&mut self, root: &Path) -> Result<WatchStream, WatchError>;

    fn stop(&mut self);

    /// Replace the ignore set; takes effect for subsequent events
    fn set_ignore_patterns(&self, patterns: &[String]) -> Result<(), WatchError>;

    fn strategy(&self) -> WatchStrategy;
}

/// Pick the strategy for `root` under `mode`.
///
/// `Auto` tries to register a native watch on the root and falls back to
/// polling if the platform refuses.
pub fn probe_strategy(root: &Path, mode: WatchMode) -> Result<WatchStrategy, WatchError> {
    if !root.is_dir() {
        return Err(WatchError::RootInaccessible(root.display().to_string()));
    }
    let strategy = match mode {
        WatchMode::Native => WatchStrategy::Native,
        WatchMode::Poll => WatchStrategy::Polling,
        WatchMode::Auto => {
            if native_available(root) {
                WatchStrategy::Native
            } else {
                info!(root = %root.display(), "Native notifications unavailable, using polling");
                WatchStrategy::Polling
            }
        }
    };
    debug!(?mode, %strategy, "Watch strategy selected");
    Ok(strategy)
}

fn native_available(root: &Path) -> bool {
    use notify::Watcher as _;

    match notify::recommended_watcher(|_: notify::Result<notify::Event>| {}) {
        Ok(mut watcher) => watcher
            .watch(root, notify::RecursiveMode::NonRecursive)
            .is_ok(),
        Err(_) => false,
    }
}

pub fn create_watcher(
    strategy: WatchStrategy,
    config: &WatchConfig,
) -> Result<Box<dyn Watcher>, WatchError> {
    Ok(match strategy {
        WatchStrategy::Native => Box::new(NativeWatcher::new(config)?),
        WatchStrategy::Polling => Box::new(PollingWatcher::new(config)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_mode_parsing() {
        assert_eq!("auto".parse::<WatchMode>().unwrap(), WatchMode::Auto);
        assert_eq!("POLL".parse::<WatchMode>().unwrap(), WatchMode::Poll);
        assert_eq!("native".parse::<WatchMode>().unwrap(), WatchMode::Native);
        assert!("inotify".parse::<WatchMode>().is_err());
    }

    #[test]
    fn test_default_config_ignores_state_dir() {
        let config = WatchConfig::default();
        let matcher = IgnoreMatcher::new(&config.ignore_patterns).unwrap();
        assert!(matcher.is_ignored(".mirrorsync/ledger.db"));
        assert!(matcher.is_ignored("build.tmp"));
        assert!(!matcher.is_ignored("src/lib.rs"));
    }

    #[test]
    fn test_probe_respects_explicit_mode() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            probe_strategy(dir.path(), WatchMode::Poll).unwrap(),
            WatchStrategy::Polling
        );
        assert_eq!(
            probe_strategy(dir.path(), WatchMode::Native).unwrap(),
            WatchStrategy::Native
        );
    }

    #[test]
    fn test_probe_rejects_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            probe_strategy(&missing, WatchMode::Auto),
            Err(WatchError::RootInaccessible(_))
        ));
    }
}
