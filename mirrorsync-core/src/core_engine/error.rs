use thiserror::Error;

use super::EngineState;
use crate::config::ConfigError;
use crate::core_comms::ConnectionError;
use crate::core_ledger::LedgerError;
use crate::core_sync::SyncError;
use crate::core_watch::WatchError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Workspace root is not a directory: {0}")]
    InvalidRoot(String),

    #[error("Ledger unavailable: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Cannot listen: {0}")]
    Listen(#[source] ConnectionError),

    #[error("Cannot reach remote endpoint: {0}")]
    Dial(#[source] ConnectionError),

    #[error("Watcher failed: {0}")]
    Watch(#[from] WatchError),

    #[error("Operation not valid while {actual}")]
    InvalidState { actual: EngineState },

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}
