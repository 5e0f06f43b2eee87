use thiserror::Error;

/// Errors raised while observing a workspace tree
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Watch root is not accessible: {0}")]
    RootInaccessible(String),

    #[error("Native watcher failed: {0}")]
    Notify(#[from] notify::Error),

    #[error("Invalid ignore pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Watcher already started; event streams are not restartable")]
    AlreadyStarted,

    #[error("I/O error while scanning: {0}")]
    Io(#[from] std::io::Error),
}
