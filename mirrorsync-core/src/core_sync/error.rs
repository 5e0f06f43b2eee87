use thiserror::Error;

use crate::core_ledger::LedgerError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Integrity check failed for {path}: expected {expected}, got {actual}")]
    Integrity {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Conflict on {path} awaits manual resolution")]
    ConflictUnresolved { path: String },

    #[error("No pending conflict for {path}")]
    NoPendingConflict { path: String },

    #[error("Path rejected: {0}")]
    InvalidPath(String),

    #[error("Content encoding error: {0}")]
    Encoding(String),

    #[error("Message for {path} carries no content")]
    MissingContent { path: String },

    #[error("Message type '{0}' cannot be applied")]
    UnexpectedMessage(String),

    #[error("Workspace I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl SyncError {
    /// Errors that leave the sync manager unusable
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Ledger(_))
    }
}
