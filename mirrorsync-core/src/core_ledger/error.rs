use thiserror::Error;

/// Ledger storage failures
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Migration v{version} failed: {reason}")]
    Migration { version: i32, reason: String },

    #[error("Ledger I/O error: {0}")]
    Io(#[from] std::io::Error),
}
