//! Sync ledger: the append-only record of what has been synchronized
//!
//! The ledger answers "what is the latest synced state of this path" and
//! keeps a bounded history for diagnostics. It is owned by the sync manager
//! and injected as an `Arc<dyn SyncLedger>`.

mod error;
pub mod migrations;
mod record;
mod sql_ledger;

pub use error::LedgerError;
pub use migrations::{migrate, CURRENT_LEDGER_SCHEMA_VERSION};
pub use record::SyncRecord;
pub use sql_ledger::SqlLedger;

/// Storage contract for sync records.
///
/// Calls are blocking; async callers go through `spawn_blocking`.
pub trait SyncLedger: Send + Sync {
    /// Latest record for `path`, tombstones included
    fn current(&self, path: &str) -> Result<Option<SyncRecord>, LedgerError>;

    /// Append a record that supersedes any earlier one for the same path
    fn record(&self, record: &SyncRecord) -> Result<(), LedgerError>;

    /// Latest record of every path ever synced, ordered by path
    fn all_current(&self) -> Result<Vec<SyncRecord>, LedgerError>;

    /// Most recent rows across all paths, newest first
    fn history(&self, limit: usize) -> Result<Vec<SyncRecord>, LedgerError>;

    /// Delete superseded rows outside the newest `keep`; returns rows removed
    fn prune_history(&self, keep: usize) -> Result<usize, LedgerError>;
}
