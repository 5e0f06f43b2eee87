//! SQLite-backed ledger

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::migrations::migrate;
use super::{LedgerError, SyncLedger, SyncRecord};

const RECORD_COLUMNS: &str = "file_path, hash_value, timestamp, session_id, size, deleted";

/// Append-only ledger table behind an r2d2 pool
pub struct SqlLedger {
    pool: Pool<SqliteConnectionManager>,
    location: Option<PathBuf>,
}

impl SqlLedger {
    /// Open (or create) the ledger database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")
        });
        let pool = Pool::builder().max_size(4).build(manager)?;
        migrate(&pool)?;

        debug!(path = %path.display(), "Ledger opened");
        Ok(Self {
            pool,
            location: Some(path.to_path_buf()),
        })
    }

    /// Private in-memory ledger.
    ///
    /// Every SQLite memory connection is its own database, so the pool holds
    /// exactly one.
    pub fn in_memory() -> Result<Self, LedgerError> {
        let pool = Pool::builder()
            .max_size(1)
            .build(SqliteConnectionManager::memory())?;
        migrate(&pool)?;
        Ok(Self {
            pool,
            location: None,
        })
    }

    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    /// Total rows, superseded ones included
    pub fn row_count(&self) -> Result<usize, LedgerError> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sync_records", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<SyncRecord> {
    Ok(SyncRecord {
        path: row.get(0)?,
        content_hash: row.get(1)?,
        timestamp: row.get(2)?,
        origin_session: row.get(3)?,
        size_bytes: row.get::<_, i64>(4)?.max(0) as u64,
        deleted: row.get(5)?,
    })
}

impl SyncLedger for SqlLedger {
    fn current(&self, path: &str) -> Result<Option<SyncRecord>, LedgerError> {
        let conn = self.pool.get()?;
        let record = conn
            .query_row(
                &format!(
                    "SELECT {} FROM sync_records WHERE file_path = ? ORDER BY sync_id DESC LIMIT 1",
                    RECORD_COLUMNS
                ),
                params![path],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn record(&self, record: &SyncRecord) -> Result<(), LedgerError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO sync_records (file_path, hash_value, timestamp, session_id, size, deleted)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                &record.path,
                &record.content_hash,
                record.timestamp,
                &record.origin_session,
                record.size_bytes as i64,
                record.deleted,
            ],
        )?;
        Ok(())
    }

    fn all_current(&self) -> Result<Vec<SyncRecord>, LedgerError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sync_records
             WHERE sync_id IN (SELECT MAX(sync_id) FROM sync_records GROUP BY file_path)
             ORDER BY file_path",
            RECORD_COLUMNS
        ))?;
        let records = stmt
            .query_map([], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn history(&self, limit: usize) -> Result<Vec<SyncRecord>, LedgerError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sync_records ORDER BY sync_id DESC LIMIT ?",
            RECORD_COLUMNS
        ))?;
        let records = stmt
            .query_map(params![limit as i64], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn prune_history(&self, keep: usize) -> Result<usize, LedgerError> {
        let conn = self.pool.get()?;
        let removed = conn.execute(
            "DELETE FROM sync_records
             WHERE sync_id NOT IN (SELECT sync_id FROM sync_records ORDER BY sync_id DESC LIMIT ?)
               AND sync_id NOT IN (SELECT MAX(sync_id) FROM sync_records GROUP BY file_path)",
            params![keep as i64],
        )?;
        if removed > 0 {
            debug!(removed, keep, "Pruned ledger history");
        }
        Ok(removed)
    }
}
