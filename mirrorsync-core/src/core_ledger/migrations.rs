//! Versioned schema migrations for the sync ledger
//!
//! Each migration runs in its own transaction and is recorded in
//! `ledger_schema_version`.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use tracing::info;

use super::LedgerError;
use crate::core_watch::unix_now;

pub const CURRENT_LEDGER_SCHEMA_VERSION: i32 = 1;

pub struct Migration {
    pub version: i32,
    pub description: &'static str,
    pub up_sql: &'static str,
}

pub fn get_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Append-only sync record table",
        up_sql: r#"
            CREATE TABLE IF NOT EXISTS sync_records (
                sync_id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_path TEXT NOT NULL,
                hash_value TEXT NOT NULL,
                timestamp REAL NOT NULL,
                session_id TEXT NOT NULL,
                size INTEGER NOT NULL DEFAULT 0,
                deleted INTEGER NOT NULL DEFAULT 0 CHECK(deleted IN (0, 1))
            );

            CREATE INDEX IF NOT EXISTS idx_sync_records_path ON sync_records(file_path);
            CREATE INDEX IF NOT EXISTS idx_sync_records_timestamp ON sync_records(timestamp);
        "#,
    }]
}

fn get_current_version(pool: &Pool<SqliteConnectionManager>) -> Result<i32, LedgerError> {
    let conn = pool.get()?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS ledger_schema_version (
            version INTEGER PRIMARY KEY,
            applied_at REAL NOT NULL
        )",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row(
            "SELECT version FROM ledger_schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;

    Ok(version.unwrap_or(0))
}

/// Apply all pending migrations
pub fn migrate(pool: &Pool<SqliteConnectionManager>) -> Result<(), LedgerError> {
    let current_version = get_current_version(pool)?;
    let pending: Vec<_> = get_migrations()
        .into_iter()
        .filter(|m| m.version > current_version)
        .collect();

    if pending.is_empty() {
        return Ok(());
    }

    let conn = pool.get()?;
    for migration in pending {
        let failed = |e: rusqlite::Error| LedgerError::Migration {
            version: migration.version,
            reason: e.to_string(),
        };

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.up_sql).map_err(failed)?;
        tx.execute(
            "INSERT INTO ledger_schema_version (version, applied_at) VALUES (?, ?)",
            params![migration.version, unix_now()],
        )
        .map_err(failed)?;
        tx.commit()?;

        info!(
            version = migration.version,
            description = migration.description,
            "Applied ledger migration"
        );
    }

    Ok(())
}
