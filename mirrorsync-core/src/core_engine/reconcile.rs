//! Catching the ledger up with a tree nobody was watching

use std::collections::HashSet;
use std::path::Path;

use super::EngineError;
use crate::core_sync::SyncManager;
use crate::core_watch::{
    scan_tree_async, system_time_secs, unix_now, ChangeEvent, ChangeKind, IgnoreMatcher,
};

/// A change for every file on disk, plus a delete for every live ledger path
/// whose file is gone, sorted by path.
///
/// Unchanged files come back as `Unchanged` from the sync manager, so the
/// plan is safe to apply at any time.
pub(crate) async fn plan(
    sync: &SyncManager,
    root: &Path,
    ignore_patterns: &[String],
) -> Result<Vec<ChangeEvent>, EngineError> {
    let matcher = IgnoreMatcher::new(ignore_patterns)?;
    let snapshot = scan_tree_async(root.to_path_buf(), matcher.clone()).await?;

    let mut changes: Vec<ChangeEvent> = snapshot
        .iter()
        .map(|(path, fingerprint)| ChangeEvent {
            path: path.clone(),
            kind: ChangeKind::Modified,
            observed_at: fingerprint
                .modified
                .map(system_time_secs)
                .unwrap_or_else(unix_now),
        })
        .collect();

    let on_disk: HashSet<&String> = snapshot.keys().collect();
    let now = unix_now();
    for record in sync.ledger_snapshot().await? {
        if record.deleted || on_disk.contains(&record.path) || matcher.is_ignored(&record.path) {
            continue;
        }
        changes.push(ChangeEvent {
            path: record.path,
            kind: ChangeKind::Deleted,
            observed_at: now,
        });
    }
    changes.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(changes)
}
