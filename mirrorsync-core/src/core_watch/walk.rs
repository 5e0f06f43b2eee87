//! Recursive tree scans used by the polling watcher, watcher seeding and the
//! engine's initial reconciliation.

use std::collections::HashMap;
use std::path::Path;
use std::time::SystemTime;
use tracing::trace;
use walkdir::WalkDir;

use super::{relative_path, IgnoreMatcher, WatchError};

/// Cheap change detector for one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// Relative path to fingerprint for every non-ignored regular file
pub type Snapshot = HashMap<String, Fingerprint>;

/// Walk `root`, skipping ignored paths and pruning ignored directories.
///
/// Entries that vanish mid-walk are skipped; failure to read the root itself
/// is reported as [`WatchError::RootInaccessible`].
pub fn scan_tree(root: &Path, ignore: &IgnoreMatcher) -> Result<Snapshot, WatchError> {
    let meta = std::fs::metadata(root)
        .map_err(|e| WatchError::RootInaccessible(format!("{}: {}", root.display(), e)))?;
    if !meta.is_dir() {
        return Err(WatchError::RootInaccessible(format!(
            "{} is not a directory",
            root.display()
        )));
    }

    let mut snapshot = Snapshot::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                return true;
            }
            match relative_path(root, entry.path()) {
                Some(rel) => !ignore.is_ignored_dir(&rel),
                None => true,
            }
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                trace!(error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(rel) = relative_path(root, entry.path()) else {
            continue;
        };
        if ignore.is_ignored(&rel) {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        snapshot.insert(
            rel,
            Fingerprint {
                size: meta.len(),
                modified: meta.modified().ok(),
            },
        );
    }

    Ok(snapshot)
}

/// Async wrapper running [`scan_tree`] on the blocking pool
pub async fn scan_tree_async(
    root: std::path::PathBuf,
    ignore: IgnoreMatcher,
) -> Result<Snapshot, WatchError> {
    tokio::task::spawn_blocking(move || scan_tree(&root, &ignore))
        .await
        .map_err(|e| WatchError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}
