//! Guarded access to files under the workspace root

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use super::SyncError;
use crate::config::STATE_DIR_NAME;
use crate::core_watch::system_time_secs;

const STAGING_DIR: &str = "staging";

/// Resolve a peer-supplied relative path below `root`.
///
/// Only plain components are accepted; anything that could escape the root
/// or reach the engine state directory is rejected.
pub fn resolve_path(root: &Path, rel: &str) -> Result<PathBuf, SyncError> {
    if rel.is_empty() {
        return Err(SyncError::InvalidPath("empty path".to_string()));
    }
    if rel.contains('\\') || rel.contains('\0') {
        return Err(SyncError::InvalidPath(rel.to_string()));
    }

    let mut resolved = root.to_path_buf();
    let mut depth = 0;
    for component in Path::new(rel).components() {
        match component {
            Component::Normal(part) => {
                if depth == 0 && part == STATE_DIR_NAME {
                    return Err(SyncError::InvalidPath(format!("{} is reserved", rel)));
                }
                resolved.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(SyncError::InvalidPath(rel.to_string()));
            }
        }
    }

    if depth == 0 {
        return Err(SyncError::InvalidPath(rel.to_string()));
    }
    Ok(resolved)
}

/// Current bytes and modification time, or `None` if the file is absent
pub async fn read_local(path: &Path) -> Result<Option<(Vec<u8>, f64)>, SyncError> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if !meta.is_file() {
        return Err(SyncError::InvalidPath(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    let modified = meta.modified().map(system_time_secs).unwrap_or(0.0);
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some((bytes, modified))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Replace `target` with `bytes` via a staged file and a rename.
///
/// The staging file lives in the state directory so watchers never report
/// it; the root and the state directory share a filesystem.
pub async fn write_atomic(root: &Path, target: &Path, bytes: &[u8]) -> Result<(), SyncError> {
    let staging = root.join(STATE_DIR_NAME).join(STAGING_DIR);
    tokio::fs::create_dir_all(&staging).await?;
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let temp = staging.join(format!("{}.partial", uuid::Uuid::new_v4()));
    tokio::fs::write(&temp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&temp, target).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Remove `target`; an already missing file is not an error
pub async fn remove_file(target: &Path) -> Result<bool, SyncError> {
    match tokio::fs::remove_file(target).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_accepts_nested_paths() {
        let root = Path::new("/ws");
        assert_eq!(
            resolve_path(root, "src/lib.rs").unwrap(),
            PathBuf::from("/ws/src/lib.rs")
        );
        assert_eq!(
            resolve_path(root, "./notes.md").unwrap(),
            PathBuf::from("/ws/notes.md")
        );
    }

    #[test]
    fn test_resolve_rejects_escapes() {
        let root = Path::new("/ws");
        for bad in [
            "",
            ".",
            "../etc/passwd",
            "src/../../x",
            "/etc/passwd",
            ".mirrorsync/ledger.db",
            "dir\\..\\x",
        ] {
            assert!(
                matches!(resolve_path(root, bad), Err(SyncError::InvalidPath(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_write_atomic_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("deep/nested/file.txt");

        write_atomic(dir.path(), &target, b"hello").await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"hello");

        let staged: Vec<_> = std::fs::read_dir(dir.path().join(".mirrorsync/staging"))
            .unwrap()
            .collect();
        assert!(staged.is_empty());
    }

    #[tokio::test]
    async fn test_read_and_remove_missing() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.txt");
        assert!(read_local(&missing).await.unwrap().is_none());
        assert!(!remove_file(&missing).await.unwrap());
    }
}
