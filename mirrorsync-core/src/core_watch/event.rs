//! Change events emitted by watchers

use serde::{Deserialize, Serialize};
use std::path::{Component, Path};
use std::time::{SystemTime, UNIX_EPOCH};

/// What happened to a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

/// A debounced change to one file, relative to the watched root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// `/`-separated path relative to the root
    pub path: String,
    pub kind: ChangeKind,
    /// Seconds since the UNIX epoch
    pub observed_at: f64,
}

impl ChangeEvent {
    pub fn new(path: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
            observed_at: unix_now(),
        }
    }
}

/// Wall-clock seconds since the UNIX epoch
pub fn unix_now() -> f64 {
    system_time_secs(SystemTime::now())
}

pub fn system_time_secs(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Express `path` relative to `root` with `/` separators.
///
/// Returns `None` for the root itself and for paths outside it.
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_relative_path() {
        let root = PathBuf::from("/ws");
        assert_eq!(
            relative_path(&root, &PathBuf::from("/ws/src/main.rs")),
            Some("src/main.rs".to_string())
        );
        assert_eq!(relative_path(&root, &PathBuf::from("/ws")), None);
        assert_eq!(relative_path(&root, &PathBuf::from("/other/file")), None);
    }

    #[test]
    fn test_unix_now_is_recent() {
        // 2020-01-01
        assert!(unix_now() > 1_577_836_800.0);
    }
}
