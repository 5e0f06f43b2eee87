//! Glob-based ignore matching shared by both watcher strategies

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::sync::{Arc, RwLock};

use super::WatchError;

/// Compiled ignore patterns.
///
/// Patterns are matched against `/`-separated paths relative to the root and
/// `*` may cross directory boundaries, so `.git/*` covers the whole tree.
#[derive(Debug, Clone)]
pub struct IgnoreMatcher {
    patterns: Vec<String>,
    set: GlobSet,
}

impl IgnoreMatcher {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, WatchError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let glob = Glob::new(pattern).map_err(|e| WatchError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })?;
            builder.add(glob);
        }

        let set = builder.build().map_err(|e| WatchError::InvalidPattern {
            pattern: patterns
                .iter()
                .map(|p| p.as_ref())
                .collect::<Vec<_>>()
                .join(","),
            reason: e.to_string(),
        })?;

        Ok(Self {
            patterns: patterns.iter().map(|p| p.as_ref().to_string()).collect(),
            set,
        })
    }

    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
            set: GlobSet::empty(),
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_ignored(&self, rel_path: &str) -> bool {
        self.set.is_match(rel_path)
    }

    /// Whether everything below a directory is ignored
    pub fn is_ignored_dir(&self, rel_dir: &str) -> bool {
        self.set.is_match(rel_dir) || self.set.is_match(format!("{}/", rel_dir))
    }
}

/// Matcher shared between a watcher handle and its background task
pub type SharedIgnore = Arc<RwLock<IgnoreMatcher>>;

pub(crate) fn read_ignore(shared: &SharedIgnore) -> IgnoreMatcher {
    shared
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

pub(crate) fn replace_ignore(shared: &SharedIgnore, matcher: IgnoreMatcher) {
    *shared
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = matcher;
}
