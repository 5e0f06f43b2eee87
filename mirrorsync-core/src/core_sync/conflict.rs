//! Conflict resolution strategies

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::core_ledger::SyncRecord;

/// Configured resolution strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    #[default]
    LatestWins,
    Manual,
    Merge,
}

impl FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "latest_wins" | "latest-wins" => Ok(Self::LatestWins),
            "manual" => Ok(Self::Manual),
            "merge" => Ok(Self::Merge),
            other => Err(format!("unknown conflict strategy '{}'", other)),
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LatestWins => write!(f, "latest_wins"),
            Self::Manual => write!(f, "manual"),
            Self::Merge => write!(f, "merge"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Winner {
    Local,
    Remote,
    /// Bytes produced by a [`ContentMerger`]
    Merged(Vec<u8>),
    ManualRequired,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConflictDecision {
    pub involved_paths: Vec<String>,
    pub winner: Winner,
    pub reason: String,
}

impl ConflictDecision {
    fn new(path: &str, winner: Winner, reason: impl Into<String>) -> Self {
        Self {
            involved_paths: vec![path.to_string()],
            winner,
            reason: reason.into(),
        }
    }
}

/// One side of a conflict. `content` is absent when the bytes are no longer
/// available (tombstones, or a ledger state already overwritten on disk).
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub record: &'a SyncRecord,
    pub content: Option<&'a [u8]>,
}

impl<'a> Candidate<'a> {
    pub fn new(record: &'a SyncRecord, content: Option<&'a [u8]>) -> Self {
        Self { record, content }
    }
}

pub trait ConflictResolver: Send + Sync {
    fn strategy(&self) -> ConflictStrategy;

    fn resolve(&self, local: Candidate<'_>, remote: Candidate<'_>) -> ConflictDecision;
}

/// Strictly newer timestamp wins; ties keep local
#[derive(Debug, Default, Clone, Copy)]
pub struct LatestWins;

impl ConflictResolver for LatestWins {
    fn strategy(&self) -> ConflictStrategy {
        ConflictStrategy::LatestWins
    }

    fn resolve(&self, local: Candidate<'_>, remote: Candidate<'_>) -> ConflictDecision {
        let path = &local.record.path;
        if remote.record.timestamp > local.record.timestamp {
            ConflictDecision::new(
                path,
                Winner::Remote,
                format!(
                    "remote {:.3} newer than local {:.3}",
                    remote.record.timestamp, local.record.timestamp
                ),
            )
        } else {
            ConflictDecision::new(
                path,
                Winner::Local,
                format!(
                    "local {:.3} not older than remote {:.3}",
                    local.record.timestamp, remote.record.timestamp
                ),
            )
        }
    }
}

/// Never picks a winner
#[derive(Debug, Default, Clone, Copy)]
pub struct ManualResolver;

impl ConflictResolver for ManualResolver {
    fn strategy(&self) -> ConflictStrategy {
        ConflictStrategy::Manual
    }

    fn resolve(&self, local: Candidate<'_>, _remote: Candidate<'_>) -> ConflictDecision {
        ConflictDecision::new(
            &local.record.path,
            Winner::ManualRequired,
            "manual strategy",
        )
    }
}

/// Caller-supplied content merge
pub trait ContentMerger: Send + Sync {
    /// Merged bytes, or `None` when the inputs cannot be merged
    fn merge(&self, path: &str, local: &[u8], remote: &[u8]) -> Option<Vec<u8>>;
}

/// Delegates to a [`ContentMerger`]; falls back to manual resolution when no
/// merger is installed or either side has no content
#[derive(Default, Clone)]
pub struct MergeResolver {
    merger: Option<Arc<dyn ContentMerger>>,
}

impl MergeResolver {
    pub fn new(merger: Option<Arc<dyn ContentMerger>>) -> Self {
        Self { merger }
    }
}

impl ConflictResolver for MergeResolver {
    fn strategy(&self) -> ConflictStrategy {
        ConflictStrategy::Merge
    }

    fn resolve(&self, local: Candidate<'_>, remote: Candidate<'_>) -> ConflictDecision {
        let path = &local.record.path;
        let Some(merger) = &self.merger else {
            return ConflictDecision::new(path, Winner::ManualRequired, "no merger installed");
        };
        let (Some(ours), Some(theirs)) = (local.content, remote.content) else {
            return ConflictDecision::new(
                path,
                Winner::ManualRequired,
                "content unavailable for merge",
            );
        };
        match merger.merge(path, ours, theirs) {
            Some(merged) => ConflictDecision::new(path, Winner::Merged(merged), "merged"),
            None => ConflictDecision::new(path, Winner::ManualRequired, "merger declined"),
        }
    }
}

/// Resolver for a configured strategy
pub fn resolver_for(
    strategy: ConflictStrategy,
    merger: Option<Arc<dyn ContentMerger>>,
) -> Arc<dyn ConflictResolver> {
    match strategy {
        ConflictStrategy::LatestWins => Arc::new(LatestWins),
        ConflictStrategy::Manual => Arc::new(ManualResolver),
        ConflictStrategy::Merge => Arc::new(MergeResolver::new(merger)),
    }
}

/// A conflict held for external resolution
#[derive(Debug, Clone, Serialize)]
pub struct PendingConflict {
    pub path: String,
    pub local: SyncRecord,
    pub remote: SyncRecord,
    #[serde(skip)]
    pub remote_content: Option<Vec<u8>>,
    pub detected_at: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    KeepLocal,
    TakeRemote,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record(ts: f64, session: &str, hash: &str) -> SyncRecord {
        SyncRecord::new("a.txt", hash, ts, session, 2)
    }

    struct Concat;

    impl ContentMerger for Concat {
        fn merge(&self, _path: &str, local: &[u8], remote: &[u8]) -> Option<Vec<u8>> {
            Some([local, &b"\n"[..], remote].concat())
        }
    }

    #[test]
    fn test_latest_wins_tie_keeps_local() {
        let local = record(100.0, "a", "h1");
        let remote = record(100.0, "b", "h2");
        let decision = LatestWins.resolve(Candidate::new(&local, None), Candidate::new(&remote, None));
        assert_eq!(decision.winner, Winner::Local);
        assert_eq!(decision.involved_paths, vec!["a.txt".to_string()]);
    }

    #[test]
    fn test_manual_never_picks() {
        let local = record(1.0, "a", "h1");
        let remote = record(9.0, "b", "h2");
        let decision =
            ManualResolver.resolve(Candidate::new(&local, None), Candidate::new(&remote, None));
        assert_eq!(decision.winner, Winner::ManualRequired);
    }

    #[test]
    fn test_merge_without_merger_is_manual() {
        let local = record(1.0, "a", "h1");
        let remote = record(2.0, "b", "h2");
        let resolver = MergeResolver::default();
        let decision = resolver.resolve(
            Candidate::new(&local, Some(&b"x"[..])),
            Candidate::new(&remote, Some(&b"y"[..])),
        );
        assert_eq!(decision.winner, Winner::ManualRequired);
    }

    #[test]
    fn test_merge_with_merger() {
        let local = record(1.0, "a", "h1");
        let remote = record(2.0, "b", "h2");
        let resolver = resolver_for(ConflictStrategy::Merge, Some(Arc::new(Concat)));
        let decision = resolver.resolve(
            Candidate::new(&local, Some(&b"ours"[..])),
            Candidate::new(&remote, Some(&b"theirs"[..])),
        );
        assert_eq!(decision.winner, Winner::Merged(b"ours\ntheirs".to_vec()));

        // A tombstone has nothing to merge
        let decision = resolver.resolve(
            Candidate::new(&local, Some(&b"ours"[..])),
            Candidate::new(&remote, None),
        );
        assert_eq!(decision.winner, Winner::ManualRequired);
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(
            "latest_wins".parse::<ConflictStrategy>().unwrap(),
            ConflictStrategy::LatestWins
        );
        assert_eq!("Manual".parse::<ConflictStrategy>().unwrap(), ConflictStrategy::Manual);
        assert!("coinflip".parse::<ConflictStrategy>().is_err());
        assert_eq!(ConflictStrategy::Merge.to_string(), "merge");
    }

    proptest! {
        #[test]
        fn prop_latest_wins_is_order_independent(
            t1 in 0.0f64..1.0e9,
            delta in 0.001f64..1.0e6,
        ) {
            let t2 = t1 + delta;
            prop_assume!(t2 > t1);
            let older = record(t1, "s1", "old");
            let newer = record(t2, "s2", "new");

            let d1 = LatestWins.resolve(Candidate::new(&older, None), Candidate::new(&newer, None));
            prop_assert_eq!(d1.winner, Winner::Remote);

            let d2 = LatestWins.resolve(Candidate::new(&newer, None), Candidate::new(&older, None));
            prop_assert_eq!(d2.winner, Winner::Local);
        }
    }
}
