use serde::{Deserialize, Serialize};

/// One ledger entry: the synced state of a path at a point in time.
///
/// Records are immutable. A later record for the same path supersedes the
/// earlier one; a deletion is a record with `deleted` set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub path: String,
    /// Lowercase hex BLAKE3 of the raw file bytes
    pub content_hash: String,
    /// Seconds since the UNIX epoch
    pub timestamp: f64,
    pub origin_session: String,
    pub size_bytes: u64,
    #[serde(default)]
    pub deleted: bool,
}

impl SyncRecord {
    pub fn new(
        path: impl Into<String>,
        content_hash: impl Into<String>,
        timestamp: f64,
        origin_session: impl Into<String>,
        size_bytes: u64,
    ) -> Self {
        Self {
            path: path.into(),
            content_hash: content_hash.into(),
            timestamp,
            origin_session: origin_session.into(),
            size_bytes,
            deleted: false,
        }
    }

    /// Deletion marker carrying the hash of empty content
    pub fn tombstone(path: impl Into<String>, timestamp: f64, origin_session: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content_hash: blake3::hash(&[]).to_hex().to_string(),
            timestamp,
            origin_session: origin_session.into(),
            size_bytes: 0,
            deleted: true,
        }
    }

    /// Live (non-tombstone) record with the given hash
    pub fn is_live_with_hash(&self, hash: &str) -> bool {
        !self.deleted && self.content_hash == hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tombstone_shape() {
        let record = SyncRecord::tombstone("a.txt", 10.0, "s1");
        assert!(record.deleted);
        assert_eq!(record.size_bytes, 0);
        assert_eq!(
            record.content_hash,
            "af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262"
        );
        assert!(!record.is_live_with_hash(&record.content_hash.clone()));
    }

    #[test]
    fn test_deleted_defaults_when_absent() {
        let json = r#"{"path":"a","content_hash":"h","timestamp":1.0,"origin_session":"s","size_bytes":3}"#;
        let record: SyncRecord = serde_json::from_str(json).unwrap();
        assert!(!record.deleted);
    }
}
