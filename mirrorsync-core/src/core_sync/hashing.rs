//! Content hashing

/// Lowercase hex BLAKE3 digest of `bytes`
pub fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Hash of zero bytes, carried by tombstones
pub fn empty_hash() -> String {
    content_hash(&[])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_lowercase_hex() {
        let hash = content_hash(b"v2");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(hash, content_hash(b"v3"));
        assert_eq!(hash, content_hash(b"v2"));
    }

    #[test]
    fn test_empty_hash_matches_tombstone() {
        let tombstone = crate::core_ledger::SyncRecord::tombstone("x", 0.0, "s");
        assert_eq!(tombstone.content_hash, empty_hash());
    }
}
