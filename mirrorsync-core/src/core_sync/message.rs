//! Wire message exchanged between peers

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use super::SyncError;
use crate::core_ledger::SyncRecord;
use crate::core_watch::unix_now;

pub mod message_types {
    pub const FILE_SYNC: &str = "file_sync";
    pub const FILE_DELETE: &str = "file_delete";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const UNSUPPORTED: &str = "unsupported";
}

/// How `content` is represented on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentEncoding {
    #[default]
    Utf8,
    Base64,
}

/// One JSON frame.
///
/// Unknown `type` values deserialize fine and are routed to the default
/// handler by the receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    #[serde(rename = "type")]
    pub msg_type: String,

    #[serde(rename = "sessionID")]
    pub session_id: String,

    #[serde(default)]
    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    #[serde(rename = "contentHash", default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,

    pub timestamp: f64,

    #[serde(rename = "sizeBytes", default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<ContentEncoding>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl SyncMessage {
    fn bare(msg_type: &str, session_id: impl Into<String>) -> Self {
        Self {
            msg_type: msg_type.to_string(),
            session_id: session_id.into(),
            path: String::new(),
            content: None,
            content_hash: None,
            timestamp: unix_now(),
            size_bytes: None,
            encoding: None,
            detail: None,
        }
    }

    /// Full file body for `record`, attributed to the record's origin session
    pub fn file_sync(record: &SyncRecord, content: &[u8]) -> Self {
        let (content, encoding) = match std::str::from_utf8(content) {
            Ok(text) => (text.to_string(), None),
            Err(_) => (BASE64.encode(content), Some(ContentEncoding::Base64)),
        };
        Self {
            path: record.path.clone(),
            content: Some(content),
            content_hash: Some(record.content_hash.clone()),
            timestamp: record.timestamp,
            size_bytes: Some(record.size_bytes),
            encoding,
            ..Self::bare(message_types::FILE_SYNC, record.origin_session.clone())
        }
    }

    pub fn file_delete(record: &SyncRecord) -> Self {
        Self {
            path: record.path.clone(),
            timestamp: record.timestamp,
            ..Self::bare(message_types::FILE_DELETE, record.origin_session.clone())
        }
    }

    /// `file_sync` for a live record, `file_delete` for a tombstone
    pub fn for_record(record: &SyncRecord, content: &[u8]) -> Self {
        if record.deleted {
            Self::file_delete(record)
        } else {
            Self::file_sync(record, content)
        }
    }

    pub fn ping(session_id: impl Into<String>) -> Self {
        Self::bare(message_types::PING, session_id)
    }

    pub fn pong(session_id: impl Into<String>) -> Self {
        Self::bare(message_types::PONG, session_id)
    }

    pub fn unsupported(session_id: impl Into<String>, offending_type: &str) -> Self {
        Self {
            detail: Some(offending_type.to_string()),
            ..Self::bare(message_types::UNSUPPORTED, session_id)
        }
    }

    pub fn is_file_change(&self) -> bool {
        self.msg_type == message_types::FILE_SYNC || self.msg_type == message_types::FILE_DELETE
    }

    /// Raw bytes of `content`
    pub fn decode_content(&self) -> Result<Vec<u8>, SyncError> {
        let content = self.content.as_ref().ok_or_else(|| SyncError::MissingContent {
            path: self.path.clone(),
        })?;
        match self.encoding.unwrap_or_default() {
            ContentEncoding::Utf8 => Ok(content.as_bytes().to_vec()),
            ContentEncoding::Base64 => BASE64
                .decode(content)
                .map_err(|e| SyncError::Encoding(format!("{}: {}", self.path, e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_sync::content_hash;

    #[test]
    fn test_wire_field_names() {
        let record = SyncRecord::new("a.txt", content_hash(b"v2"), 100.0, "s1", 2);
        let json = serde_json::to_value(SyncMessage::file_sync(&record, b"v2")).unwrap();

        assert_eq!(json["type"], "file_sync");
        assert_eq!(json["sessionID"], "s1");
        assert_eq!(json["path"], "a.txt");
        assert_eq!(json["content"], "v2");
        assert_eq!(json["contentHash"], record.content_hash.as_str());
        assert_eq!(json["timestamp"], 100.0);
        assert_eq!(json["sizeBytes"], 2);
        assert!(json.get("encoding").is_none());
    }

    #[test]
    fn test_minimal_frame_parses() {
        let json = r#"{"type":"telemetry","sessionID":"x","path":"","timestamp":1.5}"#;
        let msg: SyncMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.msg_type, "telemetry");
        assert!(msg.content.is_none());
        assert!(!msg.is_file_change());
    }

    #[test]
    fn test_binary_content_uses_base64() {
        let bytes = vec![0xff, 0x00, 0xfe];
        let record = SyncRecord::new("blob.bin", content_hash(&bytes), 1.0, "s", 3);
        let msg = SyncMessage::file_sync(&record, &bytes);

        assert_eq!(msg.encoding, Some(ContentEncoding::Base64));
        assert_eq!(msg.decode_content().unwrap(), bytes);
    }

    #[test]
    fn test_bad_base64_is_encoding_error() {
        let mut msg = SyncMessage::ping("s");
        msg.content = Some("***".to_string());
        msg.encoding = Some(ContentEncoding::Base64);
        assert!(matches!(msg.decode_content(), Err(SyncError::Encoding(_))));
    }

    #[test]
    fn test_tombstone_becomes_file_delete() {
        let record = SyncRecord::tombstone("gone.txt", 5.0, "s");
        let msg = SyncMessage::for_record(&record, &[]);
        assert_eq!(msg.msg_type, message_types::FILE_DELETE);
        assert!(msg.content.is_none());
        assert_eq!(msg.timestamp, 5.0);
    }
}
