//! Version record types and key encoding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;

/// Sequence id of a record within one chain. Starts at 1, never reused.
pub type RecordId = u64;

/// How a record's payload reconstructs content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    /// Payload is the complete content.
    Full,
    /// Payload is a patch script against the previous record's content.
    Delta,
}

/// One immutable entry of a file's history chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub id: RecordId,
    pub old_fingerprint: Fingerprint,
    pub new_fingerprint: Fingerprint,
    pub kind: RecordKind,
    pub payload: String,
    pub comment: String,
    pub timestamp: DateTime<Utc>,
}

impl VersionRecord {
    pub fn summary(&self) -> VersionSummary {
        VersionSummary {
            id: self.id,
            old_fingerprint: self.old_fingerprint.clone(),
            new_fingerprint: self.new_fingerprint.clone(),
            kind: self.kind,
            comment: self.comment.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// A record without its payload, as returned by history listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionSummary {
    pub id: RecordId,
    pub old_fingerprint: Fingerprint,
    pub new_fingerprint: Fingerprint,
    pub kind: RecordKind,
    pub comment: String,
    pub timestamp: DateTime<Utc>,
}

/// Storage key for a record id: fixed-width big-endian, so byte order is numeric order.
pub fn encode_id(id: RecordId) -> [u8; 8] {
    id.to_be_bytes()
}

pub fn decode_id(key: &[u8]) -> Option<RecordId> {
    let bytes: [u8; 8] = key.try_into().ok()?;
    Some(RecordId::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_encoding_preserves_numeric_order() {
        let ids = [1u64, 2, 9, 10, 255, 256, 1 << 40];
        for pair in ids.windows(2) {
            assert!(encode_id(pair[0]) < encode_id(pair[1]));
        }
        assert_eq!(decode_id(&encode_id(256)), Some(256));
        assert_eq!(decode_id(&[1, 2, 3]), None);
    }

    #[test]
    fn test_record_json_shape() {
        let record = VersionRecord {
            id: 3,
            old_fingerprint: Fingerprint::of("a"),
            new_fingerprint: Fingerprint::of("b"),
            kind: RecordKind::Delta,
            payload: "[]".to_string(),
            comment: "typo".to_string(),
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["kind"], "delta");
        assert_eq!(value["id"], 3);
        assert_eq!(value["old_fingerprint"], Fingerprint::of("a").as_str());

        let summary = serde_json::to_value(record.summary()).unwrap();
        assert!(summary.get("payload").is_none());
    }
}
