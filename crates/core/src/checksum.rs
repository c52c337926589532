use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::domain::context::ChecksumRecord;

#[derive(Debug, Error)]
pub enum ChecksumError {
    #[error("could not serialize content for checksum: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// SHA-256 over canonical JSON. Object keys are sorted by `serde_json::Value`,
/// so two values with the same fields always hash identically.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChecksumStore;

impl ChecksumStore {
    pub fn new() -> Self {
        Self
    }

    pub fn digest<T>(&self, content: &T) -> Result<String, ChecksumError>
    where
        T: Serialize + ?Sized,
    {
        let canonical = serde_json::to_value(content)?;
        Ok(self.digest_value(&canonical))
    }

    pub fn digest_value(&self, content: &Value) -> String {
        // Serializing a `Value` cannot fail: keys are strings and numbers are finite.
        let payload = serde_json::to_vec(content).unwrap_or_default();
        sha256_hex(&payload)
    }

    pub fn record(
        &self,
        context_id: impl Into<String>,
        content: &Value,
        timestamp: DateTime<Utc>,
    ) -> ChecksumRecord {
        ChecksumRecord {
            context_id: context_id.into(),
            digest: self.digest_value(content),
            timestamp,
        }
    }

    pub fn matches(&self, record: &ChecksumRecord, content: &Value) -> bool {
        self.digest_value(content) == record.digest
    }
}

fn sha256_hex(payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);
    encode_hex(digest.as_slice())
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::ChecksumStore;

    #[test]
    fn digest_is_deterministic_for_identical_content() {
        let store = ChecksumStore::new();
        let content = json!({"turn_count": 3, "speaker_queue": ["A", "B"]});
        assert_eq!(store.digest_value(&content), store.digest_value(&content.clone()));
        assert_eq!(store.digest_value(&content).len(), 64);
    }

    #[test]
    fn digest_ignores_key_insertion_order() {
        let store = ChecksumStore::new();
        let left: serde_json::Value =
            serde_json::from_str(r#"{"a":1,"b":2}"#).expect("parse left");
        let right: serde_json::Value =
            serde_json::from_str(r#"{"b":2,"a":1}"#).expect("parse right");
        assert_eq!(store.digest_value(&left), store.digest_value(&right));
    }

    #[test]
    fn digest_changes_when_any_field_changes() {
        let store = ChecksumStore::new();
        let base = json!({"session_id": "s-1", "turn_count": 1, "token_count": 10});
        let variants = [
            json!({"session_id": "s-2", "turn_count": 1, "token_count": 10}),
            json!({"session_id": "s-1", "turn_count": 2, "token_count": 10}),
            json!({"session_id": "s-1", "turn_count": 1, "token_count": 11}),
        ];

        let base_digest = store.digest_value(&base);
        for variant in variants {
            assert_ne!(store.digest_value(&variant), base_digest, "variant {variant} collided");
        }
    }

    #[test]
    fn record_matches_only_its_own_content() {
        let store = ChecksumStore::new();
        let content = json!({"note": "original"});
        let record = store.record("ctx-1", &content, Utc::now());

        assert_eq!(record.context_id, "ctx-1");
        assert!(store.matches(&record, &content));
        assert!(!store.matches(&record, &json!({"note": "tampered"})));
    }

    #[test]
    fn typed_digest_agrees_with_value_digest() {
        #[derive(serde::Serialize)]
        struct Sample {
            id: &'static str,
            count: u32,
        }

        let store = ChecksumStore::new();
        let typed = store.digest(&Sample { id: "x", count: 2 }).expect("typed digest");
        assert_eq!(typed, store.digest_value(&json!({"count": 2, "id": "x"})));
    }
}
