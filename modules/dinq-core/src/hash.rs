//! Canonical JSON + SHA-256 helpers shared by every cache key computation.
//!
//! One true canonicalization routine: object keys sorted, compact separators,
//! so the same logical document always hashes identically regardless of the
//! order it was constructed in.

use sha2::{Digest, Sha256};
use serde_json::Value;

/// Recursively sort object keys so two semantically-equal JSON values produce
/// byte-identical serializations.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<(String, Value)> = map
                .iter()
                .map(|(k, v)| (k.clone(), canonicalize(v)))
                .collect();
            sorted.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Serialize `value` as compact JSON with deterministic key order.
pub fn canonical_json(value: &Value) -> String {
    serde_json::to_string(&canonicalize(value)).expect("canonicalized JSON always serializes")
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// `artifact_key = SHA256(canonical_json({source, subject_key, pipeline_version, options_hash, kind}))`.
pub fn artifact_key(source: &str, subject_key: &str, pipeline_version: &str, options_hash: &str, kind: &str) -> String {
    let payload = serde_json::json!({
        "source": source,
        "subject_key": subject_key,
        "pipeline_version": pipeline_version,
        "options_hash": options_hash,
        "kind": kind,
    });
    sha256_hex(&canonical_json(&payload))
}

/// Deterministic hash of normalized job options, used as part of the
/// artifact key and to detect when a cached payload is reusable.
pub fn options_hash(options: &Value) -> String {
    sha256_hex(&canonical_json(options))
}

/// Content hash of an arbitrary JSON payload, used for cache write-skip
/// decisions (unchanged content never triggers a rewrite).
pub fn content_hash(payload: &Value) -> String {
    sha256_hex(&canonical_json(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_ignores_key_order() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn artifact_key_is_deterministic() {
        let k1 = artifact_key("github", "octocat", "v1", "opt-hash", "final_result");
        let k2 = artifact_key("github", "octocat", "v1", "opt-hash", "final_result");
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), 64);
    }

    #[test]
    fn artifact_key_changes_with_pipeline_version() {
        let k1 = artifact_key("github", "octocat", "v1", "opt-hash", "final_result");
        let k2 = artifact_key("github", "octocat", "v2", "opt-hash", "final_result");
        assert_ne!(k1, k2);
    }

    #[test]
    fn content_hash_is_order_independent() {
        let a = json!({"cards": {"profile": {"name": "ada"}}, "z": 1});
        let b = json!({"z": 1, "cards": {"profile": {"name": "ada"}}});
        assert_eq!(content_hash(&a), content_hash(&b));
    }
}
