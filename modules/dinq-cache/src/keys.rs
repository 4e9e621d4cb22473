//! Cache-specific key shapes layered over [`dinq_core::hash`].

use dinq_core::hash;
use serde_json::Value;

/// The well-known artifact `kind` for a job's authoritative post-run result.
/// Payload shape is `{"cards": {card_type -> data}}`, business cards only.
pub const FINAL_RESULT_KIND: &str = "final_result";

/// Subject-scoped artifact key for the cache tiers (§4.D).
pub fn artifact_key(source: &str, subject_key: &str, pipeline_version: &str, options_hash: &str, kind: &str) -> String {
    hash::artifact_key(source, subject_key, pipeline_version, options_hash, kind)
}

pub fn options_hash(options: &Value) -> String {
    hash::options_hash(options)
}

pub fn content_hash(payload: &Value) -> String {
    hash::content_hash(payload)
}

/// Final-result artifact key for a subject under a given pipeline version/options.
pub fn final_result_key(source: &str, subject_key: &str, pipeline_version: &str, options: &Value) -> String {
    artifact_key(source, subject_key, pipeline_version, &options_hash(options), FINAL_RESULT_KIND)
}
