//! Per-(source, card_type) validator registry and retry-budget policy.

use std::collections::HashMap;
use std::sync::Arc;

use dinq_core::config::RetryConfig;
use serde_json::{json, Value};

/// Card-category used to pick a retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardCategory {
    /// `card_type` prefixed `resource.` — internal, pre-fetched inputs.
    Resource,
    /// An enumerated set of AI-generated business cards.
    Ai,
    /// Everything else: plain data/business cards.
    Base,
}

/// Card types whose output is LLM-generated prose/structure and therefore
/// gets the more generous AI retry budget. Representative of the source's
/// `quality_gate.py` fallback-builder registrations.
const AI_CARD_TYPES: &[&str] = &[
    "summary",
    "roast",
    "role_model",
    "repos",
    "news",
    "level",
    "skills",
    "career",
    "colleagues_view",
    "life_well_being",
    "coauthors",
    "papers",
];

pub fn category_for(card_type: &str) -> CardCategory {
    if card_type.starts_with("resource.") {
        CardCategory::Resource
    } else if AI_CARD_TYPES.contains(&card_type) {
        CardCategory::Ai
    } else {
        CardCategory::Base
    }
}

pub fn max_retries_for(card_type: &str, retries: &RetryConfig) -> u32 {
    match category_for(card_type) {
        CardCategory::Resource => retries.max_retries_resource,
        CardCategory::Ai => retries.max_retries_ai,
        CardCategory::Base => retries.max_retries_base,
    }
}

/// An internal card never appears to the user: its output can be pruned
/// and is never replayed verbatim through SSE.
pub fn is_internal_card(card_type: &str) -> bool {
    card_type == "full_report" || card_type.starts_with("resource.")
}

#[derive(Debug, Clone)]
pub struct GateIssue {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Clone)]
pub enum GateDecision {
    Accept { normalized: Value },
    Retry { normalized: Value, issue: GateIssue },
}

#[derive(Debug, Clone)]
pub struct GateContext {
    pub source: String,
    pub card_type: String,
    pub retry_count: u32,
    pub max_retries: u32,
}

/// Already-fallback data is always accepted on re-validation: retrying a
/// deterministic placeholder can never produce something better, and
/// accepting it prevents an infinite retry/fallback thrash loop.
pub fn is_fallback_tagged(data: &Value) -> bool {
    data.get("_meta")
        .and_then(|m| m.get("fallback"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Per-(source, card_type) validator. Implementations normalize `data` and
/// decide accept/retry; `fallback` builds the deterministic placeholder used
/// once the retry budget is exhausted.
pub trait CardValidator: Send + Sync {
    fn validate(&self, data: &Value, ctx: &GateContext) -> GateDecision;

    fn fallback(&self, ctx: &GateContext) -> Value;
}

/// Default validator used when no `(source, card_type)`-specific one is
/// registered: accepts any non-null, non-empty-object payload; rejects
/// `null`/`{}` as retryable (mirrors the source's default `bool(data)` check).
pub struct DefaultValidator;

impl CardValidator for DefaultValidator {
    fn validate(&self, data: &Value, _ctx: &GateContext) -> GateDecision {
        let looks_empty = matches!(data, Value::Null) || matches!(data, Value::Object(m) if m.is_empty());
        if looks_empty {
            GateDecision::Retry {
                normalized: data.clone(),
                issue: GateIssue {
                    code: "empty_payload".to_string(),
                    message: "handler returned an empty payload".to_string(),
                    retryable: true,
                },
            }
        } else {
            GateDecision::Accept { normalized: data.clone() }
        }
    }

    fn fallback(&self, ctx: &GateContext) -> Value {
        json!({
            "_meta": {
                "fallback": true,
                "code": format!("fallback_{}", ctx.card_type),
                "preserve_empty": true,
            }
        })
    }
}

/// Immutable map of validators, built once at startup and never mutated
/// afterward (recasts the source's duck-typed handler lookup, §9).
pub struct GateRegistry {
    validators: HashMap<(String, String), Arc<dyn CardValidator>>,
    default: Arc<dyn CardValidator>,
}

impl Default for GateRegistry {
    fn default() -> Self {
        Self {
            validators: HashMap::new(),
            default: Arc::new(DefaultValidator),
        }
    }
}

impl GateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source: impl Into<String>, card_type: impl Into<String>, validator: Arc<dyn CardValidator>) {
        self.validators.insert((source.into(), card_type.into()), validator);
    }

    fn resolve(&self, source: &str, card_type: &str) -> &Arc<dyn CardValidator> {
        self.validators
            .get(&(source.to_string(), card_type.to_string()))
            .unwrap_or(&self.default)
    }

    /// Validate a card's raw output. Fallback-tagged payloads always accept
    /// (anti-thrash); otherwise the resolved validator decides.
    pub fn validate_card_output(&self, data: &Value, ctx: &GateContext) -> GateDecision {
        if is_fallback_tagged(data) {
            return GateDecision::Accept { normalized: data.clone() };
        }
        self.resolve(&ctx.source, &ctx.card_type).validate(data, ctx)
    }

    pub fn fallback_for(&self, ctx: &GateContext) -> Value {
        self.resolve(&ctx.source, &ctx.card_type).fallback(ctx)
    }
}

/// Merge `extra` meta fields into `data._meta`, by-value (never mutates a
/// reference the caller still holds).
pub fn merge_meta(data: &Value, extra: &Value) -> Value {
    let mut data = match data {
        Value::Object(m) => m.clone(),
        other => {
            let mut m = serde_json::Map::new();
            m.insert("value".to_string(), other.clone());
            m
        }
    };
    let mut meta = match data.get("_meta") {
        Some(Value::Object(m)) => m.clone(),
        _ => serde_json::Map::new(),
    };
    if let Value::Object(extra_map) = extra {
        for (k, v) in extra_map {
            meta.insert(k.clone(), v.clone());
        }
    }
    data.insert("_meta".to_string(), Value::Object(meta));
    Value::Object(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_classification() {
        assert_eq!(category_for("resource.github_profile"), CardCategory::Resource);
        assert_eq!(category_for("roast"), CardCategory::Ai);
        assert_eq!(category_for("profile"), CardCategory::Base);
    }

    #[test]
    fn fallback_tagged_data_always_accepts() {
        let registry = GateRegistry::new();
        let ctx = GateContext { source: "github".into(), card_type: "roast".into(), retry_count: 3, max_retries: 2 };
        let data = json!({"roast": "", "_meta": {"fallback": true}});
        assert!(matches!(registry.validate_card_output(&data, &ctx), GateDecision::Accept { .. }));
    }

    #[test]
    fn default_validator_rejects_empty_object() {
        let registry = GateRegistry::new();
        let ctx = GateContext { source: "github".into(), card_type: "profile".into(), retry_count: 0, max_retries: 1 };
        match registry.validate_card_output(&json!({}), &ctx) {
            GateDecision::Retry { issue, .. } => assert_eq!(issue.code, "empty_payload"),
            _ => panic!("expected retry"),
        }
    }
}
