//! Concrete validators for a representative set of `(source, card_type)`
//! pairs, registered into a [`GateRegistry`] at startup.
//!
//! Each validator checks for a single non-empty field (text or list) and
//! builds a schema-stable, `preserve_empty` fallback payload when the
//! handler can't produce a real one. New sources plug in the same way:
//! one `TextFieldValidator`/`ListFieldValidator` registration, no code change
//! to the gate itself.

use serde_json::{json, Value};

use crate::gate::{CardValidator, GateContext, GateDecision, GateIssue, GateRegistry};

fn fallback_meta(ctx: &GateContext) -> Value {
    json!({
        "fallback": true,
        "code": format!("fallback_{}", ctx.card_type),
        "preserve_empty": true,
    })
}

/// Validates that `data[field]` is a non-empty string.
pub struct TextFieldValidator {
    pub field: &'static str,
    pub fallback_text: fn(&GateContext) -> String,
}

impl CardValidator for TextFieldValidator {
    fn validate(&self, data: &Value, _ctx: &GateContext) -> GateDecision {
        let text = data.get(self.field).and_then(Value::as_str).unwrap_or("");
        if text.trim().is_empty() {
            GateDecision::Retry {
                normalized: data.clone(),
                issue: GateIssue {
                    code: format!("empty_{}", self.field),
                    message: format!("{} was empty", self.field),
                    retryable: true,
                },
            }
        } else {
            GateDecision::Accept { normalized: data.clone() }
        }
    }

    fn fallback(&self, ctx: &GateContext) -> Value {
        json!({ self.field: (self.fallback_text)(ctx), "_meta": fallback_meta(ctx) })
    }
}

/// Validates that `data[field]` is a non-empty array.
pub struct ListFieldValidator {
    pub field: &'static str,
}

impl CardValidator for ListFieldValidator {
    fn validate(&self, data: &Value, _ctx: &GateContext) -> GateDecision {
        let is_nonempty_list = matches!(data.get(self.field), Some(Value::Array(items)) if !items.is_empty());
        if is_nonempty_list {
            GateDecision::Accept { normalized: data.clone() }
        } else {
            GateDecision::Retry {
                normalized: data.clone(),
                issue: GateIssue {
                    code: format!("empty_{}", self.field),
                    message: format!("{} was empty", self.field),
                    retryable: true,
                },
            }
        }
    }

    fn fallback(&self, ctx: &GateContext) -> Value {
        // An empty list is the honest fallback: we have no real items to
        // offer, but the field keeps its schema (array, never missing).
        json!({ self.field: Value::Array(vec![]), "_meta": fallback_meta(ctx) })
    }
}

fn default_roast_text(_ctx: &GateContext) -> String {
    "We couldn't generate a roast for this profile this time — check back later.".to_string()
}

fn default_summary_text(_ctx: &GateContext) -> String {
    "A summary could not be generated for this profile right now.".to_string()
}

fn default_role_model_text(_ctx: &GateContext) -> String {
    "No role-model comparison could be generated for this profile.".to_string()
}

fn default_level_text(_ctx: &GateContext) -> String {
    "unknown".to_string()
}

fn default_wellbeing_text(_ctx: &GateContext) -> String {
    "Not enough signal to assess this dimension.".to_string()
}

/// Build a registry pre-populated with the gate's built-in `(source,
/// card_type)` validators. Application startup code can call this and then
/// `register` any additional source-specific validators before handing the
/// registry to the scheduler.
pub fn default_registry() -> GateRegistry {
    let mut registry = GateRegistry::new();

    registry.register("github", "roast", std::sync::Arc::new(TextFieldValidator { field: "roast", fallback_text: default_roast_text }));
    registry.register("github", "summary", std::sync::Arc::new(TextFieldValidator { field: "summary", fallback_text: default_summary_text }));
    registry.register("github", "role_model", std::sync::Arc::new(TextFieldValidator { field: "role_model", fallback_text: default_role_model_text }));
    registry.register("github", "repos", std::sync::Arc::new(ListFieldValidator { field: "repos" }));

    registry.register("scholar", "summary", std::sync::Arc::new(TextFieldValidator { field: "summary", fallback_text: default_summary_text }));
    registry.register("scholar", "role_model", std::sync::Arc::new(TextFieldValidator { field: "role_model", fallback_text: default_role_model_text }));
    registry.register("scholar", "level", std::sync::Arc::new(TextFieldValidator { field: "level", fallback_text: default_level_text }));
    registry.register("scholar", "papers", std::sync::Arc::new(ListFieldValidator { field: "papers" }));
    registry.register("scholar", "coauthors", std::sync::Arc::new(ListFieldValidator { field: "coauthors" }));
    registry.register("scholar", "news", std::sync::Arc::new(ListFieldValidator { field: "news" }));

    registry.register("linkedin", "skills", std::sync::Arc::new(ListFieldValidator { field: "skills" }));
    registry.register("linkedin", "career", std::sync::Arc::new(ListFieldValidator { field: "career" }));
    registry.register("linkedin", "colleagues_view", std::sync::Arc::new(TextFieldValidator { field: "colleagues_view", fallback_text: default_summary_text }));
    registry.register("linkedin", "life_well_being", std::sync::Arc::new(TextFieldValidator { field: "life_well_being", fallback_text: default_wellbeing_text }));

    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roast_fallback_is_deterministic_and_tagged() {
        let registry = default_registry();
        let ctx = GateContext { source: "github".into(), card_type: "roast".into(), retry_count: 3, max_retries: 2 };
        let fb1 = registry.fallback_for(&ctx);
        let fb2 = registry.fallback_for(&ctx);
        assert_eq!(fb1, fb2);
        assert_eq!(fb1["_meta"]["fallback"], true);
        assert_eq!(fb1["_meta"]["code"], "fallback_roast");
        assert_eq!(fb1["_meta"]["preserve_empty"], true);
        assert!(fb1["roast"].as_str().unwrap().len() > 0);
    }

    #[test]
    fn repos_empty_list_retries_then_falls_back_to_empty_array() {
        let registry = default_registry();
        let ctx = GateContext { source: "github".into(), card_type: "repos".into(), retry_count: 0, max_retries: 2 };
        match registry.validate_card_output(&json!({"repos": []}), &ctx) {
            GateDecision::Retry { .. } => {}
            _ => panic!("expected retry on empty repos list"),
        }
        let fb = registry.fallback_for(&ctx);
        assert_eq!(fb["repos"], json!([]));
    }
}
