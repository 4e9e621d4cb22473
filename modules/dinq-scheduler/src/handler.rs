//! The card handler contract: the typed seam between the scheduler and the
//! per-source logic that actually produces a card's data.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

/// What a handler hands back to the scheduler for gating and persistence.
#[derive(Debug, Clone)]
pub struct CardResult {
    pub data: Value,
    pub is_fallback: bool,
    pub meta: Option<Value>,
    /// Skip the quality gate entirely; the handler already validated internally.
    pub skip_validation: bool,
}

impl CardResult {
    pub fn ok(data: Value) -> Self {
        Self { data, is_fallback: false, meta: None, skip_validation: false }
    }

    pub fn fallback(data: Value) -> Self {
        Self { data, is_fallback: true, meta: None, skip_validation: false }
    }
}

/// Emitted by a handler mid-execution; the scheduler turns these into
/// `card.progress`/`card.delta`/`card.append` events.
#[derive(Debug, Clone)]
pub enum ProgressUpdate {
    Progress { step: String, message: String, data: Option<Value> },
    Delta { field: String, section: String, format: String, text_chunk: String },
    Append { field: String, items: Vec<Value>, dedup_key: Option<String> },
}

/// A sink handlers use to stream progress without depending on `dinq-events`
/// directly. The scheduler supplies the concrete implementation per card.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn emit(&self, update: ProgressUpdate);
}

/// A no-op sink for handlers exercised outside a running scheduler (unit tests).
pub struct NullProgressSink;

#[async_trait]
impl ProgressSink for NullProgressSink {
    async fn emit(&self, _update: ProgressUpdate) {}
}

/// The stream shape a handler advertises ahead of any `card.delta` events it
/// will emit, carried on `card.started`.
#[derive(Debug, Clone, Serialize)]
pub struct StreamSpec {
    pub field: String,
    pub format: String,
    pub sections: Vec<String>,
}

/// Everything a handler needs to execute one card.
pub struct ExecutionContext {
    pub job_id: String,
    pub card_id: i64,
    pub user_id: String,
    pub source: String,
    pub card_type: String,
    pub input: Value,
    pub options: Value,
    /// Already-produced artifacts, keyed by the artifact type the handler
    /// declared via [`CardHandler::required_artifacts`].
    pub artifacts: HashMap<String, Value>,
    pub retry_count: u32,
    pub progress: Arc<dyn ProgressSink>,
}

impl ExecutionContext {
    pub async fn emit_progress(&self, step: impl Into<String>, message: impl Into<String>, data: Option<Value>) {
        self.progress.emit(ProgressUpdate::Progress { step: step.into(), message: message.into(), data }).await;
    }

    pub async fn emit_delta(&self, field: impl Into<String>, section: impl Into<String>, format: impl Into<String>, text_chunk: impl Into<String>) {
        self.progress
            .emit(ProgressUpdate::Delta { field: field.into(), section: section.into(), format: format.into(), text_chunk: text_chunk.into() })
            .await;
    }

    pub async fn emit_append(&self, field: impl Into<String>, items: Vec<Value>, dedup_key: Option<String>) {
        self.progress.emit(ProgressUpdate::Append { field: field.into(), items, dedup_key }).await;
    }
}

/// A handler executes one `(source, card_type)` card. Its declared
/// attributes (`source`, `card_type`, `version`) let the scheduler route to
/// it; `version` also feeds the cache key so bumping it invalidates every
/// payload cached under the old version.
#[async_trait]
pub trait CardHandler: Send + Sync {
    fn source(&self) -> &str;
    fn card_type(&self) -> &str;
    fn version(&self) -> &str;

    async fn execute(&self, ctx: &ExecutionContext) -> anyhow::Result<CardResult>;

    /// Artifact types to pre-load into `ExecutionContext::artifacts` before
    /// `execute` runs (e.g. `resource.github.data`). Empty by default.
    fn required_artifacts(&self) -> &[&str] {
        &[]
    }

    /// The stream shape advertised on `card.started`. `None` for handlers
    /// that don't stream deltas.
    fn stream_spec(&self) -> Option<StreamSpec> {
        None
    }

    /// Built when the quality gate's retry budget is exhausted and the
    /// handler wants a say in its own fallback shape, instead of the gate's
    /// generic `fallback_for`. Unused unless a handler overrides it.
    async fn fallback(&self, ctx: &ExecutionContext, error: Option<&anyhow::Error>) -> CardResult {
        let _ = error;
        CardResult::fallback(serde_json::json!({
            "_meta": {"fallback": true, "preserve_empty": true, "code": format!("fallback_{}", ctx.card_type)}
        }))
    }
}

/// Immutable registry of handlers, built once at startup and resolved by
/// `(source, card_type)`. Mirrors `dinq_gate::GateRegistry`'s shape.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(String, String), Arc<dyn CardHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn CardHandler>) {
        let key = (handler.source().to_string(), handler.card_type().to_string());
        self.handlers.insert(key, handler);
    }

    pub fn resolve(&self, source: &str, card_type: &str) -> Option<Arc<dyn CardHandler>> {
        self.handlers.get(&(source.to_string(), card_type.to_string())).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl CardHandler for EchoHandler {
        fn source(&self) -> &str {
            "github"
        }
        fn card_type(&self) -> &str {
            "profile"
        }
        fn version(&self) -> &str {
            "v1"
        }

        async fn execute(&self, ctx: &ExecutionContext) -> anyhow::Result<CardResult> {
            Ok(CardResult::ok(ctx.input.clone()))
        }
    }

    #[test]
    fn registry_resolves_by_source_and_card_type() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(EchoHandler));

        assert!(registry.resolve("github", "profile").is_some());
        assert!(registry.resolve("github", "summary").is_none());
        assert!(registry.resolve("scholar", "profile").is_none());
    }
}
