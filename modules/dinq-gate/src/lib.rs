pub mod envelope;
pub mod fallback;
pub mod gate;

pub use fallback::default_registry;
pub use gate::{
    category_for, is_fallback_tagged, is_internal_card, max_retries_for, merge_meta,
    CardCategory, CardValidator, GateContext, GateDecision, GateIssue, GateRegistry,
};
