//! Ambient stack shared by every crate in the analysis pipeline: config,
//! error taxonomy, canonical hashing. Domain-agnostic by design.

pub mod config;
pub mod error;
pub mod hash;

pub use config::Config;
pub use error::{CacheError, CacheResult, GateError, GateResult, SchedulerError, SchedulerResult, StoreError, StoreResult};
