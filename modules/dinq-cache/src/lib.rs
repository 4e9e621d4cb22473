//! Multi-tier caching for analysis results and per-job artifacts.

pub mod analysis_cache;
pub mod artifact_store;
pub mod backup_replicator;
mod disk;
pub mod evictor;
pub mod keys;

pub use analysis_cache::{AnalysisCacheStore, CachedArtifact, FinalResultRead};
pub use artifact_store::{Artifact, ArtifactStore};
pub use backup_replicator::BackupReplicator;
pub use evictor::LocalCacheEvictor;
