//! Runtime configuration, assembled once at process start from the environment.
//!
//! Mirrors the shape of the configuration surface in the spec: every knob here
//! corresponds to one line of that surface. Nothing reaches into `std::env`
//! outside of this module.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_str(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_str(key) {
        Some(v) => matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

fn clamp<T: PartialOrd>(value: T, lo: T, hi: T) -> T {
    if value < lo {
        lo
    } else if value > hi {
        hi
    } else {
        value
    }
}

/// Global scheduler concurrency knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_workers: usize,
    pub poll_interval: Duration,
    /// Per-group semaphore sizes. Unknown groups fall back to `default`.
    pub concurrency_group_limits: HashMap<String, usize>,
}

impl SchedulerConfig {
    fn from_env() -> Self {
        let max_workers = clamp(env_parse("SCHEDULER_MAX_WORKERS", 8usize), 1, 64);
        let poll_interval_seconds: f64 = env_parse("SCHEDULER_POLL_INTERVAL_SECONDS", 0.5);
        let mut concurrency_group_limits = HashMap::new();
        concurrency_group_limits.insert("resource".to_string(), max_workers);
        concurrency_group_limits.insert("llm".to_string(), max_workers.min(4));
        concurrency_group_limits.insert("github_api".to_string(), max_workers);
        concurrency_group_limits.insert("crawlbase".to_string(), max_workers);
        concurrency_group_limits.insert("apify".to_string(), max_workers.min(4));
        concurrency_group_limits.insert("default".to_string(), max_workers);

        if let Some(raw) = env_str("SCHEDULER_CONCURRENCY_GROUP_LIMITS") {
            for pair in raw.split(',') {
                let pair = pair.trim();
                if pair.is_empty() {
                    continue;
                }
                if let Some((group, limit)) = pair.split_once('=') {
                    if let Ok(n) = limit.trim().parse::<usize>() {
                        concurrency_group_limits.insert(group.trim().to_string(), n);
                    }
                }
            }
        }

        Self {
            max_workers,
            poll_interval: Duration::from_secs_f64(poll_interval_seconds.max(0.01)),
            concurrency_group_limits,
        }
    }

    /// Resolve the limit for a named group, falling back to `default`.
    pub fn group_limit(&self, group: &str) -> usize {
        self.concurrency_group_limits
            .get(group)
            .copied()
            .unwrap_or_else(|| {
                self.concurrency_group_limits
                    .get("default")
                    .copied()
                    .unwrap_or(self.max_workers)
            })
    }
}

/// Event store tuning.
#[derive(Debug, Clone)]
pub struct EventStoreConfig {
    pub sse_batch_size: usize,
    pub redis_job_ttl_seconds: i64,
    pub redis_job_max_events: i64,
    pub redis_cleanup_on_job_completed: bool,
    pub redis_post_job_ttl_seconds: i64,
}

impl EventStoreConfig {
    fn from_env() -> Self {
        Self {
            sse_batch_size: clamp(env_parse("SSE_BATCH_SIZE", 500usize), 1, 5000),
            redis_job_ttl_seconds: env_parse("REDIS_JOB_TTL_SECONDS", 86_400i64),
            redis_job_max_events: env_parse("REDIS_JOB_MAX_EVENTS", 10_000i64),
            redis_cleanup_on_job_completed: env_bool("REDIS_CLEANUP_ON_JOB_COMPLETED", true),
            redis_post_job_ttl_seconds: env_parse("REDIS_POST_JOB_TTL_SECONDS", 60i64),
        }
    }
}

/// Analysis cache tuning.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub default_ttl_seconds: i64,
    pub ttl_seconds_by_source: HashMap<String, i64>,
    pub backup_ttl_multiplier: i64,
    pub backup_max_ttl_seconds: i64,
    pub refresh_lock_ttl_seconds: i64,
    pub evictor_enabled: bool,
    pub evictor_interval_seconds: u64,
    pub evictor_stale_grace_seconds: i64,
    pub evictor_batch_size: usize,
    pub evictor_max_bytes_override: Option<u64>,
    pub access_touch_throttle_seconds: i64,
}

impl CacheConfig {
    fn from_env() -> Self {
        let mut ttl_seconds_by_source = HashMap::new();
        if let Some(raw) = env_str("CACHE_TTL_SECONDS_BY_SOURCE") {
            for pair in raw.split(',') {
                if let Some((source, ttl)) = pair.split_once('=') {
                    if let Ok(n) = ttl.trim().parse::<i64>() {
                        ttl_seconds_by_source.insert(source.trim().to_string(), n);
                    }
                }
            }
        }

        Self {
            default_ttl_seconds: env_parse("CACHE_TTL_SECONDS", 604_800i64),
            ttl_seconds_by_source,
            backup_ttl_multiplier: clamp(env_parse("BACKUP_TTL_MULTIPLIER", 4i64), 1, 365),
            backup_max_ttl_seconds: env_parse("BACKUP_MAX_TTL_SECONDS", 31_536_000i64),
            refresh_lock_ttl_seconds: clamp(env_parse("CACHE_REFRESH_LOCK_TTL_SECONDS", 900i64), 60, 86_400),
            evictor_enabled: env_bool("CACHE_EVICTOR_ENABLED", true),
            evictor_interval_seconds: env_parse("CACHE_EVICTOR_INTERVAL_SECONDS", 300u64),
            evictor_stale_grace_seconds: env_parse("CACHE_EVICTOR_STALE_GRACE_SECONDS", 3600i64),
            evictor_batch_size: env_parse("CACHE_EVICTOR_BATCH_SIZE", 500usize),
            evictor_max_bytes_override: env_str("CACHE_EVICTOR_MAX_BYTES").and_then(|v| v.parse().ok()),
            access_touch_throttle_seconds: env_parse("CACHE_ACCESS_TOUCH_THROTTLE_SECONDS", 15i64),
        }
    }

    pub fn ttl_for_source(&self, source: &str) -> i64 {
        self.ttl_seconds_by_source
            .get(source)
            .copied()
            .unwrap_or(self.default_ttl_seconds)
    }
}

/// Per-job artifact store tuning.
#[derive(Debug, Clone)]
pub struct ArtifactStoreConfig {
    pub disk_dir: PathBuf,
    pub disk_ttl_seconds: i64,
    pub disk_max_bytes: usize,
    pub compress: bool,
    pub skip_db_types: HashSet<String>,
    pub skip_db_prefixes: Vec<String>,
}

impl ArtifactStoreConfig {
    fn from_env() -> Self {
        let disk_dir = env_str("ARTIFACT_DISK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".local/artifacts"));

        let skip_db_types = env_str("ARTIFACT_STORE_SKIP_DB_TYPES")
            .map(|raw| raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        let skip_db_prefixes = env_str("ARTIFACT_STORE_SKIP_DB_PREFIXES")
            .map(|raw| raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        Self {
            disk_dir,
            disk_ttl_seconds: env_parse("ARTIFACT_DISK_TTL_SECONDS", 86_400i64),
            disk_max_bytes: env_parse("ARTIFACT_DISK_MAX_BYTES", 52_428_800usize),
            compress: env_bool("ARTIFACT_COMPRESS", true),
            skip_db_types,
            skip_db_prefixes,
        }
    }

    pub fn should_skip_db(&self, artifact_type: &str) -> bool {
        if artifact_type.is_empty() {
            return false;
        }
        if self.skip_db_types.contains(artifact_type) {
            return true;
        }
        self.skip_db_prefixes.iter().any(|p| !p.is_empty() && artifact_type.starts_with(p.as_str()))
    }
}

/// Card output persistence tuning.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub persist_to_db: bool,
    pub persist_max_bytes: usize,
}

impl PersistenceConfig {
    fn from_env() -> Self {
        Self {
            persist_to_db: env_bool("CARD_OUTPUT_PERSIST_TO_DB", true),
            persist_max_bytes: env_parse("CARD_OUTPUT_PERSIST_MAX_BYTES", 1_048_576usize),
        }
    }
}

/// Quality-gate retry budgets.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries_resource: u32,
    pub max_retries_ai: u32,
    pub max_retries_base: u32,
}

impl RetryConfig {
    fn from_env() -> Self {
        Self {
            max_retries_resource: env_parse("MAX_RETRIES_RESOURCE", 2u32),
            max_retries_ai: env_parse("MAX_RETRIES_AI", 2u32),
            max_retries_base: env_parse("MAX_RETRIES_BASE", 1u32),
        }
    }
}

/// Backup replicator tuning.
#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    pub enabled: bool,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub lock_ttl_seconds: i64,
    pub max_payload_bytes: usize,
}

impl ReplicatorConfig {
    fn from_env() -> Self {
        Self {
            enabled: env_bool("BACKUP_REPLICATOR_ENABLED", true),
            batch_size: env_parse("BACKUP_REPLICATOR_BATCH_SIZE", 25usize),
            poll_interval: Duration::from_secs_f64(env_parse("BACKUP_REPLICATOR_POLL_INTERVAL_SECONDS", 5.0)),
            lock_ttl_seconds: env_parse("BACKUP_REPLICATOR_LOCK_TTL_SECONDS", 120i64),
            max_payload_bytes: env_parse("BACKUP_REPLICATOR_MAX_PAYLOAD_BYTES", 5_242_880usize),
        }
    }
}

/// Top-level application configuration. Construct once via [`Config::from_env`]
/// and pass by `Arc` reference to every long-lived component.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Absent means durable-only mode: no realtime broker tier.
    pub redis_url: Option<String>,
    /// A second Postgres database used as an off-box replication target for
    /// cache artifacts. Absent disables the backup replicator entirely.
    pub backup_database_url: Option<String>,
    pub scheduler: SchedulerConfig,
    pub events: EventStoreConfig,
    pub cache: CacheConfig,
    pub artifact_store: ArtifactStoreConfig,
    pub persistence: PersistenceConfig,
    pub retries: RetryConfig,
    pub replicator: ReplicatorConfig,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DATABASE_URL")?,
            redis_url: env_str("REDIS_URL"),
            backup_database_url: env_str("BACKUP_DATABASE_URL"),
            scheduler: SchedulerConfig::from_env(),
            events: EventStoreConfig::from_env(),
            cache: CacheConfig::from_env(),
            artifact_store: ArtifactStoreConfig::from_env(),
            persistence: PersistenceConfig::from_env(),
            retries: RetryConfig::from_env(),
            replicator: ReplicatorConfig::from_env(),
        };

        config.log_summary();
        Ok(config)
    }

    fn log_summary(&self) {
        tracing::info!(
            max_workers = self.scheduler.max_workers,
            realtime_mode = self.redis_url.is_some(),
            backup_configured = self.backup_database_url.is_some(),
            sse_batch_size = self.events.sse_batch_size,
            "config loaded"
        );
    }
}
