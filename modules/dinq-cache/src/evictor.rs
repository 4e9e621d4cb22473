//! Local cache eviction for the file-backed L1 tier (§4.D "Local cache eviction").
//!
//! Grounded on `local_cache_eviction.py`. Runs only against the on-disk
//! artifact cache directory; the relational tiers have their own TTL-based
//! cleanup via normal row expiry checks on read.

use chrono::{DateTime, Duration, Utc};
use dinq_core::config::CacheConfig;
use serde_json::Value;
use std::path::PathBuf;

use crate::disk;

struct Candidate {
    path: PathBuf,
    created_at_s: i64,
    expires_at_s: Option<i64>,
    last_access_at_s: i64,
    hit_count: i64,
    size_bytes: u64,
}

pub struct LocalCacheEvictor {
    l1_dir: PathBuf,
    config: CacheConfig,
}

impl LocalCacheEvictor {
    pub fn new(l1_dir: PathBuf, config: CacheConfig) -> Self {
        Self { l1_dir, config }
    }

    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        if !self.config.evictor_enabled {
            return;
        }
        loop {
            if *shutdown.borrow() {
                return;
            }
            self.evict_once();
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(self.config.evictor_interval_seconds)) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// Budget is the configured override, or a conservative fixed default.
    /// (Querying actual filesystem free space needs an OS-specific crate the
    /// rest of this codebase doesn't otherwise pull in; the override knob
    /// covers production deployments that want a precise number.)
    fn disk_budget_bytes(&self) -> u64 {
        match self.config.evictor_max_bytes_override {
            Some(bytes) if bytes > 0 => bytes.max(64 * 1024 * 1024),
            _ => 512 * 1024 * 1024,
        }
    }

    fn list_candidates(&self) -> Vec<Candidate> {
        let mut out = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.l1_dir) else { return out };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("bin") {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let Ok(raw) = std::fs::read(&path) else { continue };
            let Some(value) = disk::decode(&raw) else { continue };
            let Some(obj) = value.as_object() else { continue };

            let created_at_s = obj
                .get("created_at")
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.timestamp())
                .unwrap_or_else(|| Utc::now().timestamp());

            let expires_at_s = obj
                .get("expires_at")
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.timestamp());

            let cache_meta = obj.get("meta").and_then(Value::as_object);
            let hit_count = cache_meta.and_then(|m| m.get("hit_count")).and_then(Value::as_i64).unwrap_or(0);
            let last_access_at_s = cache_meta
                .and_then(|m| m.get("last_access_at_s"))
                .and_then(Value::as_i64)
                .unwrap_or(created_at_s);

            out.push(Candidate {
                path,
                created_at_s,
                expires_at_s,
                last_access_at_s,
                hit_count,
                size_bytes: meta.len(),
            });
        }
        out
    }

    /// Phase 1: delete rows expired past the grace window. Returns the count removed.
    fn delete_expired(&self, candidates: &mut Vec<Candidate>, expired_before_s: i64) -> usize {
        let mut removed = 0;
        candidates.retain(|c| {
            let expired = c.expires_at_s.map(|e| e <= expired_before_s).unwrap_or(false);
            if expired {
                let _ = std::fs::remove_file(&c.path);
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    /// Phase 2: if still over budget, rank coldest-first and delete until freed.
    fn evict_by_budget(&self, candidates: &mut Vec<Candidate>, budget_bytes: u64) {
        let current: u64 = candidates.iter().map(|c| c.size_bytes).sum();
        if current <= budget_bytes {
            return;
        }

        let target = (budget_bytes as f64 * 0.8) as u64;
        let mut to_free = current.saturating_sub(target).max(1);
        let now_s = Utc::now().timestamp();

        candidates.sort_by_key(|c| {
            let expired_rank = match c.expires_at_s {
                Some(e) if e <= now_s => 0,
                _ => 1,
            };
            (expired_rank, c.hit_count, c.last_access_at_s, c.created_at_s)
        });

        for c in candidates.iter() {
            if to_free == 0 {
                break;
            }
            let _ = std::fs::remove_file(&c.path);
            to_free = to_free.saturating_sub(c.size_bytes.max(1));
        }
    }

    pub fn evict_once(&self) {
        if !self.l1_dir.exists() {
            return;
        }

        let budget = self.disk_budget_bytes();
        let grace = Duration::seconds(self.config.evictor_stale_grace_seconds.max(0));
        let expired_before_s = (Utc::now() - grace).timestamp();

        let mut candidates = self.list_candidates();
        let deleted_expired = self.delete_expired(&mut candidates, expired_before_s);

        let total: u64 = candidates.iter().map(|c| c.size_bytes).sum();
        if total <= (budget as f64 * 0.9) as u64 && deleted_expired == 0 {
            return;
        }

        self.evict_by_budget(&mut candidates, budget);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dinq_core::config::CacheConfig;
    use std::collections::HashMap;
    use std::path::Path;

    fn config(max_bytes: Option<u64>) -> CacheConfig {
        CacheConfig {
            default_ttl_seconds: 3600,
            ttl_seconds_by_source: HashMap::new(),
            backup_ttl_multiplier: 4,
            backup_max_ttl_seconds: 31_536_000,
            refresh_lock_ttl_seconds: 900,
            evictor_enabled: true,
            evictor_interval_seconds: 300,
            evictor_stale_grace_seconds: 0,
            evictor_batch_size: 500,
            evictor_max_bytes_override: max_bytes,
            access_touch_throttle_seconds: 15,
        }
    }

    fn write_row(dir: &Path, key: &str, expires_in_s: i64, hit_count: i64) -> u64 {
        let now = Utc::now();
        let row = serde_json::json!({
            "artifact_key": key,
            "kind": "resource.repos",
            "payload": {"a": 1},
            "content_hash": "h",
            "created_at": now.to_rfc3339(),
            "expires_at": (now + Duration::seconds(expires_in_s)).to_rfc3339(),
            "meta": {"hit_count": hit_count, "last_access_at_s": now.timestamp()},
        });
        let encoded = disk::encode(&row, false, 0).unwrap();
        disk::write_atomic(&dir.join(format!("{key}.bin")), &encoded).unwrap();
        encoded.len() as u64
    }

    #[test]
    fn delete_expired_removes_only_past_grace() {
        let dir = tempfile::tempdir().unwrap();
        write_row(dir.path(), "fresh", 3600, 0);
        write_row(dir.path(), "expired", -10, 0);

        let evictor = LocalCacheEvictor::new(dir.path().to_path_buf(), config(None));
        let mut candidates = evictor.list_candidates();
        assert_eq!(candidates.len(), 2);

        let removed = evictor.delete_expired(&mut candidates, Utc::now().timestamp());
        assert_eq!(removed, 1);
        assert_eq!(candidates.len(), 1);
        assert!(dir.path().join("fresh.bin").exists());
        assert!(!dir.path().join("expired.bin").exists());
    }

    #[test]
    fn evict_by_budget_prefers_cold_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cold_size = write_row(dir.path(), "cold", 3600, 0);
        let _hot_size = write_row(dir.path(), "hot", 3600, 100);

        // Budget large enough to keep exactly one entry (coldest survives eviction to 80%).
        let budget = cold_size + cold_size / 2;
        let evictor = LocalCacheEvictor::new(dir.path().to_path_buf(), config(Some(budget)));
        let mut candidates = evictor.list_candidates();
        evictor.evict_by_budget(&mut candidates, budget);

        assert!(!dir.path().join("cold.bin").exists());
        assert!(dir.path().join("hot.bin").exists());
    }
}
