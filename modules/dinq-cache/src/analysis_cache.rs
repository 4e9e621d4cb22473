//! Multi-tier analysis cache (§4.D): SWR final-result reads, single-flight
//! refresh runs, throttled access-meta touches, and best-effort backup
//! read-through/replication plumbing.
//!
//! Grounded on `analysis_cache_store.py` end to end. L1 is the on-disk tier
//! from [`crate::disk`]; L2 is the `analysis_artifact_cache` table on the
//! primary database; the backup tier is the same table shape on a second,
//! optionally-configured database.

use chrono::{DateTime, Duration, Utc};
use dinq_core::config::CacheConfig;
use dinq_core::error::CacheResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::path::PathBuf;

use crate::disk;
use crate::keys;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
struct ArtifactCacheRow {
    artifact_key: String,
    kind: String,
    payload: Value,
    content_hash: Option<String>,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    meta: Value,
}

/// A cached artifact as handed back to callers (meta is an implementation detail).
#[derive(Debug, Clone)]
pub struct CachedArtifact {
    pub artifact_key: String,
    pub kind: String,
    pub payload: Value,
    pub content_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<ArtifactCacheRow> for CachedArtifact {
    fn from(row: ArtifactCacheRow) -> Self {
        Self {
            artifact_key: row.artifact_key,
            kind: row.kind,
            payload: row.payload,
            content_hash: row.content_hash,
            created_at: row.created_at,
            expires_at: row.expires_at,
        }
    }
}

/// Result of a stale-while-revalidate final-result read (§4.D).
#[derive(Debug, Clone)]
pub struct FinalResultRead {
    pub artifact_key: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub stale: bool,
}

pub struct AnalysisCacheStore {
    pool: PgPool,
    backup_pool: Option<PgPool>,
    l1_dir: Option<PathBuf>,
    config: CacheConfig,
}

impl AnalysisCacheStore {
    pub fn new(pool: PgPool, backup_pool: Option<PgPool>, l1_dir: Option<PathBuf>, config: CacheConfig) -> Self {
        Self { pool, backup_pool, l1_dir, config }
    }

    pub fn ttl_seconds_for(&self, source: &str) -> i64 {
        self.config.ttl_for_source(source)
    }

    // -- subjects -----------------------------------------------------------

    pub async fn get_or_create_subject(&self, source: &str, subject_key: &str) -> CacheResult<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO cache_subjects (source, subject_key)
            VALUES ($1, $2)
            ON CONFLICT (source, subject_key) DO UPDATE SET source = EXCLUDED.source
            RETURNING id
            "#,
        )
        .bind(source)
        .bind(subject_key)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    // -- single-flight refresh runs ------------------------------------------

    /// Attempt to claim the refresh run for `(subject_id, pipeline_version,
    /// options_hash)`. A stale `running` row (past `refresh_lock_ttl_seconds`)
    /// is marked `lock_expired` and superseded; a live one blocks the caller.
    pub async fn try_begin_refresh_run(&self, subject_id: i64, pipeline_version: &str, options_hash: &str) -> CacheResult<bool> {
        let lock_ttl = self.config.refresh_lock_ttl_seconds;
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            r#"
            SELECT id, started_at FROM cache_refresh_runs
            WHERE subject_id = $1 AND pipeline_version = $2 AND options_hash = $3 AND status = 'running'
            ORDER BY id DESC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(subject_id)
        .bind(pipeline_version)
        .bind(options_hash)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = existing {
            let run_id: i64 = row.try_get("id")?;
            let started_at: DateTime<Utc> = row.try_get("started_at")?;
            let age_seconds = Utc::now().signed_duration_since(started_at).num_seconds();
            if age_seconds < lock_ttl {
                tx.rollback().await?;
                return Ok(false);
            }
            sqlx::query(
                r#"UPDATE cache_refresh_runs SET status = 'failed', fail_reason = 'lock_expired', ended_at = now() WHERE id = $1"#,
            )
            .bind(run_id)
            .execute(&mut *tx)
            .await?;
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO cache_refresh_runs (subject_id, pipeline_version, options_hash, status, started_at)
            VALUES ($1, $2, $3, 'running', now())
            ON CONFLICT (subject_id, pipeline_version, options_hash) WHERE status = 'running' DO NOTHING
            "#,
        )
        .bind(subject_id)
        .bind(pipeline_version)
        .bind(options_hash)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        tx.commit().await?;
        Ok(true)
    }

    pub async fn fail_refresh_run(&self, subject_id: i64, pipeline_version: &str, options_hash: &str, reason: &str) -> CacheResult<()> {
        sqlx::query(
            r#"
            UPDATE cache_refresh_runs
            SET status = 'failed', fail_reason = $4, ended_at = now()
            WHERE subject_id = $1 AND pipeline_version = $2 AND options_hash = $3 AND status = 'running'
            "#,
        )
        .bind(subject_id)
        .bind(pipeline_version)
        .bind(options_hash)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_refresh_run(
        &self,
        subject_id: i64,
        pipeline_version: &str,
        options_hash: &str,
        artifact_key: &str,
        freshness_until: Option<DateTime<Utc>>,
    ) -> CacheResult<()> {
        sqlx::query(
            r#"
            UPDATE cache_refresh_runs
            SET status = 'completed', artifact_key = $4, freshness_until = $5, ended_at = now()
            WHERE subject_id = $1 AND pipeline_version = $2 AND options_hash = $3 AND status = 'running'
            "#,
        )
        .bind(subject_id)
        .bind(pipeline_version)
        .bind(options_hash)
        .bind(artifact_key)
        .bind(freshness_until)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_latest_cached_full_report(
        &self,
        subject_id: i64,
        pipeline_version: &str,
        options_hash: &str,
    ) -> CacheResult<Option<CachedArtifact>> {
        let row = sqlx::query(
            r#"
            SELECT artifact_key FROM cache_refresh_runs
            WHERE subject_id = $1 AND pipeline_version = $2 AND options_hash = $3
              AND status = 'completed' AND artifact_key IS NOT NULL
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(subject_id)
        .bind(pipeline_version)
        .bind(options_hash)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let artifact_key: String = row.try_get("artifact_key")?;
        self.get_cached_artifact(&artifact_key).await
    }

    // -- generic artifact reads/writes ---------------------------------------

    fn row_expired(&self, row: &ArtifactCacheRow) -> bool {
        row.expires_at.map(|expires_at| expires_at <= Utc::now()).unwrap_or(false)
    }

    fn l1_path(&self, artifact_key: &str) -> Option<PathBuf> {
        self.l1_dir.as_ref().map(|dir| dir.join(format!("{artifact_key}.bin")))
    }

    fn l1_get(&self, artifact_key: &str) -> Option<ArtifactCacheRow> {
        let path = self.l1_path(artifact_key)?;
        let raw = std::fs::read(path).ok()?;
        let value = disk::decode(&raw)?;
        serde_json::from_value(value).ok()
    }

    fn l1_set(&self, row: &ArtifactCacheRow) {
        let Some(path) = self.l1_path(&row.artifact_key) else { return };
        let Ok(value) = serde_json::to_value(row) else { return };
        let Some(encoded) = disk::encode(&value, true, 0) else { return };
        if let Err(err) = disk::write_atomic(&path, &encoded) {
            tracing::warn!(artifact_key = %row.artifact_key, %err, "l1 cache write failed");
        }
    }

    fn l1_delete(&self, artifact_key: &str) {
        if let Some(path) = self.l1_path(artifact_key) {
            let _ = std::fs::remove_file(path);
        }
    }

    fn merged_meta_on_write(existing: Option<&Value>, payload_size_bytes: usize) -> Value {
        let hit_count = existing.and_then(|m| m.get("hit_count")).and_then(Value::as_i64).unwrap_or(0);
        let last_access_at_s = existing.and_then(|m| m.get("last_access_at_s")).and_then(Value::as_i64).unwrap_or(0);
        serde_json::json!({
            "hit_count": hit_count,
            "last_access_at_s": last_access_at_s,
            "payload_size_bytes": payload_size_bytes,
        })
    }

    /// Best-effort, throttled hit-count/last-access bump. Never surfaces an error.
    async fn touch_access_meta(&self, artifact_key: &str, row: &ArtifactCacheRow) {
        let throttle = self.config.access_touch_throttle_seconds;
        let last_access_at_s = row.meta.get("last_access_at_s").and_then(Value::as_i64).unwrap_or(0);
        let now_s = Utc::now().timestamp();
        if throttle > 0 && now_s - last_access_at_s < throttle {
            return;
        }

        let hit_count = row.meta.get("hit_count").and_then(Value::as_i64).unwrap_or(0) + 1;
        let new_meta = serde_json::json!({
            "hit_count": hit_count,
            "last_access_at": Utc::now().to_rfc3339(),
            "last_access_at_s": now_s,
            "payload_size_bytes": row.meta.get("payload_size_bytes").cloned().unwrap_or(Value::from(0)),
        });

        if let Err(err) = sqlx::query("UPDATE analysis_artifact_cache SET meta = $2 WHERE artifact_key = $1")
            .bind(artifact_key)
            .bind(&new_meta)
            .execute(&self.pool)
            .await
        {
            tracing::warn!(artifact_key, %err, "access-meta touch failed");
            return;
        }

        let mut updated = row.clone();
        updated.meta = new_meta;
        self.l1_set(&updated);
    }

    /// Best-effort enqueue into the backup outbox; never surfaces an error.
    async fn enqueue_backup_outbox(&self, artifact_key: &str, kind: &str, content_hash: &str) {
        let result = sqlx::query(
            r#"
            INSERT INTO analysis_backup_outbox (artifact_key, kind, content_hash, status, retry_count, created_at)
            VALUES ($1, $2, $3, 'pending', 0, now())
            ON CONFLICT (artifact_key, content_hash) DO NOTHING
            "#,
        )
        .bind(artifact_key)
        .bind(kind)
        .bind(content_hash)
        .execute(&self.pool)
        .await;

        if let Err(err) = result {
            tracing::warn!(artifact_key, %err, "failed to enqueue backup outbox entry");
        }
    }

    /// Fetch from the backup tier on an L2 miss/expiry, rehydrating L1
    /// without re-enqueuing the outbox (that would create a replication loop).
    async fn backup_read_through(&self, artifact_key: &str) -> CacheResult<Option<CachedArtifact>> {
        let Some(backup_pool) = &self.backup_pool else { return Ok(None) };

        let row: Option<ArtifactCacheRow> = sqlx::query_as(
            r#"SELECT artifact_key, kind, payload, content_hash, created_at, expires_at, meta
               FROM analysis_artifact_cache WHERE artifact_key = $1"#,
        )
        .bind(artifact_key)
        .fetch_optional(backup_pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        if self.row_expired(&row) {
            return Ok(None);
        }
        self.l1_set(&row);
        Ok(Some(row.into()))
    }

    /// Non-final-result artifact read: deletes the row on expiry (no SWR contract).
    pub async fn get_cached_artifact(&self, artifact_key: &str) -> CacheResult<Option<CachedArtifact>> {
        if let Some(row) = self.l1_get(artifact_key) {
            if self.row_expired(&row) {
                self.l1_delete(artifact_key);
                sqlx::query("DELETE FROM analysis_artifact_cache WHERE artifact_key = $1")
                    .bind(artifact_key)
                    .execute(&self.pool)
                    .await?;
                return self.backup_read_through(artifact_key).await;
            }
            self.touch_access_meta(artifact_key, &row).await;
            return Ok(Some(row.into()));
        }

        let row: Option<ArtifactCacheRow> = sqlx::query_as(
            r#"SELECT artifact_key, kind, payload, content_hash, created_at, expires_at, meta
               FROM analysis_artifact_cache WHERE artifact_key = $1"#,
        )
        .bind(artifact_key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return self.backup_read_through(artifact_key).await;
        };

        if self.row_expired(&row) {
            sqlx::query("DELETE FROM analysis_artifact_cache WHERE artifact_key = $1")
                .bind(artifact_key)
                .execute(&self.pool)
                .await?;
            return self.backup_read_through(artifact_key).await;
        }

        self.l1_set(&row);
        self.touch_access_meta(artifact_key, &row).await;
        Ok(Some(row.into()))
    }

    /// Final-result read (SWR): never deletes an expired row, reports `stale` instead.
    pub async fn get_cached_final_result(
        &self,
        source: &str,
        subject_key: &str,
        pipeline_version: &str,
        options: &Value,
    ) -> CacheResult<Option<FinalResultRead>> {
        let artifact_key = keys::final_result_key(source, subject_key, pipeline_version, options);

        let row = match self.l1_get(&artifact_key) {
            Some(row) => Some(row),
            None => {
                let row: Option<ArtifactCacheRow> = sqlx::query_as(
                    r#"SELECT artifact_key, kind, payload, content_hash, created_at, expires_at, meta
                       FROM analysis_artifact_cache WHERE artifact_key = $1"#,
                )
                .bind(&artifact_key)
                .fetch_optional(&self.pool)
                .await?;
                if let Some(row) = &row {
                    self.l1_set(row);
                }
                row
            }
        };

        let Some(row) = row else {
            let backup = self.backup_read_through(&artifact_key).await?;
            return Ok(backup.map(|artifact| FinalResultRead {
                stale: artifact.expires_at.map(|e| e <= Utc::now()).unwrap_or(false),
                artifact_key: artifact.artifact_key,
                payload: artifact.payload,
                created_at: artifact.created_at,
                expires_at: artifact.expires_at,
            }));
        };

        let has_cards = row
            .payload
            .get("cards")
            .and_then(Value::as_object)
            .map(|cards| !cards.is_empty())
            .unwrap_or(false);
        if !has_cards {
            return Ok(None);
        }

        self.touch_access_meta(&artifact_key, &row).await;
        let stale = self.row_expired(&row);

        Ok(Some(FinalResultRead {
            artifact_key: row.artifact_key,
            payload: row.payload,
            created_at: row.created_at,
            expires_at: row.expires_at,
            stale,
        }))
    }

    /// Write path (§4.D): content-hash write-skip, L1-before-L2, backup enqueue.
    /// Skips the save entirely for a fallback-tagged payload — caching a fallback
    /// would poison future reads with a degraded result.
    pub async fn save_cached_artifact(&self, kind: &str, artifact_key: &str, payload: &Value, ttl_seconds: i64) -> CacheResult<CachedArtifact> {
        let now = Utc::now();
        let expires_at = now + Duration::seconds(ttl_seconds.max(0));

        if dinq_gate::is_fallback_tagged(payload) {
            tracing::warn!(artifact_key, kind, "not caching fallback-tagged payload");
            return Ok(CachedArtifact {
                artifact_key: artifact_key.to_string(),
                kind: kind.to_string(),
                payload: payload.clone(),
                content_hash: None,
                created_at: now,
                expires_at: Some(expires_at),
            });
        }

        let content_hash = keys::content_hash(payload);
        let payload_size_bytes = serde_json::to_vec(payload).map(|bytes| bytes.len()).unwrap_or(0);

        let existing_row = sqlx::query(r#"SELECT content_hash, meta FROM analysis_artifact_cache WHERE artifact_key = $1"#)
            .bind(artifact_key)
            .fetch_optional(&self.pool)
            .await?;

        let existing_hash: Option<String> = existing_row.as_ref().and_then(|r| r.try_get("content_hash").ok());
        let existing_meta: Option<Value> = existing_row.as_ref().and_then(|r| r.try_get("meta").ok());
        let unchanged = existing_hash.as_deref() == Some(content_hash.as_str());
        let meta = Self::merged_meta_on_write(existing_meta.as_ref(), payload_size_bytes);

        let row = ArtifactCacheRow {
            artifact_key: artifact_key.to_string(),
            kind: kind.to_string(),
            payload: payload.clone(),
            content_hash: Some(content_hash.clone()),
            created_at: now,
            expires_at: Some(expires_at),
            meta: meta.clone(),
        };
        self.l1_set(&row);

        if unchanged {
            sqlx::query("UPDATE analysis_artifact_cache SET meta = $2 WHERE artifact_key = $1")
                .bind(artifact_key)
                .bind(&meta)
                .execute(&self.pool)
                .await?;
        } else {
            sqlx::query(
                r#"
                INSERT INTO analysis_artifact_cache (artifact_key, kind, payload, content_hash, created_at, expires_at, meta)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (artifact_key) DO UPDATE SET
                    kind = EXCLUDED.kind,
                    payload = EXCLUDED.payload,
                    content_hash = EXCLUDED.content_hash,
                    expires_at = EXCLUDED.expires_at,
                    meta = EXCLUDED.meta
                "#,
            )
            .bind(artifact_key)
            .bind(kind)
            .bind(payload)
            .bind(&content_hash)
            .bind(now)
            .bind(expires_at)
            .bind(&meta)
            .execute(&self.pool)
            .await?;
        }

        self.enqueue_backup_outbox(artifact_key, kind, &content_hash).await;

        Ok(CachedArtifact {
            artifact_key: artifact_key.to_string(),
            kind: kind.to_string(),
            payload: payload.clone(),
            content_hash: Some(content_hash),
            created_at: now,
            expires_at: Some(expires_at),
        })
    }

    pub async fn save_full_report(
        &self,
        subject_id: i64,
        pipeline_version: &str,
        options_hash: &str,
        source: &str,
        subject_key: &str,
        payload: &Value,
        ttl_seconds: i64,
    ) -> CacheResult<CachedArtifact> {
        let artifact_key = keys::artifact_key(source, subject_key, pipeline_version, options_hash, "full_report");
        let artifact = self.save_cached_artifact("full_report", &artifact_key, payload, ttl_seconds).await?;
        self.complete_refresh_run(subject_id, pipeline_version, options_hash, &artifact_key, artifact.expires_at).await?;
        Ok(artifact)
    }

    pub async fn save_final_result(
        &self,
        subject_id: i64,
        source: &str,
        subject_key: &str,
        pipeline_version: &str,
        options_hash: &str,
        payload: &Value,
        ttl_seconds: i64,
    ) -> CacheResult<CachedArtifact> {
        let artifact_key = keys::artifact_key(source, subject_key, pipeline_version, options_hash, keys::FINAL_RESULT_KIND);
        let artifact = self.save_cached_artifact(keys::FINAL_RESULT_KIND, &artifact_key, payload, ttl_seconds).await?;
        self.complete_refresh_run(subject_id, pipeline_version, options_hash, &artifact_key, artifact.expires_at).await?;
        Ok(artifact)
    }
}
