//! Background replication from the local artifact cache to a remote backup
//! database, via an outbox table (§4.D "Backup replicator").
//!
//! Grounded on `backup_replicator.py`. Writers enqueue `(artifact_key, kind,
//! content_hash)` into `analysis_backup_outbox`; this worker drains it.

use chrono::{DateTime, Duration, Utc};
use dinq_core::config::{CacheConfig, ReplicatorConfig};
use serde_json::Value;
use sqlx::{PgPool, Row};

/// Boost the local TTL by `multiplier`, capped at `max_ttl_seconds`. Pulled out
/// of the method so it's testable without a live database connection.
fn compute_backup_expires_at(
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    multiplier: i64,
    max_ttl_seconds: i64,
) -> Option<DateTime<Utc>> {
    let expires_at = expires_at?;
    let ttl_seconds = (expires_at - created_at).num_seconds().max(0);
    if ttl_seconds == 0 {
        return Some(expires_at);
    }
    let boosted = ttl_seconds.saturating_mul(multiplier);
    let capped = boosted.min(max_ttl_seconds);
    Some(created_at + Duration::seconds(capped))
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct OutboxItem {
    id: i64,
    artifact_key: String,
    kind: String,
    content_hash: String,
    retry_count: i32,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct LocalArtifact {
    artifact_key: String,
    kind: String,
    payload: Value,
    content_hash: Option<String>,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

pub struct BackupReplicator {
    pool: PgPool,
    backup_pool: PgPool,
    replicator: ReplicatorConfig,
    cache: CacheConfig,
}

impl BackupReplicator {
    pub fn new(pool: PgPool, backup_pool: PgPool, replicator: ReplicatorConfig, cache: CacheConfig) -> Self {
        Self { pool, backup_pool, replicator, cache }
    }

    /// Runs until cancelled. Intended to be spawned as a background task by
    /// the process that owns the scheduler.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            if !self.replicator.enabled {
                return;
            }

            let processed = match self.drain_once().await {
                Ok(n) => n,
                Err(err) => {
                    tracing::error!(%err, "backup replicator drain failed");
                    0
                }
            };

            if processed == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.replicator.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }

    /// Claim and process one batch. Returns the number of outbox rows resolved
    /// (either replicated or dropped as orphaned).
    pub async fn drain_once(&self) -> anyhow::Result<usize> {
        let items = self.claim_batch().await?;
        if items.is_empty() {
            return Ok(0);
        }

        let mut processed = 0usize;
        for item in items {
            let local = self.load_local_artifact(&item.artifact_key).await?;
            let Some(local) = local else {
                self.mark_done(item.id).await?;
                processed += 1;
                continue;
            };

            match self.upsert_backup(&local).await {
                Ok(()) => {
                    self.mark_done(item.id).await?;
                    processed += 1;
                }
                Err(err) => {
                    self.mark_retry(item.id, item.retry_count + 1, &err.to_string()).await?;
                }
            }
        }

        Ok(processed)
    }

    async fn claim_batch(&self) -> anyhow::Result<Vec<OutboxItem>> {
        let token = uuid::Uuid::new_v4().to_string();
        let lock_expired_before = Utc::now() - Duration::seconds(self.replicator.lock_ttl_seconds);
        let limit = self.replicator.batch_size as i64;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE analysis_backup_outbox
            SET status = 'processing', lock_token = $1, locked_at = now()
            WHERE id IN (
                SELECT id FROM analysis_backup_outbox
                WHERE (status = 'pending' OR (status = 'processing' AND locked_at IS NOT NULL AND locked_at <= $2))
                  AND (next_retry_at IS NULL OR next_retry_at <= now())
                ORDER BY id ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(&token)
        .bind(lock_expired_before)
        .bind(limit)
        .execute(&mut *tx)
        .await?;

        let rows: Vec<OutboxItem> = sqlx::query_as(
            r#"
            SELECT id, artifact_key, kind, content_hash, retry_count
            FROM analysis_backup_outbox
            WHERE status = 'processing' AND lock_token = $1
            ORDER BY id ASC
            "#,
        )
        .bind(&token)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(rows)
    }

    async fn load_local_artifact(&self, artifact_key: &str) -> anyhow::Result<Option<LocalArtifact>> {
        let row: Option<LocalArtifact> = sqlx::query_as(
            r#"SELECT artifact_key, kind, payload, content_hash, created_at, expires_at
               FROM analysis_artifact_cache WHERE artifact_key = $1"#,
        )
        .bind(artifact_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.filter(|r| r.payload.is_object() && !r.payload.as_object().unwrap().is_empty()))
    }

    fn backup_expires_at(&self, created_at: DateTime<Utc>, expires_at: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        compute_backup_expires_at(created_at, expires_at, self.cache.backup_ttl_multiplier, self.cache.backup_max_ttl_seconds)
    }

    async fn upsert_backup(&self, local: &LocalArtifact) -> anyhow::Result<()> {
        let payload_size = serde_json::to_vec(&local.payload).map(|b| b.len()).unwrap_or(0);
        if self.replicator.max_payload_bytes > 0 && payload_size > self.replicator.max_payload_bytes {
            anyhow::bail!("payload too large for backup (> {} bytes)", self.replicator.max_payload_bytes);
        }

        let existing = sqlx::query("SELECT content_hash FROM analysis_artifact_cache WHERE artifact_key = $1")
            .bind(&local.artifact_key)
            .fetch_optional(&self.backup_pool)
            .await?;

        if let Some(row) = &existing {
            let current_hash: Option<String> = row.try_get("content_hash")?;
            if local.content_hash.is_some() && current_hash == local.content_hash {
                return Ok(());
            }
        }

        let backup_expires_at = self.backup_expires_at(local.created_at, local.expires_at);

        sqlx::query(
            r#"
            INSERT INTO analysis_artifact_cache (artifact_key, kind, payload, content_hash, created_at, expires_at, meta)
            VALUES ($1, $2, $3, $4, $5, $6, '{}'::jsonb)
            ON CONFLICT (artifact_key) DO UPDATE SET
                kind = EXCLUDED.kind,
                payload = EXCLUDED.payload,
                content_hash = EXCLUDED.content_hash,
                created_at = EXCLUDED.created_at,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(&local.artifact_key)
        .bind(&local.kind)
        .bind(&local.payload)
        .bind(&local.content_hash)
        .bind(local.created_at)
        .bind(backup_expires_at)
        .execute(&self.backup_pool)
        .await?;

        Ok(())
    }

    async fn mark_done(&self, outbox_id: i64) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM analysis_backup_outbox WHERE id = $1")
            .bind(outbox_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_retry(&self, outbox_id: i64, retry_count: i32, error: &str) -> anyhow::Result<()> {
        let delay_seconds = 2i64.saturating_pow(retry_count.clamp(0, 10) as u32).min(3600);
        let next_retry_at = Utc::now() + Duration::seconds(delay_seconds);
        let truncated: String = error.chars().take(800).collect();

        sqlx::query(
            r#"
            UPDATE analysis_backup_outbox
            SET status = 'pending', retry_count = $2, next_retry_at = $3, last_error = $4, lock_token = NULL, locked_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(outbox_id)
        .bind(retry_count)
        .bind(next_retry_at)
        .bind(truncated)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_ttl_is_boosted_and_capped() {
        let created = Utc::now();
        let expires = created + Duration::seconds(1000);
        let boosted = compute_backup_expires_at(created, Some(expires), 4, 10_000_000).unwrap();
        assert_eq!((boosted - created).num_seconds(), 4000);
    }

    #[test]
    fn backup_ttl_respects_cap() {
        let created = Utc::now();
        let expires = created + Duration::seconds(1_000_000);
        let boosted = compute_backup_expires_at(created, Some(expires), 10, 2_000_000).unwrap();
        assert_eq!((boosted - created).num_seconds(), 2_000_000);
    }

    #[test]
    fn no_expiry_means_no_backup_expiry() {
        let created = Utc::now();
        assert!(compute_backup_expires_at(created, None, 4, 10_000_000).is_none());
    }
}
