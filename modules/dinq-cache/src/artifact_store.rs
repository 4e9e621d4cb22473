//! Per-job artifact store (§4.E): on-disk primary tier, relational secondary tier.
//!
//! Grounded on `artifact_store.py`. Disk is the fast path; the relational table
//! is a durability fallback used when the disk cache is unavailable or the
//! process topology changed between writer and reader.

use dinq_core::config::ArtifactStoreConfig;
use dinq_core::error::CacheResult;
use serde_json::Value;
use sqlx::PgPool;
use std::path::PathBuf;
use std::time::SystemTime;

use crate::disk;

#[derive(Debug, Clone, sqlx::FromRow)]
struct ArtifactRow {
    job_id: String,
    card_id: Option<i64>,
    #[sqlx(rename = "type")]
    artifact_type: String,
    payload: Value,
    file_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Artifact {
    pub job_id: String,
    pub card_id: Option<i64>,
    pub artifact_type: String,
    pub payload: Value,
    pub file_url: Option<String>,
}

pub struct ArtifactStore {
    pool: PgPool,
    config: ArtifactStoreConfig,
}

impl ArtifactStore {
    pub fn new(pool: PgPool, config: ArtifactStoreConfig) -> Self {
        Self { pool, config }
    }

    fn disk_path(&self, job_id: &str, artifact_type: &str) -> PathBuf {
        self.config.disk_dir.join(job_id).join(format!("{}.bin", disk::b64(artifact_type)))
    }

    fn disk_get(&self, job_id: &str, artifact_type: &str) -> Option<Artifact> {
        let path = self.disk_path(job_id, artifact_type);
        let metadata = std::fs::metadata(&path).ok()?;

        if self.config.disk_ttl_seconds > 0 {
            if let Ok(modified) = metadata.modified() {
                let age = SystemTime::now().duration_since(modified).unwrap_or_default();
                if age.as_secs() as i64 > self.config.disk_ttl_seconds {
                    let _ = std::fs::remove_file(&path);
                    return None;
                }
            }
        }

        let raw = std::fs::read(&path).ok()?;
        let decoded = disk::decode(&raw)?;
        let obj = decoded.as_object()?;
        let payload = obj.get("payload").cloned().unwrap_or_else(|| Value::Object(Default::default()));
        let file_url = obj.get("file_url").and_then(|v| v.as_str()).map(str::to_string);
        let card_id = obj.get("card_id").and_then(|v| v.as_i64());

        Some(Artifact {
            job_id: job_id.to_string(),
            card_id,
            artifact_type: artifact_type.to_string(),
            payload,
            file_url,
        })
    }

    fn disk_set(&self, job_id: &str, card_id: Option<i64>, artifact_type: &str, payload: &Value, file_url: Option<&str>) -> bool {
        let doc = serde_json::json!({"payload": payload, "file_url": file_url, "card_id": card_id});
        let Some(encoded) = disk::encode(&doc, self.config.compress, self.config.disk_max_bytes) else {
            return false;
        };
        let path = self.disk_path(job_id, artifact_type);
        disk::write_atomic(&path, &encoded).is_ok()
    }

    fn should_skip_db(&self, artifact_type: &str) -> bool {
        self.config.should_skip_db(artifact_type)
    }

    /// Save an artifact. Disk is written first; the DB write is skipped when
    /// the disk write succeeded and either the type is configured to skip DB
    /// persistence, or DB persistence is disabled outright.
    pub async fn save_artifact(
        &self,
        job_id: &str,
        card_id: Option<i64>,
        artifact_type: &str,
        payload: &Value,
        file_url: Option<&str>,
    ) -> CacheResult<Artifact> {
        let disk_ok = self.disk_set(job_id, card_id, artifact_type, payload, file_url);

        if disk_ok && self.should_skip_db(artifact_type) {
            return Ok(Artifact {
                job_id: job_id.to_string(),
                card_id,
                artifact_type: artifact_type.to_string(),
                payload: payload.clone(),
                file_url: file_url.map(str::to_string),
            });
        }

        sqlx::query(
            r#"
            INSERT INTO analysis_artifacts (job_id, card_id, type, payload, file_url)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(job_id)
        .bind(card_id)
        .bind(artifact_type)
        .bind(payload)
        .bind(file_url)
        .execute(&self.pool)
        .await?;

        if !disk_ok {
            let _ = self.disk_set(job_id, card_id, artifact_type, payload, file_url);
        }

        Ok(Artifact {
            job_id: job_id.to_string(),
            card_id,
            artifact_type: artifact_type.to_string(),
            payload: payload.clone(),
            file_url: file_url.map(str::to_string),
        })
    }

    /// Read an artifact, preferring disk; on miss, consult the DB and
    /// write-through to disk on success.
    pub async fn get_artifact(&self, job_id: &str, artifact_type: &str) -> CacheResult<Option<Artifact>> {
        if let Some(cached) = self.disk_get(job_id, artifact_type) {
            return Ok(Some(cached));
        }

        let row: Option<ArtifactRow> = sqlx::query_as(
            r#"
            SELECT job_id, card_id, type, payload, file_url
            FROM analysis_artifacts
            WHERE job_id = $1 AND type = $2
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(job_id)
        .bind(artifact_type)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };

        self.disk_set(job_id, row.card_id, &row.artifact_type, &row.payload, row.file_url.as_deref());

        Ok(Some(Artifact {
            job_id: row.job_id,
            card_id: row.card_id,
            artifact_type: row.artifact_type,
            payload: row.payload,
            file_url: row.file_url,
        }))
    }
}
