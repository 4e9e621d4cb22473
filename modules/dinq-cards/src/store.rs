//! Durable job/card store: bundle creation, claiming, leases, dependency
//! release, skip cascades, and idempotent finalization.

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use dinq_core::error::{StoreError, StoreResult};
use dinq_events::durable::CardOutputSink;
use dinq_gate::envelope;
use serde_json::Value;
use sqlx::{PgPool, Row};

use crate::types::{Card, CardPlanEntry, CardStatus, Job, JobCreateRequest, JobStatus};

#[derive(Clone)]
pub struct JobCardStore {
    pool: PgPool,
}

impl JobCardStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Atomically creates the job row, all card rows (`pending`), the
    /// `seq=1: job.started` event, and the idempotency mapping when a key
    /// is supplied. On a unique-violation for the mapping, re-reads and
    /// returns the existing job if `request_hash` matches, else conflicts.
    pub async fn create_job_bundle(&self, req: JobCreateRequest) -> StoreResult<Job> {
        if let (Some(key), Some(hash)) = (&req.idempotency_key, &req.request_hash) {
            if let Some(existing) = self.resolve_idempotency(&req.user_id, key, hash).await? {
                return self.get_job(&existing).await;
            }
        }

        let mut tx = self.pool.begin().await?;

        let job_id: String = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (user_id, source, status, last_seq, input, options, subject_key, created_at, updated_at)
            VALUES ($1, $2, $3, 1, $4, $5, $6, now(), now())
            RETURNING id
            "#,
        )
        .bind(&req.user_id)
        .bind(&req.source)
        .bind(JobStatus::Queued.as_str())
        .bind(&req.input)
        .bind(&req.options)
        .bind(&req.subject_key)
        .fetch_one(&mut *tx)
        .await?;

        for entry in &req.plan {
            self.insert_card(&mut tx, &job_id, entry).await?;
        }

        sqlx::query(
            r#"
            INSERT INTO job_events (job_id, card_id, seq, event_type, payload, created_at)
            VALUES ($1, NULL, 1, 'job.started', $2, now())
            "#,
        )
        .bind(&job_id)
        .bind(serde_json::json!({"source": req.source, "user_id": req.user_id}))
        .execute(&mut *tx)
        .await?;

        if let (Some(key), Some(hash)) = (&req.idempotency_key, &req.request_hash) {
            let inserted = sqlx::query(
                r#"
                INSERT INTO idempotency_mappings (user_id, idempotency_key, request_hash, job_id)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (user_id, idempotency_key) DO NOTHING
                "#,
            )
            .bind(&req.user_id)
            .bind(key)
            .bind(hash)
            .bind(&job_id)
            .execute(&mut *tx)
            .await?;

            if inserted.rows_affected() == 0 {
                tx.rollback().await.ok();
                return match self.resolve_idempotency(&req.user_id, key, hash).await? {
                    Some(existing_job_id) => self.get_job(&existing_job_id).await,
                    None => Err(StoreError::IdempotencyConflict { job_id: job_id.clone() }),
                };
            }
        }

        tx.commit().await?;
        self.get_job(&job_id).await
    }

    async fn insert_card(&self, tx: &mut sqlx::Transaction<'_, sqlx::Postgres>, job_id: &str, entry: &CardPlanEntry) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO cards (job_id, card_type, priority, status, deadline_ms, concurrency_group, input, deps, output, retry_count, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0, now(), now())
            "#,
        )
        .bind(job_id)
        .bind(&entry.card_type)
        .bind(entry.priority)
        .bind(CardStatus::Pending.as_str())
        .bind(entry.deadline_ms)
        .bind(&entry.concurrency_group)
        .bind(&entry.input)
        .bind(entry.depends_on.as_deref())
        .bind(envelope::ensure_output_envelope(&Value::Null))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn resolve_idempotency(&self, user_id: &str, key: &str, request_hash: &str) -> StoreResult<Option<String>> {
        let row = sqlx::query(
            r#"SELECT request_hash, job_id FROM idempotency_mappings WHERE user_id = $1 AND idempotency_key = $2"#,
        )
        .bind(user_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            None => Ok(None),
            Some(row) => {
                let existing_hash: String = row.try_get("request_hash")?;
                let job_id: String = row.try_get("job_id")?;
                if existing_hash == request_hash {
                    Ok(Some(job_id))
                } else {
                    Err(StoreError::IdempotencyConflict { job_id })
                }
            }
        }
    }

    pub async fn get_job(&self, job_id: &str) -> StoreResult<Job> {
        sqlx::query_as::<_, Job>(
            r#"SELECT id, user_id, source, status, last_seq, input, options, result, subject_key, created_at, updated_at FROM jobs WHERE id = $1"#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))
    }

    /// `UPDATE ... WHERE id IN (SELECT ... FOR UPDATE SKIP LOCKED) RETURNING ...`:
    /// atomically transitions a batch `ready -> running`.
    pub async fn claim_ready_cards(&self, limit: i64) -> StoreResult<Vec<Card>> {
        let rows = sqlx::query_as::<_, Card>(
            r#"
            UPDATE cards
            SET status = 'running', started_at = now(), ended_at = NULL, updated_at = now()
            WHERE id IN (
                SELECT id FROM cards
                WHERE status = 'ready'
                ORDER BY priority DESC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $1
            )
            RETURNING id, job_id, card_type, priority, status, deadline_ms, concurrency_group, input, deps, output, retry_count, started_at, ended_at, created_at, updated_at
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Re-check the lease right before executing a card. If another worker
    /// already overwrote it, the caller must silently drop the card.
    pub async fn confirm_card_claim(&self, card_id: i64, started_at: chrono::DateTime<chrono::Utc>) -> StoreResult<bool> {
        let row = sqlx::query(
            r#"SELECT 1 FROM cards WHERE id = $1 AND status = 'running' AND started_at = $2 AND ended_at IS NULL"#,
        )
        .bind(card_id)
        .bind(started_at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Transitions every `pending` card whose effective deps are all
    /// `completed` to `ready`.
    pub async fn release_ready_cards(&self, job_id: &str) -> StoreResult<u64> {
        let cards = sqlx::query_as::<_, Card>(
            r#"SELECT id, job_id, card_type, priority, status, deadline_ms, concurrency_group, input, deps, output, retry_count, started_at, ended_at, created_at, updated_at FROM cards WHERE job_id = $1"#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        let completed: HashSet<&str> = cards
            .iter()
            .filter(|c| c.status == CardStatus::Completed.as_str())
            .map(|c| c.card_type.as_str())
            .collect();

        let mut released = 0u64;
        for card in cards.iter().filter(|c| c.status == CardStatus::Pending.as_str()) {
            let deps = card.effective_deps();
            if deps.iter().all(|d| completed.contains(d.as_str())) {
                let result = sqlx::query(r#"UPDATE cards SET status = 'ready', updated_at = now() WHERE id = $1 AND status = 'pending'"#)
                    .bind(card.id)
                    .execute(&self.pool)
                    .await?;
                released += result.rows_affected();
            }
        }
        Ok(released)
    }

    /// BFS over the dep graph (`dep -> dependents`), skipping every
    /// transitive dependent of `failed_card_type` currently in `{pending, ready}`.
    pub async fn mark_dependent_cards_skipped(&self, job_id: &str, failed_card_type: &str) -> StoreResult<u64> {
        let cards = sqlx::query_as::<_, Card>(
            r#"SELECT id, job_id, card_type, priority, status, deadline_ms, concurrency_group, input, deps, output, retry_count, started_at, ended_at, created_at, updated_at FROM cards WHERE job_id = $1"#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        let mut dependents_of: HashMap<String, Vec<&Card>> = HashMap::new();
        for card in &cards {
            for dep in card.effective_deps() {
                dependents_of.entry(dep).or_default().push(card);
            }
        }

        let mut queue: VecDeque<String> = VecDeque::from([failed_card_type.to_string()]);
        let mut to_skip: HashSet<i64> = HashSet::new();
        let mut visited: HashSet<String> = HashSet::new();

        while let Some(card_type) = queue.pop_front() {
            if !visited.insert(card_type.clone()) {
                continue;
            }
            if let Some(dependents) = dependents_of.get(card_type.as_str()) {
                for dependent in dependents {
                    if matches!(dependent.status.as_str(), "pending" | "ready") {
                        to_skip.insert(dependent.id);
                    }
                    queue.push_back(dependent.card_type.clone());
                }
            }
        }

        if to_skip.is_empty() {
            return Ok(0);
        }

        let ids: Vec<i64> = to_skip.into_iter().collect();
        let result = sqlx::query(r#"UPDATE cards SET status = 'skipped', ended_at = now(), updated_at = now() WHERE id = ANY($1)"#)
            .bind(&ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Conditionally updates the job row only when its current status is
    /// non-terminal. Returns `true` on the winning transition; all later
    /// callers (races, retries) get `false`.
    pub async fn try_finalize_job(&self, job_id: &str, terminal_status: JobStatus, result: Option<Value>) -> StoreResult<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2, result = $3, updated_at = now()
            WHERE id = $1 AND status NOT IN ('completed', 'partial', 'failed', 'cancelled')
            "#,
        )
        .bind(job_id)
        .bind(terminal_status.as_str())
        .bind(&result)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }

    pub async fn update_card_status(&self, card_id: i64, status: CardStatus, output: Option<Value>, retry_count: Option<i32>) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE cards
            SET status = $2,
                output = COALESCE($3, output),
                retry_count = COALESCE($4, retry_count),
                ended_at = CASE WHEN $2 IN ('completed', 'failed', 'skipped', 'timeout') THEN now() ELSE ended_at END,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(card_id)
        .bind(status.as_str())
        .bind(&output)
        .bind(retry_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Stream-preserving update: merges the incoming envelope's `data` with
    /// the card's existing `stream` rather than overwriting it wholesale,
    /// so accumulated deltas survive a completion write.
    pub async fn update_card_output_preserving_stream(&self, card_id: i64, new_data: Value) -> StoreResult<()> {
        let row = sqlx::query(r#"SELECT output FROM cards WHERE id = $1"#)
            .bind(card_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::CardNotFound(card_id))?;

        let existing: Value = row.try_get("output")?;
        let (_, stream) = envelope::extract_output_parts(&existing);
        let merged = serde_json::json!({"data": new_data, "stream": stream});

        sqlx::query(r#"UPDATE cards SET output = $2, updated_at = now() WHERE id = $1"#)
            .bind(card_id)
            .bind(&merged)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count_cards_by_status(&self, job_id: &str) -> StoreResult<HashMap<String, i64>> {
        let rows = sqlx::query(r#"SELECT status, COUNT(*) AS n FROM cards WHERE job_id = $1 GROUP BY status"#)
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;

        let mut counts = HashMap::new();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            counts.insert(status, n);
        }
        Ok(counts)
    }

    pub async fn get_card_output(&self, card_id: i64) -> StoreResult<Value> {
        let row = sqlx::query(r#"SELECT output FROM cards WHERE id = $1"#)
            .bind(card_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::CardNotFound(card_id))?;
        Ok(row.try_get("output")?)
    }

    /// Best-effort job status transition (the scheduler uses this once per
    /// job, per worker process, to flip `queued -> running`).
    pub async fn set_job_status(&self, job_id: &str, status: JobStatus) -> StoreResult<()> {
        sqlx::query(r#"UPDATE jobs SET status = $2, updated_at = now() WHERE id = $1"#)
            .bind(job_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_cards(&self, job_id: &str) -> StoreResult<Vec<Card>> {
        let cards = sqlx::query_as::<_, Card>(
            r#"SELECT id, job_id, card_type, priority, status, deadline_ms, concurrency_group, input, deps, output, retry_count, started_at, ended_at, created_at, updated_at FROM cards WHERE job_id = $1"#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(cards)
    }
}

/// Merges durable-mode `card.delta`/`card.append` events into
/// `job_cards.output` so plain snapshot reads see partial progress, without
/// `dinq-events` needing to know anything about the card store.
#[async_trait]
impl CardOutputSink for JobCardStore {
    async fn merge_delta(&self, card_id: i64, field: &str, section: &str, text_chunk: &str) -> anyhow::Result<()> {
        let existing = self.get_card_output(card_id).await?;
        let merged = envelope::apply_delta(&existing, field, section, "markdown", text_chunk);
        sqlx::query(r#"UPDATE cards SET output = $2, updated_at = now() WHERE id = $1"#)
            .bind(card_id)
            .bind(&merged)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn merge_append(&self, card_id: i64, field: &str, items: Vec<Value>, dedup_key: Option<&str>) -> anyhow::Result<()> {
        let existing = self.get_card_output(card_id).await?;
        let merged = envelope::apply_append(&existing, field, &items, dedup_key);
        sqlx::query(r#"UPDATE cards SET output = $2, updated_at = now() WHERE id = $1"#)
            .bind(card_id)
            .bind(&merged)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
