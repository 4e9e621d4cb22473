//! Durable (Postgres) tier of the event log.
//!
//! Single source of truth. Every event lands here eventually: directly in
//! durable mode, or best-effort (terminal events only) in realtime mode.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dinq_core::error::{StoreError, StoreResult};
use sqlx::PgPool;
use tokio::sync::Mutex;

use crate::types::{AppendEvent, EventType, StoredEvent};

/// A side channel the durable store uses to merge `card.delta`/`card.append`
/// events into `job_cards.output`, so a plain snapshot read (no SSE replay)
/// still sees partial progress. Kept as a trait so `dinq-events` never has
/// to depend on the job/card store crate.
#[async_trait]
pub trait CardOutputSink: Send + Sync {
    async fn merge_delta(&self, card_id: i64, field: &str, section: &str, text_chunk: &str) -> anyhow::Result<()>;

    async fn merge_append(
        &self,
        card_id: i64,
        field: &str,
        items: Vec<serde_json::Value>,
        dedup_key: Option<&str>,
    ) -> anyhow::Result<()>;
}

/// Per-job in-process mutex, preventing local races on `seq` allocation.
/// Cross-process ordering still relies on the DB's atomic `UPDATE ... RETURNING`.
#[derive(Default)]
struct JobLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl JobLocks {
    fn get(&self, job_id: &str) -> Arc<Mutex<()>> {
        let mut guard = self.locks.lock().unwrap();
        guard.entry(job_id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }
}

#[derive(Clone)]
pub struct DurableEventStore {
    pool: PgPool,
    locks: Arc<JobLocks>,
    sink: Option<Arc<dyn CardOutputSink>>,
}

impl DurableEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            locks: Arc::new(JobLocks::default()),
            sink: None,
        }
    }

    pub fn with_card_output_sink(mut self, sink: Arc<dyn CardOutputSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Atomically allocate the next `seq` for a job. Preferred path: a single
    /// `UPDATE ... RETURNING` statement, which Postgres executes under an
    /// implicit row lock — equivalent to the row-locked read-modify-write
    /// fallback engines without `RETURNING` would need, just in one round trip.
    async fn next_seq(&self, job_id: &str) -> StoreResult<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"UPDATE jobs SET last_seq = last_seq + 1 WHERE id = $1 RETURNING last_seq"#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;
        Ok(row.0)
    }

    /// Append an event, allocating its `seq`. Also merges `card.delta`/`card.append`
    /// into `job_cards.output` when a [`CardOutputSink`] is configured.
    pub async fn append(&self, event: AppendEvent) -> StoreResult<StoredEvent> {
        let job_lock = self.locks.get(&event.job_id);
        let _guard = job_lock.lock().await;

        let seq = self.next_seq(&event.job_id).await?;

        let row: (chrono::DateTime<chrono::Utc>,) = sqlx::query_as(
            r#"
            INSERT INTO job_events (job_id, card_id, seq, event_type, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, now())
            RETURNING created_at
            "#,
        )
        .bind(&event.job_id)
        .bind(event.card_id)
        .bind(seq)
        .bind(event.event_type.as_str())
        .bind(&event.payload)
        .fetch_one(&self.pool)
        .await?;

        let stored = StoredEvent {
            job_id: event.job_id.clone(),
            card_id: event.card_id,
            seq,
            event_type: event.event_type.as_str().to_string(),
            payload: event.payload,
            created_at: row.0,
        };

        if matches!(event.event_type, EventType::CardDelta | EventType::CardAppend) {
            self.merge_into_card_output(&stored).await;
        }

        Ok(stored)
    }

    /// Best-effort: a failure here must never fail the event append itself —
    /// the event is already durably recorded, the snapshot merge is a
    /// convenience for non-SSE readers.
    async fn merge_into_card_output(&self, event: &StoredEvent) {
        let Some(sink) = &self.sink else { return };
        let Some(card_id) = event.card_id else { return };

        let result = if event.event_type == EventType::CardDelta.as_str() {
            let field = event.payload.get("field").and_then(|v| v.as_str()).unwrap_or_default();
            let section = event.payload.get("section").and_then(|v| v.as_str()).unwrap_or_default();
            let text = event.payload.get("text").and_then(|v| v.as_str()).unwrap_or_default();
            sink.merge_delta(card_id, field, section, text).await
        } else {
            let field = event.payload.get("field").and_then(|v| v.as_str()).unwrap_or_default();
            let items = event
                .payload
                .get("items")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            let dedup_key = event.payload.get("dedup_key").and_then(|v| v.as_str());
            sink.merge_append(card_id, field, items, dedup_key).await
        };

        if let Err(err) = result {
            tracing::warn!(card_id, error = %err, "best-effort job_cards.output merge failed");
        }
    }

    /// Read events strictly after `seq_start`, oldest first, bounded by `limit`.
    pub async fn fetch_events(&self, job_id: &str, after_seq: i64, limit: usize) -> StoreResult<Vec<StoredEvent>> {
        let rows = sqlx::query_as::<_, StoredEventRow>(
            r#"
            SELECT job_id, card_id, seq, event_type, payload, created_at
            FROM job_events
            WHERE job_id = $1 AND seq > $2
            ORDER BY seq ASC
            LIMIT $3
            "#,
        )
        .bind(job_id)
        .bind(after_seq)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Events of a given type only (used to resolve the terminal marker when
    /// recovering from a broker miss).
    pub async fn fetch_events_by_types(&self, job_id: &str, event_types: &[&str]) -> StoreResult<Vec<StoredEvent>> {
        let rows = sqlx::query_as::<_, StoredEventRow>(
            r#"
            SELECT job_id, card_id, seq, event_type, payload, created_at
            FROM job_events
            WHERE job_id = $1 AND event_type = ANY($2)
            ORDER BY seq ASC
            "#,
        )
        .bind(job_id)
        .bind(event_types)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn get_last_seq(&self, job_id: &str) -> StoreResult<i64> {
        let row: (i64,) = sqlx::query_as("SELECT last_seq FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;
        Ok(row.0)
    }

    /// `MAX(seq)` over terminal event types — the durable-store fallback for
    /// resolving the terminal marker when the realtime broker has no record.
    pub async fn terminal_seq(&self, job_id: &str) -> StoreResult<Option<i64>> {
        let row: (Option<i64>,) = sqlx::query_as(
            r#"
            SELECT MAX(seq) FROM job_events
            WHERE job_id = $1 AND event_type IN ('job.completed', 'job.failed')
            "#,
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }
}

#[derive(sqlx::FromRow)]
struct StoredEventRow {
    job_id: String,
    card_id: Option<i64>,
    seq: i64,
    event_type: String,
    payload: serde_json::Value,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl From<StoredEventRow> for StoredEvent {
    fn from(row: StoredEventRow) -> Self {
        StoredEvent {
            job_id: row.job_id,
            card_id: row.card_id,
            seq: row.seq,
            event_type: row.event_type,
            payload: row.payload,
            created_at: row.created_at,
        }
    }
}
