//! Realtime (Redis) tier of the event log.
//!
//! Low-latency, best-effort: keys expire, streams are capped, and terminal
//! events are additionally persisted to the durable store so SSE can recover
//! if the broker forgot. Non-terminal events live here only.

use redis::AsyncCommands;
use serde_json::Value;

use crate::types::{AppendEvent, StoredEvent};

fn seq_key(job_id: &str) -> String {
    format!("job:{job_id}:seq")
}
fn stream_key(job_id: &str) -> String {
    format!("job:{job_id}:events")
}
fn terminal_key(job_id: &str) -> String {
    format!("job:{job_id}:terminal")
}
fn card_data_key(job_id: &str, card_id: i64) -> String {
    format!("job:{job_id}:card:{card_id}:data")
}
fn card_formats_key(job_id: &str, card_id: i64) -> String {
    format!("job:{job_id}:card:{card_id}:formats")
}
fn card_sections_key(job_id: &str, card_id: i64) -> String {
    format!("job:{job_id}:card:{card_id}:sections")
}
fn card_section_text_key(job_id: &str, card_id: i64, field: &str, section: &str) -> String {
    format!("job:{job_id}:card:{card_id}:section:{field}:{section}")
}

#[derive(Clone)]
pub struct RealtimeBroker {
    client: redis::Client,
    job_ttl_seconds: i64,
    job_max_events: i64,
}

impl RealtimeBroker {
    pub fn new(redis_url: &str, job_ttl_seconds: i64, job_max_events: i64) -> anyhow::Result<Self> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            job_ttl_seconds,
            job_max_events,
        })
    }

    async fn conn(&self) -> anyhow::Result<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// `INCR` the per-job sequence key, then `XADD` the event with explicit
    /// `id = "{seq}-0"` so replay and ordering match the durable tier's `seq`.
    pub async fn append(&self, event: &AppendEvent) -> anyhow::Result<i64> {
        let mut con = self.conn().await?;
        let job = event.job_id.as_str();

        let seq: i64 = con.incr(seq_key(job), 1).await?;
        let _: () = con.expire(seq_key(job), self.job_ttl_seconds).await?;

        let id = format!("{seq}-0");
        let payload_json = serde_json::to_string(&event.payload)?;
        let card_id = event.card_id.map(|c| c.to_string()).unwrap_or_default();

        let _: String = redis::cmd("XADD")
            .arg(stream_key(job))
            .arg("MAXLEN")
            .arg("~")
            .arg(self.job_max_events)
            .arg(&id)
            .arg("event_type")
            .arg(event.event_type.as_str())
            .arg("card_id")
            .arg(card_id)
            .arg("payload")
            .arg(payload_json)
            .query_async(&mut con)
            .await?;
        let _: () = con.expire(stream_key(job), self.job_ttl_seconds).await?;

        Ok(seq)
    }

    /// Append a per-field/section text chunk, accumulating via `APPEND`.
    pub async fn apply_delta(&self, job_id: &str, card_id: i64, field: &str, section: &str, format: &str, text_chunk: &str) -> anyhow::Result<()> {
        let mut con = self.conn().await?;
        let section_key = card_section_text_key(job_id, card_id, field, section);
        let _: i64 = con.append(&section_key, text_chunk).await?;
        let _: () = con.expire(&section_key, self.job_ttl_seconds).await?;
        let _: i64 = con.sadd(card_sections_key(job_id, card_id), format!("{field}:{section}")).await?;
        let _: bool = con.hset_nx(card_formats_key(job_id, card_id), field, format).await?;
        Ok(())
    }

    /// Merge `items` into the `data.{field}` list under optimistic locking
    /// (`WATCH`/`MULTI`/`EXEC`), deduping by `dedup_key` when present and
    /// preserving order of prior-then-incoming items.
    pub async fn apply_append(
        &self,
        job_id: &str,
        card_id: i64,
        field: &str,
        items: Vec<Value>,
        dedup_key: Option<&str>,
    ) -> anyhow::Result<()> {
        let mut con = self.conn().await?;
        let key = card_data_key(job_id, card_id);

        loop {
            let _: () = redis::cmd("WATCH").arg(&key).query_async(&mut con).await?;

            let current: Option<String> = con.get(&key).await?;
            let mut data: Value = current
                .as_deref()
                .and_then(|s| serde_json::from_str(s).ok())
                .unwrap_or_else(|| Value::Object(Default::default()));

            data = dinq_gate::envelope::merge_append_field(&data, field, &items, dedup_key);

            let mut pipe = redis::pipe();
            pipe.atomic().set(&key, serde_json::to_string(&data)?).expire(&key, self.job_ttl_seconds);

            let result: Option<()> = pipe.query_async(&mut con).await?;
            match result {
                Some(_) => return Ok(()),
                None => continue,
            }
        }
    }

    /// Reassemble the live envelope for one card: `data` plus accumulated
    /// `stream` text, pipelined as `GET`/`HGETALL`/`SMEMBERS` + batch `GET`.
    pub async fn get_card_output(&self, job_id: &str, card_id: i64) -> anyhow::Result<Value> {
        let mut con = self.conn().await?;

        let data: Option<String> = con.get(card_data_key(job_id, card_id)).await?;
        let data: Value = data.as_deref().and_then(|s| serde_json::from_str(s).ok()).unwrap_or(Value::Null);

        let formats: std::collections::HashMap<String, String> = con.hgetall(card_formats_key(job_id, card_id)).await?;
        let section_names: Vec<String> = con.smembers(card_sections_key(job_id, card_id)).await?;

        let mut stream = serde_json::Map::new();
        for name in &section_names {
            let Some((field, section)) = name.split_once(':') else { continue };
            let text: Option<String> = con.get(card_section_text_key(job_id, card_id, field, section)).await?;
            let entry = stream
                .entry(field.to_string())
                .or_insert_with(|| serde_json::json!({"format": formats.get(field).cloned().unwrap_or_default(), "sections": {}}));
            entry["sections"][section] = Value::String(text.unwrap_or_default());
        }

        Ok(serde_json::json!({"data": data, "stream": stream}))
    }

    /// Bulk variant amortizing round trips for callers needing many cards
    /// at once (e.g. the snapshot endpoint).
    pub async fn get_card_outputs(&self, job_id: &str, card_ids: &[i64]) -> anyhow::Result<std::collections::HashMap<i64, Value>> {
        let mut out = std::collections::HashMap::with_capacity(card_ids.len());
        for &card_id in card_ids {
            out.insert(card_id, self.get_card_output(job_id, card_id).await?);
        }
        Ok(out)
    }

    /// Read broker-resident events strictly after `after_seq`.
    pub async fn fetch_events(&self, job_id: &str, after_seq: i64, limit: usize) -> anyhow::Result<Vec<StoredEvent>> {
        let mut con = self.conn().await?;
        let start = format!("({after_seq}-0");

        let entries: Vec<(String, Vec<(String, String)>)> = redis::cmd("XRANGE")
            .arg(stream_key(job_id))
            .arg(start)
            .arg("+")
            .arg("COUNT")
            .arg(limit)
            .query_async(&mut con)
            .await?;

        let mut out = Vec::with_capacity(entries.len());
        for (id, fields) in entries {
            let seq: i64 = id.split('-').next().unwrap_or("0").parse().unwrap_or(0);
            let map: std::collections::HashMap<_, _> = fields.into_iter().collect();
            let event_type = map.get("event_type").cloned().unwrap_or_default();
            let card_id = map.get("card_id").and_then(|s| s.parse::<i64>().ok());
            let payload: Value = map
                .get("payload")
                .and_then(|s| serde_json::from_str(s).ok())
                .unwrap_or(Value::Null);

            out.push(StoredEvent {
                job_id: job_id.to_string(),
                card_id,
                seq,
                event_type,
                payload,
                created_at: chrono::Utc::now(),
            });
        }
        Ok(out)
    }

    pub async fn set_terminal_marker(&self, job_id: &str, status: &str) -> anyhow::Result<()> {
        let mut con = self.conn().await?;
        let _: () = con.set_ex(terminal_key(job_id), status, self.job_ttl_seconds as u64).await?;
        Ok(())
    }

    pub async fn get_terminal_marker(&self, job_id: &str) -> anyhow::Result<Option<String>> {
        let mut con = self.conn().await?;
        Ok(con.get(terminal_key(job_id)).await?)
    }

    /// Extend TTL briefly after terminal so late SSE readers can still
    /// recover the final events, then drop all per-job keys.
    pub async fn extend_post_job_ttl(&self, job_id: &str, post_job_ttl_seconds: i64) -> anyhow::Result<()> {
        let mut con = self.conn().await?;
        for key in [seq_key(job_id), stream_key(job_id), terminal_key(job_id)] {
            let _: () = con.expire(key, post_job_ttl_seconds).await?;
        }
        Ok(())
    }

    pub async fn cleanup_job(&self, job_id: &str) -> anyhow::Result<()> {
        let mut con = self.conn().await?;
        let pattern = format!("job:{job_id}:*");
        let keys: Vec<String> = con.keys(pattern).await?;
        if !keys.is_empty() {
            let _: () = con.del(keys).await?;
        }
        Ok(())
    }
}
