//! Dual-mode event store facade and the SSE replay generator.
//!
//! Wraps a [`DurableEventStore`] and an optional [`RealtimeBroker`]: append
//! goes to whichever tier is configured, card-output reads prefer the
//! broker when present, and `stream_events` knows how to recover terminal
//! events the broker may have evicted.

use std::time::Duration;

use async_stream::stream;
use dinq_core::error::StoreResult;
use futures::Stream;
use serde_json::Value;

use crate::broker::RealtimeBroker;
use crate::durable::DurableEventStore;
use crate::types::{AppendEvent, EventType, StoredEvent};

#[derive(Clone)]
pub struct EventStore {
    durable: DurableEventStore,
    broker: Option<RealtimeBroker>,
    sse_batch_size: usize,
}

impl EventStore {
    pub fn durable_only(durable: DurableEventStore, config: &dinq_core::config::EventStoreConfig) -> Self {
        Self { durable, broker: None, sse_batch_size: config.sse_batch_size }
    }

    pub fn with_broker(durable: DurableEventStore, broker: RealtimeBroker, config: &dinq_core::config::EventStoreConfig) -> Self {
        Self { durable, broker: Some(broker), sse_batch_size: config.sse_batch_size }
    }

    pub fn is_realtime(&self) -> bool {
        self.broker.is_some()
    }

    /// Append one event. Realtime mode writes to the broker; terminal events
    /// are additionally best-effort persisted durably so SSE can recover if
    /// the broker forgot. Durable mode always goes straight to Postgres.
    pub async fn append(&self, event: AppendEvent) -> StoreResult<i64> {
        match &self.broker {
            Some(broker) => {
                let seq = match broker.append(&event).await {
                    Ok(seq) => seq,
                    Err(err) => {
                        tracing::warn!(job_id = %event.job_id, error = %err, "realtime broker append failed, falling back to durable store");
                        return Ok(self.durable.append(event).await?.seq);
                    }
                };
                if event.event_type.is_terminal() {
                    if let Err(err) = self.durable.append(event.clone()).await {
                        tracing::warn!(job_id = %event.job_id, error = %err, "best-effort durable persist of terminal event failed");
                    }
                }
                Ok(seq)
            }
            None => Ok(self.durable.append(event).await?.seq),
        }
    }

    pub async fn apply_delta(&self, job_id: &str, card_id: i64, field: &str, section: &str, format: &str, text_chunk: &str) -> StoreResult<i64> {
        if let Some(broker) = &self.broker {
            if let Err(err) = broker.apply_delta(job_id, card_id, field, section, format, text_chunk).await {
                tracing::warn!(job_id, card_id, error = %err, "realtime delta accumulation failed");
            }
        }
        let payload = serde_json::json!({"field": field, "section": section, "format": format, "text": text_chunk});
        self.append(AppendEvent::new(job_id, EventType::CardDelta, payload).with_card_id(card_id)).await
    }

    pub async fn apply_append(&self, job_id: &str, card_id: i64, field: &str, items: Vec<Value>, dedup_key: Option<&str>) -> StoreResult<i64> {
        if let Some(broker) = &self.broker {
            if let Err(err) = broker.apply_append(job_id, card_id, field, items.clone(), dedup_key).await {
                tracing::warn!(job_id, card_id, error = %err, "realtime append merge failed");
            }
        }
        let payload = serde_json::json!({"field": field, "items": items, "dedup_key": dedup_key});
        self.append(AppendEvent::new(job_id, EventType::CardAppend, payload).with_card_id(card_id)).await
    }

    /// Live envelope for one card: broker reassembly when realtime is on,
    /// otherwise the durable snapshot merged by [`crate::durable::CardOutputSink`].
    pub async fn get_card_output(&self, job_id: &str, card_id: i64, snapshot: Value) -> StoreResult<Value> {
        if let Some(broker) = &self.broker {
            match broker.get_card_output(job_id, card_id).await {
                Ok(v) if !v.get("data").map(Value::is_null).unwrap_or(true) => return Ok(v),
                Ok(_) => {}
                Err(err) => tracing::warn!(job_id, card_id, error = %err, "broker card-output read failed, using snapshot"),
            }
        }
        Ok(snapshot)
    }

    async fn terminal_marker(&self, job_id: &str) -> StoreResult<Option<String>> {
        if let Some(broker) = &self.broker {
            match broker.get_terminal_marker(job_id).await {
                Ok(Some(status)) => return Ok(Some(status)),
                Ok(None) => {}
                Err(err) => tracing::warn!(job_id, error = %err, "broker terminal marker read failed"),
            }
        }
        let seq = self.durable.terminal_seq(job_id).await?;
        Ok(seq.map(|_| String::new()))
    }

    pub async fn on_job_terminal(&self, job_id: &str, post_job_ttl_seconds: i64) {
        if let Some(broker) = &self.broker {
            if let Err(err) = broker.extend_post_job_ttl(job_id, post_job_ttl_seconds).await {
                tracing::warn!(job_id, error = %err, "failed to extend post-job broker TTL");
            }
        }
    }

    /// SSE replay generator: fetch-batch, terminal-recovery, keepalive,
    /// then stop once `last_seq` has caught up to the terminal event and a
    /// grace period has elapsed.
    pub fn stream_events<'a>(
        &'a self,
        job_id: String,
        mut after_seq: i64,
        keepalive: Duration,
        stop_when_done: bool,
        terminal_grace: Duration,
    ) -> impl Stream<Item = StoredEvent> + 'a {
        stream! {
            let batch_size: usize = self.sse_batch_size;
            let mut terminal_seq: Option<i64> = None;
            let mut terminal_deadline: Option<tokio::time::Instant> = None;

            loop {
                let batch = self.fetch_batch(&job_id, after_seq, batch_size).await;
                if !batch.is_empty() {
                    for event in batch {
                        after_seq = after_seq.max(event.seq);
                        if EventType::from_str_is_terminal(&event.event_type) {
                            terminal_seq = Some(event.seq);
                        }
                        yield event;
                    }
                    continue;
                }

                if stop_when_done && terminal_seq.is_none() {
                    match self.resolve_terminal(&job_id, after_seq).await {
                        Some(event) => {
                            terminal_seq = Some(event.seq);
                            after_seq = after_seq.max(event.seq);
                            yield event;
                            continue;
                        }
                        None => {}
                    }
                }

                if let Some(seq) = terminal_seq {
                    if after_seq >= seq {
                        let deadline = terminal_deadline.get_or_insert_with(|| tokio::time::Instant::now() + terminal_grace);
                        if tokio::time::Instant::now() >= *deadline {
                            return;
                        }
                    }
                }

                tokio::time::sleep(keepalive).await;
                yield StoredEvent::ping();
            }
        }
    }

    async fn fetch_batch(&self, job_id: &str, after_seq: i64, limit: usize) -> Vec<StoredEvent> {
        if let Some(broker) = &self.broker {
            match broker.fetch_events(job_id, after_seq, limit).await {
                Ok(events) if !events.is_empty() => return events,
                Ok(_) => {}
                Err(err) => tracing::warn!(job_id, error = %err, "broker event fetch failed, falling back to durable store"),
            }
        }
        self.durable
            .fetch_events(job_id, after_seq, limit)
            .await
            .unwrap_or_else(|err| {
                tracing::warn!(job_id, error = %err, "durable event fetch failed");
                Vec::new()
            })
    }

    /// One-shot recovery once a terminal marker is seen but no terminal
    /// event has been streamed yet: pull any terminal events the durable
    /// store has that weren't delivered, or synthesize one from the marker.
    async fn resolve_terminal(&self, job_id: &str, after_seq: i64) -> Option<StoredEvent> {
        let marker = self.terminal_marker(job_id).await.ok().flatten()?;

        let recovered = self
            .durable
            .fetch_events_by_types(job_id, &["job.completed", "job.failed"])
            .await
            .unwrap_or_default();

        if let Some(event) = recovered.into_iter().find(|e| e.seq > after_seq) {
            return Some(event);
        }

        // Broker knew the job ended but the durable store has no terminal
        // row (write raced the read): synthesize one from the marker so the
        // stream still resolves instead of hanging until `terminal_grace`.
        let event_type = if marker == "failed" { EventType::JobFailed } else { EventType::JobCompleted };
        Some(StoredEvent {
            job_id: job_id.to_string(),
            card_id: None,
            seq: after_seq + 1,
            event_type: event_type.as_str().to_string(),
            payload: serde_json::json!({"status": marker, "synthesized": true}),
            created_at: chrono::Utc::now(),
        })
    }
}

impl EventType {
    fn from_str_is_terminal(s: &str) -> bool {
        s == EventType::JobCompleted.as_str() || s == EventType::JobFailed.as_str()
    }
}
