//! Core types for the per-job event log. Domain-adjacent but storage-neutral:
//! nothing here knows whether it ends up in Postgres or a Redis stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The event-kind taxonomy from the data model (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    JobStarted,
    CardStarted,
    CardProgress,
    CardPrefill,
    CardDelta,
    CardAppend,
    CardCompleted,
    CardFailed,
    JobCompleted,
    JobFailed,
    Ping,
}

impl EventType {
    /// Terminal events resolve the SSE stream and are always best-effort
    /// persisted to the durable store, even in realtime mode.
    pub fn is_terminal(self) -> bool {
        matches!(self, EventType::JobCompleted | EventType::JobFailed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::JobStarted => "job.started",
            EventType::CardStarted => "card.started",
            EventType::CardProgress => "card.progress",
            EventType::CardPrefill => "card.prefill",
            EventType::CardDelta => "card.delta",
            EventType::CardAppend => "card.append",
            EventType::CardCompleted => "card.completed",
            EventType::CardFailed => "card.failed",
            EventType::JobCompleted => "job.completed",
            EventType::JobFailed => "job.failed",
            EventType::Ping => "ping",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "job.started" => EventType::JobStarted,
            "card.started" => EventType::CardStarted,
            "card.progress" => EventType::CardProgress,
            "card.prefill" => EventType::CardPrefill,
            "card.delta" => EventType::CardDelta,
            "card.append" => EventType::CardAppend,
            "card.completed" => EventType::CardCompleted,
            "card.failed" => EventType::CardFailed,
            "job.completed" => EventType::JobCompleted,
            "job.failed" => EventType::JobFailed,
            "ping" => EventType::Ping,
            other => return Err(format!("unknown event type: {other}")),
        })
    }
}

/// An event as durably stored. Returned by every read path, including the
/// synthesized recovery/ping events that never touch the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub job_id: String,
    pub card_id: Option<i64>,
    pub seq: i64,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl StoredEvent {
    /// Format as an SSE `data: <json>\n\n` frame per the stream protocol (§6).
    pub fn to_sse_frame(&self) -> String {
        let body = serde_json::json!({
            "source": "analysis",
            "event_type": self.event_type,
            "payload": {
                "job_id": self.job_id,
                "seq": self.seq,
                "card_id": self.card_id,
                "data": self.payload,
            },
        });
        format!("data: {}\n\n", serde_json::to_string(&body).unwrap_or_default())
    }

    pub fn ping() -> Self {
        Self {
            job_id: String::new(),
            card_id: None,
            seq: 0,
            event_type: EventType::Ping.to_string(),
            payload: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }
}

/// An event to be appended. The caller builds this; the store assigns `seq`/`created_at`.
#[derive(Debug, Clone)]
pub struct AppendEvent {
    pub job_id: String,
    pub card_id: Option<i64>,
    pub event_type: EventType,
    pub payload: serde_json::Value,
}

impl AppendEvent {
    pub fn new(job_id: impl Into<String>, event_type: EventType, payload: serde_json::Value) -> Self {
        Self {
            job_id: job_id.into(),
            card_id: None,
            event_type,
            payload,
        }
    }

    pub fn with_card_id(mut self, card_id: i64) -> Self {
        self.card_id = Some(card_id);
        self
    }
}

/// A single accumulated section of a card's `stream` field, growing as
/// `card.delta` events arrive for `(field, section)`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StreamField {
    pub format: String,
    pub sections: std::collections::BTreeMap<String, String>,
}
