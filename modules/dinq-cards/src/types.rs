//! Job/card domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Partial,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Partial | JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Partial => "partial",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "queued" => JobStatus::Queued,
            "running" => JobStatus::Running,
            "completed" => JobStatus::Completed,
            "partial" => JobStatus::Partial,
            "failed" => JobStatus::Failed,
            "cancelled" => JobStatus::Cancelled,
            other => return Err(format!("unknown job status: {other}")),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
    Timeout,
}

impl CardStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CardStatus::Pending => "pending",
            CardStatus::Ready => "ready",
            CardStatus::Running => "running",
            CardStatus::Completed => "completed",
            CardStatus::Failed => "failed",
            CardStatus::Skipped => "skipped",
            CardStatus::Timeout => "timeout",
        }
    }

    pub fn is_resolved(self) -> bool {
        matches!(self, CardStatus::Completed | CardStatus::Failed | CardStatus::Skipped | CardStatus::Timeout)
    }
}

impl fmt::Display for CardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CardStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => CardStatus::Pending,
            "ready" => CardStatus::Ready,
            "running" => CardStatus::Running,
            "completed" => CardStatus::Completed,
            "failed" => CardStatus::Failed,
            "skipped" => CardStatus::Skipped,
            "timeout" => CardStatus::Timeout,
            other => return Err(format!("unknown card status: {other}")),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    pub id: String,
    pub user_id: String,
    pub source: String,
    pub status: String,
    pub last_seq: i64,
    pub input: serde_json::Value,
    pub options: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub subject_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Card {
    pub id: i64,
    pub job_id: String,
    pub card_type: String,
    pub priority: i32,
    pub status: String,
    pub deadline_ms: Option<i64>,
    pub concurrency_group: Option<String>,
    pub input: serde_json::Value,
    pub deps: Option<Vec<String>>,
    pub output: serde_json::Value,
    pub retry_count: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Card {
    /// Legacy rule (§3): a non-`full_report` card with no declared `deps`
    /// implicitly depends on `full_report`.
    pub fn effective_deps(&self) -> Vec<String> {
        match &self.deps {
            Some(deps) => deps.clone(),
            None if self.card_type != "full_report" => vec!["full_report".to_string()],
            None => Vec::new(),
        }
    }

    pub fn is_internal(&self) -> bool {
        dinq_gate::is_internal_card(&self.card_type)
    }
}

/// One card in a job-creation plan (§6 "Job-creation payload").
#[derive(Debug, Clone, Deserialize)]
pub struct CardPlanEntry {
    pub card_type: String,
    #[serde(default)]
    pub priority: i32,
    pub deadline_ms: Option<i64>,
    pub concurrency_group: Option<String>,
    #[serde(default = "default_input")]
    pub input: serde_json::Value,
    pub depends_on: Option<Vec<String>>,
}

fn default_input() -> serde_json::Value {
    serde_json::json!({})
}

/// A job-creation request (§6 "Job-creation payload").
#[derive(Debug, Clone, Deserialize)]
pub struct JobCreateRequest {
    pub user_id: String,
    pub source: String,
    pub input: serde_json::Value,
    #[serde(default = "default_input")]
    pub options: serde_json::Value,
    pub plan: Vec<CardPlanEntry>,
    pub subject_key: Option<String>,
    pub idempotency_key: Option<String>,
    pub request_hash: Option<String>,
}
