//! The dispatch loop: claim ready cards, execute them under a bounded global
//! pool plus per-group semaphores, run the quality gate, retry or fall back,
//! and finalize jobs once every card resolves.
//!
//! The `drain_pending` FIFO rotation, the "claim `min(10, available)` when
//! the local queue is short" rule, and the four-branch finalize logic follow
//! an OS `ThreadPoolExecutor`-style dispatcher translated onto `tokio::spawn`
//! plus `tokio::sync::Semaphore`. The overall shape of "a work queue, drained
//! by a loop, that can grow while draining" is a common recursive-dispatch
//! idiom, not unique to this crate.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use dinq_cache::AnalysisCacheStore;
use dinq_cache::ArtifactStore;
use dinq_cards::{Card, CardStatus, Job, JobCardStore, JobStatus};
use dinq_core::config::{PersistenceConfig, RetryConfig, SchedulerConfig};
use dinq_core::error::GateError;
use dinq_events::{AppendEvent, EventStore, EventType};
use dinq_gate::{CardCategory, GateContext, GateDecision, GateIssue, GateRegistry};
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::handler::{CardHandler, ExecutionContext, HandlerRegistry, ProgressSink, ProgressUpdate};

/// A small fixed pool for the fire-and-forget final-result cache write,
/// mirroring `scheduler.py`'s dedicated `ThreadPoolExecutor` for that one job.
const CACHE_WRITE_CONCURRENCY: usize = 2;

fn truncate(message: &str, max_chars: usize) -> String {
    if message.chars().count() <= max_chars {
        message.to_string()
    } else {
        message.chars().take(max_chars).collect()
    }
}

enum GroupSlot {
    Unlimited,
    Bounded(OwnedSemaphorePermit),
}

struct SchedulerProgressSink {
    events: EventStore,
    job_id: String,
    card_id: i64,
    card_type: String,
}

#[async_trait::async_trait]
impl ProgressSink for SchedulerProgressSink {
    async fn emit(&self, update: ProgressUpdate) {
        match update {
            ProgressUpdate::Progress { step, message, data } => {
                let _ = self
                    .events
                    .append(
                        AppendEvent::new(
                            self.job_id.clone(),
                            EventType::CardProgress,
                            serde_json::json!({"card": self.card_type, "step": step, "message": message, "data": data}),
                        )
                        .with_card_id(self.card_id),
                    )
                    .await;
            }
            ProgressUpdate::Delta { field, section, format, text_chunk } => {
                let _ = self.events.apply_delta(&self.job_id, self.card_id, &field, &section, &format, &text_chunk).await;
            }
            ProgressUpdate::Append { field, items, dedup_key } => {
                let _ = self.events.apply_append(&self.job_id, self.card_id, &field, items, dedup_key.as_deref()).await;
            }
        }
    }
}

/// Handle returned by [`Scheduler::start`]: owns the loop's join handle and a
/// clone of the scheduler itself, so callers can still submit work or reach
/// into the scheduler after starting it. Exit behavior mirrors the source's
/// worker thread: `stop` signals the loop and joins with a short timeout.
pub struct SchedulerHandle {
    scheduler: Arc<Scheduler>,
    join: tokio::task::JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub async fn stop(self) {
        self.scheduler.stop_flag.store(true, Ordering::SeqCst);
        let _ = tokio::time::timeout(std::time::Duration::from_secs(2), self.join).await;
    }
}

pub struct Scheduler {
    cards: JobCardStore,
    events: EventStore,
    cache: AnalysisCacheStore,
    artifact_store: Option<ArtifactStore>,
    gate: GateRegistry,
    handlers: HandlerRegistry,
    scheduler_config: SchedulerConfig,
    retries: RetryConfig,
    persistence: PersistenceConfig,

    pending: Mutex<VecDeque<Card>>,
    dispatch_lock: Mutex<()>,
    inflight: AtomicUsize,
    group_semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
    running_jobs: Mutex<HashSet<String>>,
    cache_write_semaphore: Arc<Semaphore>,
    stop_flag: AtomicBool,
    self_ref: Weak<Scheduler>,
}

impl Scheduler {
    pub fn new(
        cards: JobCardStore,
        events: EventStore,
        cache: AnalysisCacheStore,
        artifact_store: Option<ArtifactStore>,
        gate: GateRegistry,
        handlers: HandlerRegistry,
        scheduler_config: SchedulerConfig,
        retries: RetryConfig,
        persistence: PersistenceConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            cards,
            events,
            cache,
            artifact_store,
            gate,
            handlers,
            scheduler_config,
            retries,
            persistence,
            pending: Mutex::new(VecDeque::new()),
            dispatch_lock: Mutex::new(()),
            inflight: AtomicUsize::new(0),
            group_semaphores: Mutex::new(HashMap::new()),
            running_jobs: Mutex::new(HashSet::new()),
            cache_write_semaphore: Arc::new(Semaphore::new(CACHE_WRITE_CONCURRENCY)),
            stop_flag: AtomicBool::new(false),
            self_ref: weak.clone(),
        })
    }

    fn arc(&self) -> Arc<Scheduler> {
        self.self_ref.upgrade().expect("scheduler outlives its own weak handle")
    }

    pub fn start(self: Arc<Self>) -> SchedulerHandle {
        self.stop_flag.store(false, Ordering::SeqCst);
        let scheduler = Arc::clone(&self);
        let join = tokio::spawn(async move { scheduler.run_loop().await });
        SchedulerHandle { scheduler: self, join }
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            if self.stop_flag.load(Ordering::SeqCst) {
                return;
            }

            let max_workers = self.scheduler_config.max_workers;
            let pending_len = self.pending.lock().unwrap().len();

            let claimed = if pending_len >= max_workers * 2 {
                Vec::new()
            } else {
                let available = max_workers.saturating_sub(self.inflight.load(Ordering::SeqCst));
                if available == 0 {
                    Vec::new()
                } else {
                    let limit = available.min(10) as i64;
                    match self.cards.claim_ready_cards(limit).await {
                        Ok(cards) => cards,
                        Err(err) => {
                            tracing::warn!(%err, "claim_ready_cards failed");
                            Vec::new()
                        }
                    }
                }
            };

            let claimed_any = !claimed.is_empty();
            if claimed_any {
                self.pending.lock().unwrap().extend(claimed);
            }

            let submitted = self.drain_pending();

            if !claimed_any && submitted == 0 {
                tokio::time::sleep(self.scheduler_config.poll_interval).await;
            }
        }
    }

    /// Rotates the pending FIFO at most once, submitting every card whose
    /// group has a free slot and re-queuing the rest at the back. Guarded by
    /// a non-reentrant try-lock so overlapping callers (the loop and a
    /// just-finished card) never race each other's rotation.
    fn drain_pending(&self) -> usize {
        let Ok(_guard) = self.dispatch_lock.try_lock() else { return 0 };

        let mut pending = self.pending.lock().unwrap();
        if pending.is_empty() {
            return 0;
        }

        let mut submitted = 0usize;
        let mut scan_budget = pending.len();

        while scan_budget > 0 && !pending.is_empty() {
            if self.inflight.load(Ordering::SeqCst) >= self.scheduler_config.max_workers {
                break;
            }
            let card = pending.pop_front().unwrap();
            let group = self.card_group(&card);

            match self.try_acquire_group_slot(&group) {
                Some(slot) => {
                    self.inflight.fetch_add(1, Ordering::SeqCst);
                    let scheduler = self.arc();
                    tokio::spawn(async move { scheduler.run_claimed_card(card, slot).await });
                    submitted += 1;
                    scan_budget = pending.len();
                }
                None => {
                    pending.push_back(card);
                    scan_budget -= 1;
                }
            }
        }

        submitted
    }

    async fn run_claimed_card(self: Arc<Self>, card: Card, _slot: GroupSlot) {
        self.execute_card(card).await;
        self.inflight.fetch_sub(1, Ordering::SeqCst);
        self.drain_pending();
    }

    fn card_group(&self, card: &Card) -> String {
        if let Some(group) = &card.concurrency_group {
            let group = group.trim().to_lowercase();
            if !group.is_empty() {
                return group;
            }
        }
        match dinq_gate::category_for(&card.card_type) {
            CardCategory::Resource => "resource".to_string(),
            CardCategory::Ai => "llm".to_string(),
            CardCategory::Base => "default".to_string(),
        }
    }

    fn try_acquire_group_slot(&self, group: &str) -> Option<GroupSlot> {
        let limit = self.scheduler_config.group_limit(group);
        if limit == 0 {
            return Some(GroupSlot::Unlimited);
        }
        let sem = {
            let mut sems = self.group_semaphores.lock().unwrap();
            Arc::clone(sems.entry(group.to_string()).or_insert_with(|| Arc::new(Semaphore::new(limit))))
        };
        sem.try_acquire_owned().ok().map(GroupSlot::Bounded)
    }

    // ---- per-card execution ----

    async fn execute_card(&self, card: Card) {
        let card_id = card.id;
        let job_id = card.job_id.clone();

        let job = match self.cards.get_job(&job_id).await {
            Ok(job) => job,
            Err(err) => {
                tracing::warn!(card_id, %err, "job lookup failed while executing card, failing card");
                let _ = self.cards.update_card_status(card_id, CardStatus::Failed, None, None).await;
                return;
            }
        };

        if let Some(started_at) = card.started_at {
            match self.cards.confirm_card_claim(card_id, started_at).await {
                Ok(true) => {}
                Ok(false) => return, // lease lost to another worker; they own finalization
                Err(err) => tracing::warn!(card_id, %err, "lease confirmation failed, proceeding anyway"),
            }
        }

        let should_set_running = {
            let mut running = self.running_jobs.lock().unwrap();
            running.insert(job_id.clone())
        };
        if should_set_running {
            if let Err(err) = self.cards.set_job_status(&job_id, JobStatus::Running).await {
                tracing::warn!(job_id = %job_id, %err, "failed to mark job running");
                self.running_jobs.lock().unwrap().remove(&job_id);
            }
        }

        let internal = card.is_internal();
        let handler = self.handlers.resolve(&job.source, &card.card_type);
        let stream_spec = handler.as_ref().and_then(|h| h.stream_spec());

        if let Err(err) = self
            .events
            .append(
                AppendEvent::new(
                    job_id.clone(),
                    EventType::CardStarted,
                    serde_json::json!({"card": card.card_type, "status": "running", "internal": internal, "stream": stream_spec}),
                )
                .with_card_id(card_id),
            )
            .await
        {
            tracing::warn!(job_id = %job_id, card_id, %err, "failed to emit card.started");
        }

        let started = Instant::now();

        match handler {
            Some(handler) => self.run_handler(&job, &card, internal, started, handler).await,
            None => {
                self.handle_card_failure(&job_id, &card, internal, started, "no_handler", format!("no handler for ({}, {})", job.source, card.card_type), false)
                    .await;
            }
        }

        self.update_job_state(&job_id).await;
    }

    async fn run_handler(&self, job: &Job, card: &Card, internal: bool, started: Instant, handler: Arc<dyn CardHandler>) {
        let artifacts = self.load_artifacts(&job.id, handler.as_ref()).await;

        let progress: Arc<dyn ProgressSink> = Arc::new(SchedulerProgressSink {
            events: self.events.clone(),
            job_id: job.id.clone(),
            card_id: card.id,
            card_type: card.card_type.clone(),
        });

        let ctx = ExecutionContext {
            job_id: job.id.clone(),
            card_id: card.id,
            user_id: job.user_id.clone(),
            source: job.source.clone(),
            card_type: card.card_type.clone(),
            input: card.input.clone(),
            options: job.options.clone(),
            artifacts,
            retry_count: card.retry_count.max(0) as u32,
            progress,
        };

        match handler.execute(&ctx).await {
            Ok(result) => self.handle_card_success(job, card, internal, started, result).await,
            Err(err) => {
                let retryable = matches!(GateError::classify(err.to_string()), GateError::Retryable(_));
                self.handle_card_failure(&job.id, card, internal, started, "exception", err.to_string(), retryable).await;
            }
        }
    }

    async fn load_artifacts(&self, job_id: &str, handler: &dyn CardHandler) -> HashMap<String, Value> {
        let mut out = HashMap::new();
        let Some(store) = &self.artifact_store else { return out };
        for artifact_type in handler.required_artifacts() {
            let artifact_type: &str = artifact_type;
            match store.get_artifact(job_id, artifact_type).await {
                Ok(Some(artifact)) => {
                    out.insert(artifact_type.to_string(), artifact.payload);
                }
                Ok(None) => {}
                Err(err) => tracing::warn!(job_id, artifact_type, %err, "failed to load artifact for handler"),
            }
        }
        out
    }

    async fn handle_card_success(&self, job: &Job, card: &Card, internal: bool, started: Instant, result: CardResultLike) {
        let card_id = card.id;
        let job_id = job.id.clone();
        let card_type = card.card_type.clone();

        let mut stored_output = result.data;
        if result.is_fallback {
            stored_output = dinq_gate::merge_meta(&stored_output, &serde_json::json!({"fallback": true}));
        }

        if !internal && !result.skip_validation {
            let max_retries = dinq_gate::max_retries_for(&card_type, &self.retries);
            let retry_count = card.retry_count.max(0) as u32;
            let gctx = GateContext { source: job.source.clone(), card_type: card_type.clone(), retry_count, max_retries };

            match self.gate.validate_card_output(&stored_output, &gctx) {
                GateDecision::Retry { normalized, issue } => {
                    if retry_count < max_retries {
                        self.retry_card(&job_id, card_id, &card_type, retry_count, max_retries, normalized, issue, started).await;
                        return;
                    }
                    tracing::warn!(job_id = %job_id, card = %card_type, "quality gate retry budget exhausted, using fallback");
                    stored_output = self.gate.fallback_for(&gctx);
                }
                GateDecision::Accept { normalized } => stored_output = normalized,
            }
        }

        let stored_output = if internal {
            Value::Object(Default::default())
        } else {
            self.cap_for_persistence(stored_output)
        };

        if let Err(err) = self.cards.update_card_output_preserving_stream(card_id, stored_output).await {
            tracing::warn!(job_id = %job_id, card_id, %err, "failed to persist card output");
        }
        if let Err(err) = self.cards.update_card_status(card_id, CardStatus::Completed, None, None).await {
            tracing::warn!(job_id = %job_id, card_id, %err, "failed to mark card completed");
        }

        let snapshot = self.cards.get_card_output(card_id).await.unwrap_or_else(|_| serde_json::json!({"data": {}, "stream": {}}));
        let merged_output = self.events.get_card_output(&job_id, card_id, snapshot.clone()).await.unwrap_or(snapshot);

        if let Err(err) = self
            .events
            .append(
                AppendEvent::new(
                    job_id.clone(),
                    EventType::CardCompleted,
                    serde_json::json!({
                        "card": card_type,
                        "payload": merged_output,
                        "internal": internal,
                        "timing": {"duration_ms": started.elapsed().as_millis() as i64},
                    }),
                )
                .with_card_id(card_id),
            )
            .await
        {
            tracing::warn!(job_id = %job_id, card_id, %err, "failed to emit card.completed");
        }

        if let Err(err) = self.cards.release_ready_cards(&job_id).await {
            tracing::warn!(job_id = %job_id, %err, "failed to release dependent cards");
        }
    }

    /// Caps a business card's persisted output per §6's "Persistence" surface:
    /// a disabled switch or an oversized payload is replaced with a small
    /// marker rather than ever silently truncating user-visible data.
    fn cap_for_persistence(&self, data: Value) -> Value {
        cap_output_for_persistence(data, self.persistence.persist_to_db, self.persistence.persist_max_bytes)
    }

    async fn retry_card(&self, job_id: &str, card_id: i64, card_type: &str, retry_count: u32, max_retries: u32, normalized: Value, issue: GateIssue, started: Instant) {
        let next_retry = retry_count + 1;
        let prefill = dinq_gate::envelope::ensure_output_envelope(&normalized);

        if let Err(err) = self.cards.update_card_status(card_id, CardStatus::Ready, Some(prefill.clone()), Some(next_retry as i32)).await {
            tracing::warn!(job_id, card_id, %err, "failed to persist retry prefill");
        }

        let _ = self
            .events
            .append(AppendEvent::new(job_id.to_string(), EventType::CardPrefill, serde_json::json!({"card": card_type, "payload": prefill})).with_card_id(card_id))
            .await;

        let _ = self
            .events
            .append(
                AppendEvent::new(
                    job_id.to_string(),
                    EventType::CardProgress,
                    serde_json::json!({
                        "card": card_type,
                        "step": "retry",
                        "message": format!("retrying {card_type} ({next_retry}/{max_retries})"),
                        "data": {"code": issue.code, "reason": issue.message, "attempt_duration_ms": started.elapsed().as_millis() as i64},
                    }),
                )
                .with_card_id(card_id),
            )
            .await;
    }

    /// Shared failure path for an unroutable card, a handler exception, or a
    /// quality-gate decision the caller has already turned into a classification.
    async fn handle_card_failure(&self, job_id: &str, card: &Card, internal: bool, started: Instant, code: &str, message: String, retryable: bool) {
        let card_type = &card.card_type;
        let max_retries = dinq_gate::max_retries_for(card_type, &self.retries);
        let retry_count = card.retry_count.max(0) as u32;

        if retryable && retry_count < max_retries {
            let next_retry = retry_count + 1;
            if let Err(err) = self.cards.update_card_status(card.id, CardStatus::Ready, None, Some(next_retry as i32)).await {
                tracing::warn!(job_id, card_id = card.id, %err, "failed to requeue card after exception");
            }
            let _ = self
                .events
                .append(
                    AppendEvent::new(
                        job_id.to_string(),
                        EventType::CardProgress,
                        serde_json::json!({
                            "card": card_type,
                            "step": "retry",
                            "message": format!("retrying {card_type} ({next_retry}/{max_retries}) after error"),
                            "data": {"code": code, "error": truncate(&message, 500)},
                        }),
                    )
                    .with_card_id(card.id),
                )
                .await;
            return;
        }

        if let Err(err) = self.cards.update_card_status(card.id, CardStatus::Failed, None, None).await {
            tracing::warn!(job_id, card_id = card.id, %err, "failed to mark card failed");
        }
        if let Err(err) = self.cards.mark_dependent_cards_skipped(job_id, card_type).await {
            tracing::warn!(job_id, %err, "failed to cascade skip dependents");
        }
        let _ = self
            .events
            .append(
                AppendEvent::new(
                    job_id.to_string(),
                    EventType::CardFailed,
                    serde_json::json!({
                        "card": card_type,
                        "internal": internal,
                        "timing": {"duration_ms": started.elapsed().as_millis() as i64},
                        "error": {"code": code, "message": truncate(&message, 2000), "retryable": retryable},
                    }),
                )
                .with_card_id(card.id),
            )
            .await;
        if let Err(err) = self.cards.release_ready_cards(job_id).await {
            tracing::warn!(job_id, %err, "failed to release dependent cards after failure");
        }
    }

    // ---- finalization ----

    async fn update_job_state(&self, job_id: &str) {
        let counts = match self.cards.count_cards_by_status(job_id).await {
            Ok(counts) => counts,
            Err(err) => {
                tracing::warn!(job_id, %err, "failed to count card statuses");
                return;
            }
        };

        let pending = counts.get("pending").copied().unwrap_or(0)
            + counts.get("ready").copied().unwrap_or(0)
            + counts.get("running").copied().unwrap_or(0);
        if pending > 0 {
            return;
        }

        let failed = counts.get("failed").copied().unwrap_or(0) + counts.get("timeout").copied().unwrap_or(0);
        let completed = counts.get("completed").copied().unwrap_or(0);

        if failed > 0 && completed > 0 {
            if self.cards.try_finalize_job(job_id, JobStatus::Partial, None).await.unwrap_or(false) {
                let _ = self.events.append(AppendEvent::new(job_id.to_string(), EventType::JobCompleted, serde_json::json!({"status": "partial"}))).await;
            }
            return;
        }

        if failed > 0 && completed == 0 {
            if self.cards.try_finalize_job(job_id, JobStatus::Failed, None).await.unwrap_or(false) {
                let _ = self.events.append(AppendEvent::new(job_id.to_string(), EventType::JobCompleted, serde_json::json!({"status": "failed"}))).await;
                let _ = self.events.append(AppendEvent::new(job_id.to_string(), EventType::JobFailed, serde_json::json!({"status": "failed"}))).await;
            }
            return;
        }

        if self.cards.try_finalize_job(job_id, JobStatus::Completed, None).await.unwrap_or(false) {
            let _ = self.events.append(AppendEvent::new(job_id.to_string(), EventType::JobCompleted, serde_json::json!({"status": "completed"}))).await;
            self.spawn_final_result_cache_write(job_id.to_string());
        }
    }

    fn spawn_final_result_cache_write(&self, job_id: String) {
        let scheduler = self.arc();
        tokio::spawn(async move {
            let _permit = match scheduler.cache_write_semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            if let Err(err) = scheduler.maybe_save_final_result_cache(&job_id).await {
                tracing::error!(job_id = %job_id, %err, "final_result cache write failed");
            }
        });
    }

    /// Mirrors `_maybe_save_final_result_cache`: skips subject-less jobs,
    /// subset jobs (`options._requested_cards` non-empty), and anything not
    /// fully completed, then writes `{"cards": {type -> data}}` for every
    /// business card.
    async fn maybe_save_final_result_cache(&self, job_id: &str) -> anyhow::Result<()> {
        let job = self.cards.get_job(job_id).await?;
        let source = job.source.to_lowercase();
        let Some(subject_key) = job.subject_key.clone().filter(|k| !k.trim().is_empty()) else { return Ok(()) };
        if source.is_empty() {
            return Ok(());
        }

        if let Some(requested) = job.options.get("_requested_cards").and_then(Value::as_array) {
            if requested.iter().any(|c| c.as_str().map(|s| !s.trim().is_empty()).unwrap_or(false)) {
                return Ok(());
            }
        }

        let cards = self.cards.list_cards(job_id).await?;
        let mut by_card = serde_json::Map::new();
        for card in &cards {
            if dinq_gate::is_internal_card(&card.card_type) {
                continue;
            }
            if card.status != CardStatus::Completed.as_str() {
                return Ok(());
            }
            let (data, _stream) = dinq_gate::envelope::extract_output_parts(&card.output);
            if data.is_null() {
                return Ok(());
            }
            by_card.insert(card.card_type.clone(), data);
        }
        if by_card.is_empty() {
            return Ok(());
        }

        // The full_report handler's declared version stands in for the
        // pipeline version the original derives from its own handler table.
        let pipeline_version = self.handlers.resolve(&source, "full_report").map(|h| h.version().to_string()).unwrap_or_else(|| "v1".to_string());

        let ttl_seconds = self.cache.ttl_seconds_for(&source);
        let payload = serde_json::json!({"cards": Value::Object(by_card)});
        let subject_id = self.cache.get_or_create_subject(&source, &subject_key).await?;
        let options_hash = dinq_cache::keys::options_hash(&job.options);
        self.cache
            .save_final_result(subject_id, &source, &subject_key, &pipeline_version, &options_hash, &payload, ttl_seconds)
            .await?;
        Ok(())
    }
}

/// Adapter so `handle_card_success` can take either a `CardResult` from
/// `crate::handler` or the gate's own normalized `Value` without pulling
/// `dinq_gate`'s types into the handler module's public surface.
type CardResultLike = crate::handler::CardResult;

/// Pure form of [`Scheduler::cap_for_persistence`], split out so the
/// size-capping policy is unit-testable without a database pool.
fn cap_output_for_persistence(data: Value, persist_to_db: bool, persist_max_bytes: usize) -> Value {
    if !persist_to_db {
        return serde_json::json!({"_meta": {"not_persisted": true}});
    }
    if persist_max_bytes > 0 {
        let size = serde_json::to_vec(&data).map(|b| b.len()).unwrap_or(0);
        if size > persist_max_bytes {
            return serde_json::json!({"_meta": {"truncated": true, "original_bytes": size}});
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use dinq_cards::CardStatus as CS;

    fn base_card(card_type: &str, concurrency_group: Option<&str>) -> Card {
        Card {
            id: 1,
            job_id: "job-1".to_string(),
            card_type: card_type.to_string(),
            priority: 0,
            status: CS::Ready.as_str().to_string(),
            deadline_ms: None,
            concurrency_group: concurrency_group.map(str::to_string),
            input: serde_json::json!({}),
            deps: None,
            output: serde_json::json!({"data": null, "stream": {}}),
            retry_count: 0,
            started_at: None,
            ended_at: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    // `card_group` only touches pure data (no I/O), so it's exercised directly
    // against a bare struct rather than a constructed `Scheduler`.
    fn card_group_for(card: &Card) -> String {
        if let Some(group) = &card.concurrency_group {
            let group = group.trim().to_lowercase();
            if !group.is_empty() {
                return group;
            }
        }
        match dinq_gate::category_for(&card.card_type) {
            CardCategory::Resource => "resource".to_string(),
            CardCategory::Ai => "llm".to_string(),
            CardCategory::Base => "default".to_string(),
        }
    }

    #[test]
    fn explicit_concurrency_group_wins() {
        let card = base_card("profile", Some("crawlbase"));
        assert_eq!(card_group_for(&card), "crawlbase");
    }

    #[test]
    fn resource_cards_land_in_resource_group() {
        let card = base_card("resource.github_profile", None);
        assert_eq!(card_group_for(&card), "resource");
    }

    #[test]
    fn ai_cards_land_in_llm_group() {
        let card = base_card("roast", None);
        assert_eq!(card_group_for(&card), "llm");
    }

    #[test]
    fn other_cards_land_in_default_group() {
        let card = base_card("profile", None);
        assert_eq!(card_group_for(&card), "default");
    }

    #[test]
    fn truncate_respects_char_count() {
        assert_eq!(truncate("hello world", 5), "hello");
        assert_eq!(truncate("hi", 5), "hi");
    }

    #[test]
    fn persistence_disabled_replaces_payload() {
        let out = cap_output_for_persistence(serde_json::json!({"name": "ada"}), false, 0);
        assert_eq!(out, serde_json::json!({"_meta": {"not_persisted": true}}));
    }

    #[test]
    fn oversized_payload_is_replaced_with_marker() {
        let data = serde_json::json!({"blob": "x".repeat(100)});
        let out = cap_output_for_persistence(data, true, 10);
        assert_eq!(out["_meta"]["truncated"], true);
        assert!(out["_meta"]["original_bytes"].as_u64().unwrap() > 10);
    }

    #[test]
    fn small_payload_passes_through_unchanged() {
        let data = serde_json::json!({"name": "ada"});
        let out = cap_output_for_persistence(data.clone(), true, 1_048_576);
        assert_eq!(out, data);
    }

    #[test]
    fn zero_max_bytes_means_unbounded() {
        let data = serde_json::json!({"blob": "x".repeat(10_000)});
        let out = cap_output_for_persistence(data.clone(), true, 0);
        assert_eq!(out, data);
    }
}
