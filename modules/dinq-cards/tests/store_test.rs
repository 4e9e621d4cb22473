//! Integration tests for `JobCardStore`.
//! Requires a Postgres instance. Set DATABASE_TEST_URL or these tests are skipped.

use dinq_cards::{CardPlanEntry, CardStatus, JobCardStore, JobCreateRequest, JobStatus};
use sqlx::PgPool;

async fn test_pool() -> Option<PgPool> {
    let url = std::env::var("DATABASE_TEST_URL").ok()?;
    let pool = PgPool::connect(&url).await.ok()?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY DEFAULT gen_random_uuid()::text,
            user_id TEXT NOT NULL,
            source TEXT NOT NULL,
            status TEXT NOT NULL,
            last_seq BIGINT NOT NULL DEFAULT 0,
            input JSONB NOT NULL,
            options JSONB NOT NULL,
            result JSONB,
            subject_key TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(&pool)
    .await
    .ok()?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cards (
            id BIGSERIAL PRIMARY KEY,
            job_id TEXT NOT NULL,
            card_type TEXT NOT NULL,
            priority INT NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            deadline_ms BIGINT,
            concurrency_group TEXT,
            input JSONB NOT NULL,
            deps TEXT[],
            output JSONB NOT NULL,
            retry_count INT NOT NULL DEFAULT 0,
            started_at TIMESTAMPTZ,
            ended_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(&pool)
    .await
    .ok()?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_events (
            id BIGSERIAL PRIMARY KEY,
            job_id TEXT NOT NULL,
            card_id BIGINT,
            seq BIGINT NOT NULL,
            event_type TEXT NOT NULL,
            payload JSONB NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            UNIQUE (job_id, seq)
        )
        "#,
    )
    .execute(&pool)
    .await
    .ok()?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS idempotency_mappings (
            user_id TEXT NOT NULL,
            idempotency_key TEXT NOT NULL,
            request_hash TEXT NOT NULL,
            job_id TEXT NOT NULL,
            PRIMARY KEY (user_id, idempotency_key)
        )
        "#,
    )
    .execute(&pool)
    .await
    .ok()?;

    sqlx::query("TRUNCATE jobs, cards, job_events, idempotency_mappings CASCADE")
        .execute(&pool)
        .await
        .ok()?;

    Some(pool)
}

fn plan() -> Vec<CardPlanEntry> {
    vec![
        CardPlanEntry {
            card_type: "full_report".into(),
            priority: 10,
            deadline_ms: None,
            concurrency_group: None,
            input: serde_json::json!({}),
            depends_on: Some(vec![]),
        },
        CardPlanEntry {
            card_type: "roast".into(),
            priority: 5,
            deadline_ms: None,
            concurrency_group: Some("llm".into()),
            input: serde_json::json!({}),
            depends_on: None,
        },
        CardPlanEntry {
            card_type: "repos".into(),
            priority: 5,
            deadline_ms: None,
            concurrency_group: Some("github_api".into()),
            input: serde_json::json!({}),
            depends_on: None,
        },
    ]
}

#[tokio::test]
async fn bundle_creation_seeds_pending_cards_and_started_event() {
    let Some(pool) = test_pool().await else { return };
    let store = JobCardStore::new(pool.clone());

    let job = store
        .create_job_bundle(JobCreateRequest {
            user_id: "u1".into(),
            source: "github".into(),
            input: serde_json::json!({"handle": "octocat"}),
            options: serde_json::json!({}),
            plan: plan(),
            subject_key: Some("octocat".into()),
            idempotency_key: None,
            request_hash: None,
        })
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Queued.as_str());
    assert_eq!(job.last_seq, 1);

    let counts = store.count_cards_by_status(&job.id).await.unwrap();
    assert_eq!(counts.get("pending"), Some(&3));
}

#[tokio::test]
async fn idempotent_create_returns_existing_job_on_matching_hash() {
    let Some(pool) = test_pool().await else { return };
    let store = JobCardStore::new(pool.clone());

    let req = |idem: Option<&str>| JobCreateRequest {
        user_id: "u2".into(),
        source: "scholar".into(),
        input: serde_json::json!({}),
        options: serde_json::json!({}),
        plan: plan(),
        subject_key: Some("ada".into()),
        idempotency_key: idem.map(|s| s.to_string()),
        request_hash: idem.map(|_| "hash-1".to_string()),
    };

    let job1 = store.create_job_bundle(req(Some("key-1"))).await.unwrap();
    let job2 = store.create_job_bundle(req(Some("key-1"))).await.unwrap();
    assert_eq!(job1.id, job2.id);
}

#[tokio::test]
async fn release_ready_cards_honors_legacy_full_report_dependency() {
    let Some(pool) = test_pool().await else { return };
    let store = JobCardStore::new(pool.clone());

    let job = store
        .create_job_bundle(JobCreateRequest {
            user_id: "u3".into(),
            source: "github".into(),
            input: serde_json::json!({}),
            options: serde_json::json!({}),
            plan: plan(),
            subject_key: None,
            idempotency_key: None,
            request_hash: None,
        })
        .await
        .unwrap();

    // full_report has explicit empty deps: it should become ready immediately.
    let released = store.release_ready_cards(&job.id).await.unwrap();
    assert_eq!(released, 1);

    let counts = store.count_cards_by_status(&job.id).await.unwrap();
    assert_eq!(counts.get("ready"), Some(&1));
    assert_eq!(counts.get("pending"), Some(&2));
}

#[tokio::test]
async fn skip_cascade_marks_transitive_dependents() {
    let Some(pool) = test_pool().await else { return };
    let store = JobCardStore::new(pool.clone());

    let job = store
        .create_job_bundle(JobCreateRequest {
            user_id: "u4".into(),
            source: "github".into(),
            input: serde_json::json!({}),
            options: serde_json::json!({}),
            plan: plan(),
            subject_key: None,
            idempotency_key: None,
            request_hash: None,
        })
        .await
        .unwrap();

    let skipped = store.mark_dependent_cards_skipped(&job.id, "full_report").await.unwrap();
    // roast and repos both implicitly depend on full_report.
    assert_eq!(skipped, 2);

    let counts = store.count_cards_by_status(&job.id).await.unwrap();
    assert_eq!(counts.get("skipped"), Some(&2));
}

#[tokio::test]
async fn finalize_is_idempotent() {
    let Some(pool) = test_pool().await else { return };
    let store = JobCardStore::new(pool.clone());

    let job = store
        .create_job_bundle(JobCreateRequest {
            user_id: "u5".into(),
            source: "github".into(),
            input: serde_json::json!({}),
            options: serde_json::json!({}),
            plan: plan(),
            subject_key: None,
            idempotency_key: None,
            request_hash: None,
        })
        .await
        .unwrap();

    let first = store
        .try_finalize_job(&job.id, JobStatus::Completed, Some(serde_json::json!({"cards": {}})))
        .await
        .unwrap();
    let second = store
        .try_finalize_job(&job.id, JobStatus::Completed, Some(serde_json::json!({"cards": {}})))
        .await
        .unwrap();

    assert!(first);
    assert!(!second);
}

#[tokio::test]
async fn claim_ready_cards_transitions_to_running() {
    let Some(pool) = test_pool().await else { return };
    let store = JobCardStore::new(pool.clone());

    let job = store
        .create_job_bundle(JobCreateRequest {
            user_id: "u6".into(),
            source: "github".into(),
            input: serde_json::json!({}),
            options: serde_json::json!({}),
            plan: plan(),
            subject_key: None,
            idempotency_key: None,
            request_hash: None,
        })
        .await
        .unwrap();

    store.release_ready_cards(&job.id).await.unwrap();
    let claimed = store.claim_ready_cards(10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].status, CardStatus::Running.as_str());

    let confirmed = store.confirm_card_claim(claimed[0].id, claimed[0].started_at.unwrap()).await.unwrap();
    assert!(confirmed);
}
