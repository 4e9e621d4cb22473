//! Integration tests for `AnalysisCacheStore`.
//! Requires a Postgres instance. Set DATABASE_TEST_URL or these tests are skipped.

use dinq_cache::AnalysisCacheStore;
use dinq_core::config::CacheConfig;
use sqlx::PgPool;
use std::collections::HashMap;

async fn test_pool() -> Option<PgPool> {
    let url = std::env::var("DATABASE_TEST_URL").ok()?;
    let pool = PgPool::connect(&url).await.ok()?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cache_subjects (
            id BIGSERIAL PRIMARY KEY,
            source TEXT NOT NULL,
            subject_key TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            UNIQUE (source, subject_key)
        )
        "#,
    )
    .execute(&pool)
    .await
    .ok()?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cache_refresh_runs (
            id BIGSERIAL PRIMARY KEY,
            subject_id BIGINT NOT NULL,
            pipeline_version TEXT NOT NULL,
            options_hash TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            ended_at TIMESTAMPTZ,
            artifact_key TEXT,
            freshness_until TIMESTAMPTZ,
            fail_reason TEXT
        )
        "#,
    )
    .execute(&pool)
    .await
    .ok()?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS ux_cache_refresh_runs_running
        ON cache_refresh_runs (subject_id, pipeline_version, options_hash)
        WHERE status = 'running'
        "#,
    )
    .execute(&pool)
    .await
    .ok()?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS analysis_artifact_cache (
            artifact_key TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            payload JSONB NOT NULL,
            content_hash TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            expires_at TIMESTAMPTZ,
            meta JSONB NOT NULL DEFAULT '{}'::jsonb
        )
        "#,
    )
    .execute(&pool)
    .await
    .ok()?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS analysis_backup_outbox (
            id BIGSERIAL PRIMARY KEY,
            artifact_key TEXT NOT NULL,
            kind TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INT NOT NULL DEFAULT 0,
            next_retry_at TIMESTAMPTZ,
            last_error TEXT,
            lock_token TEXT,
            locked_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            UNIQUE (artifact_key, content_hash)
        )
        "#,
    )
    .execute(&pool)
    .await
    .ok()?;

    sqlx::query("TRUNCATE cache_subjects, cache_refresh_runs, analysis_artifact_cache, analysis_backup_outbox CASCADE")
        .execute(&pool)
        .await
        .ok()?;

    Some(pool)
}

fn test_config() -> CacheConfig {
    CacheConfig {
        default_ttl_seconds: 3600,
        ttl_seconds_by_source: HashMap::new(),
        backup_ttl_multiplier: 4,
        backup_max_ttl_seconds: 31_536_000,
        refresh_lock_ttl_seconds: 60,
        evictor_enabled: true,
        evictor_interval_seconds: 300,
        evictor_stale_grace_seconds: 3600,
        evictor_batch_size: 500,
        evictor_max_bytes_override: None,
        access_touch_throttle_seconds: 15,
    }
}

#[tokio::test]
async fn subject_lookup_is_idempotent() {
    let Some(pool) = test_pool().await else { return };
    let store = AnalysisCacheStore::new(pool.clone(), None, None, test_config());

    let id1 = store.get_or_create_subject("github", "octocat").await.unwrap();
    let id2 = store.get_or_create_subject("github", "octocat").await.unwrap();
    assert_eq!(id1, id2);
}

#[tokio::test]
async fn refresh_run_is_single_flight() {
    let Some(pool) = test_pool().await else { return };
    let store = AnalysisCacheStore::new(pool.clone(), None, None, test_config());

    let subject_id = store.get_or_create_subject("github", "octocat").await.unwrap();

    let first = store.try_begin_refresh_run(subject_id, "v1", "opt-hash").await.unwrap();
    let second = store.try_begin_refresh_run(subject_id, "v1", "opt-hash").await.unwrap();
    assert!(first);
    assert!(!second);
}

#[tokio::test]
async fn save_then_read_final_result_round_trips() {
    let Some(pool) = test_pool().await else { return };
    let store = AnalysisCacheStore::new(pool.clone(), None, None, test_config());

    let payload = serde_json::json!({"cards": {"profile": {"name": "ada"}}});
    let subject_id = store.get_or_create_subject("github", "octocat").await.unwrap();
    store
        .save_final_result(subject_id, "github", "octocat", "v1", &dinq_cache::keys::options_hash(&serde_json::json!({})), &payload, 3600)
        .await
        .unwrap();

    let read = store
        .get_cached_final_result("github", "octocat", "v1", &serde_json::json!({}))
        .await
        .unwrap()
        .expect("final result should be cached");

    assert_eq!(read.payload, payload);
    assert!(!read.stale);
}

#[tokio::test]
async fn final_result_with_empty_cards_is_not_returned() {
    let Some(pool) = test_pool().await else { return };
    let store = AnalysisCacheStore::new(pool.clone(), None, None, test_config());

    let payload = serde_json::json!({"cards": {}});
    let subject_id = store.get_or_create_subject("scholar", "ada").await.unwrap();
    store
        .save_final_result(subject_id, "scholar", "ada", "v1", &dinq_cache::keys::options_hash(&serde_json::json!({})), &payload, 3600)
        .await
        .unwrap();

    let read = store.get_cached_final_result("scholar", "ada", "v1", &serde_json::json!({})).await.unwrap();
    assert!(read.is_none());
}

#[tokio::test]
async fn save_cached_artifact_skips_rewrite_on_unchanged_content_hash() {
    let Some(pool) = test_pool().await else { return };
    let store = AnalysisCacheStore::new(pool.clone(), None, None, test_config());

    let payload = serde_json::json!({"a": 1});
    let saved1 = store.save_cached_artifact("resource.repos", "key-1", &payload, 3600).await.unwrap();
    let saved2 = store.save_cached_artifact("resource.repos", "key-1", &payload, 3600).await.unwrap();

    assert_eq!(saved1.content_hash, saved2.content_hash);
}

#[tokio::test]
async fn get_cached_artifact_deletes_expired_row() {
    let Some(pool) = test_pool().await else { return };
    let store = AnalysisCacheStore::new(pool.clone(), None, None, test_config());

    store.save_cached_artifact("resource.repos", "key-expired", &serde_json::json!({"a": 1}), -10).await.unwrap();

    let read = store.get_cached_artifact("key-expired").await.unwrap();
    assert!(read.is_none());

    let row = sqlx::query("SELECT 1 FROM analysis_artifact_cache WHERE artifact_key = $1")
        .bind("key-expired")
        .fetch_optional(&pool)
        .await
        .unwrap();
    assert!(row.is_none());
}
