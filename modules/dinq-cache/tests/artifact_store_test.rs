//! Integration tests for `ArtifactStore`.
//! Requires a Postgres instance. Set DATABASE_TEST_URL or these tests are skipped.

use dinq_cache::ArtifactStore;
use dinq_core::config::ArtifactStoreConfig;
use sqlx::PgPool;
use std::collections::HashSet;

async fn test_pool() -> Option<PgPool> {
    let url = std::env::var("DATABASE_TEST_URL").ok()?;
    let pool = PgPool::connect(&url).await.ok()?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS analysis_artifacts (
            id BIGSERIAL PRIMARY KEY,
            job_id TEXT NOT NULL,
            card_id BIGINT,
            type TEXT NOT NULL,
            payload JSONB NOT NULL,
            file_url TEXT
        )
        "#,
    )
    .execute(&pool)
    .await
    .ok()?;

    sqlx::query("TRUNCATE analysis_artifacts CASCADE").execute(&pool).await.ok()?;
    Some(pool)
}

fn config(disk_dir: std::path::PathBuf, skip_db_types: HashSet<String>) -> ArtifactStoreConfig {
    ArtifactStoreConfig {
        disk_dir,
        disk_ttl_seconds: 86_400,
        disk_max_bytes: 52_428_800,
        compress: true,
        skip_db_types,
        skip_db_prefixes: vec![],
    }
}

#[tokio::test]
async fn round_trips_through_disk_and_db() {
    let Some(pool) = test_pool().await else { return };
    let dir = tempfile::tempdir().unwrap();
    let store = ArtifactStore::new(pool.clone(), config(dir.path().to_path_buf(), HashSet::new()));

    let payload = serde_json::json!({"repos": ["a", "b"]});
    store.save_artifact("job-1", Some(7), "resource.repos", &payload, None).await.unwrap();

    let read = store.get_artifact("job-1", "resource.repos").await.unwrap().expect("artifact present");
    assert_eq!(read.payload, payload);
    assert_eq!(read.card_id, Some(7));

    let row = sqlx::query("SELECT 1 FROM analysis_artifacts WHERE job_id = $1")
        .bind("job-1")
        .fetch_optional(&pool)
        .await
        .unwrap();
    assert!(row.is_some(), "DB write should happen when the type isn't in skip_db_types");
}

#[tokio::test]
async fn skip_db_types_avoid_db_write() {
    let Some(pool) = test_pool().await else { return };
    let dir = tempfile::tempdir().unwrap();
    let mut skip = HashSet::new();
    skip.insert("resource.repos".to_string());
    let store = ArtifactStore::new(pool.clone(), config(dir.path().to_path_buf(), skip));

    let payload = serde_json::json!({"repos": ["a"]});
    store.save_artifact("job-2", None, "resource.repos", &payload, None).await.unwrap();

    let row = sqlx::query("SELECT 1 FROM analysis_artifacts WHERE job_id = $1")
        .bind("job-2")
        .fetch_optional(&pool)
        .await
        .unwrap();
    assert!(row.is_none(), "skip-db type should never hit the relational table");

    let read = store.get_artifact("job-2", "resource.repos").await.unwrap().expect("artifact present on disk");
    assert_eq!(read.payload, payload);
}
