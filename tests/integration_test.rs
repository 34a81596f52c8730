use chrono::{Duration as ChronoDuration, Utc};
use upload_scheduler::{
    config::AppConfig,
    db::{self, JobStore, PgJobStore, StoreError},
    models::job::{FailureKind, Job, JobPatch, JobPayload, JobStatus},
    services::dispatcher::recover_orphans,
};

/// Integration test: job store against PostgreSQL
///
/// Covers:
/// 1. Database connection and schema migrations
/// 2. Insert / get round trip including payload and tags
/// 3. Due-job listing
/// 4. Compare-and-transition success, conflict and illegal edges
/// 5. Status history
///
/// Note: This requires a running PostgreSQL instance configured via
/// DATABASE_URL. Run with: cargo test --test integration_test -- --ignored
#[tokio::test]
#[ignore]
async fn test_pg_job_store_lifecycle() {
    let config = AppConfig::from_env().expect("Failed to load config");

    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run migrations");

    let store = PgJobStore::new(db_pool.clone());
    store.ping().await.expect("Ping failed");

    // 1. Insert and read back
    let job = Job::new(
        "Integration upload".to_string(),
        "Created by the integration test".to_string(),
        vec!["automated".to_string(), "integration".to_string()],
        Utc::now() - ChronoDuration::seconds(5),
        JobPayload::from_file("/tmp/integration.mp4"),
    );
    let id = store.insert(job.clone()).await.expect("Insert failed");
    assert!(matches!(
        store.insert(job.clone()).await,
        Err(StoreError::Duplicate(_))
    ));

    let stored = store.get(id).await.expect("Get failed");
    assert_eq!(stored.status, JobStatus::Pending);
    assert_eq!(stored.tags, job.tags);
    assert_eq!(stored.payload, job.payload);
    assert_eq!(stored.attempt_count, 0);

    // 2. Due listing
    let due = store
        .list_due(Utc::now(), &[JobStatus::Pending], 10_000)
        .await
        .expect("list_due failed");
    assert!(due.iter().any(|j| j.id == id));

    // 3. Compare-and-transition
    store
        .compare_and_transition(id, JobStatus::Pending, JobStatus::Queued, JobPatch::default())
        .await
        .expect("Promotion failed");

    let conflict = store
        .compare_and_transition(id, JobStatus::Pending, JobStatus::Queued, JobPatch::default())
        .await;
    assert!(matches!(
        conflict,
        Err(StoreError::Conflict {
            actual: JobStatus::Queued,
            ..
        })
    ));

    let illegal = store
        .compare_and_transition(id, JobStatus::Queued, JobStatus::Completed, JobPatch::default())
        .await;
    assert!(matches!(illegal, Err(StoreError::IllegalTransition { .. })));

    let missing = store
        .compare_and_transition(
            uuid::Uuid::new_v4(),
            JobStatus::Pending,
            JobStatus::Queued,
            JobPatch::default(),
        )
        .await;
    assert!(matches!(missing, Err(StoreError::NotFound(_))));

    store
        .compare_and_transition(id, JobStatus::Queued, JobStatus::Processing, JobPatch::default())
        .await
        .expect("Claim failed");
    store
        .compare_and_transition(id, JobStatus::Processing, JobStatus::Uploading, JobPatch::default())
        .await
        .expect("Upload transition failed");

    let retried = store
        .compare_and_transition(
            id,
            JobStatus::Uploading,
            JobStatus::Uploading,
            JobPatch::failure(FailureKind::Transient, "503").with_attempts(1),
        )
        .await
        .expect("Patch-only transition failed");
    assert_eq!(retried.attempt_count, 1);
    assert_eq!(retried.last_error.as_deref(), Some("[Transient] 503"));

    let done = store
        .compare_and_transition(
            id,
            JobStatus::Uploading,
            JobStatus::Completed,
            JobPatch {
                last_error: Some(None),
                external_id: Some("abc123".to_string()),
                ..JobPatch::default()
            },
        )
        .await
        .expect("Completion failed");
    assert_eq!(done.status, JobStatus::Completed);
    assert!(done.last_error.is_none());
    assert_eq!(done.external_id.as_deref(), Some("abc123"));

    // 4. History skips the patch-only update
    let history: Vec<_> = store
        .history(id)
        .await
        .expect("History failed")
        .into_iter()
        .map(|t| t.to_status)
        .collect();
    assert_eq!(
        history,
        vec![
            JobStatus::Pending,
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Uploading,
            JobStatus::Completed,
        ]
    );

    let counts = store.count_by_status().await.expect("Count failed");
    assert!(counts
        .iter()
        .any(|(status, n)| *status == JobStatus::Completed && *n >= 1));

    // Cleanup
    sqlx::query("DELETE FROM scheduled_jobs WHERE id = $1")
        .bind(id)
        .execute(&db_pool)
        .await
        .expect("Cleanup failed");

    println!("✓ PostgreSQL job store lifecycle passed");
}

#[tokio::test]
#[ignore]
async fn test_pg_orphan_recovery() {
    let config = AppConfig::from_env().expect("Failed to load config");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run migrations");
    let store = PgJobStore::new(db_pool.clone());

    let job = Job::new(
        "Orphaned upload".to_string(),
        String::new(),
        vec![],
        Utc::now(),
        JobPayload::from_file("/tmp/orphan.mp4"),
    );
    let id = store.insert(job).await.expect("Insert failed");
    store
        .compare_and_transition(id, JobStatus::Pending, JobStatus::Queued, JobPatch::default())
        .await
        .expect("Promotion failed");

    let recovered = recover_orphans(&store).await.expect("Recovery failed");
    assert!(recovered >= 1);

    let job = store.get(id).await.expect("Get failed");
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.last_error.unwrap().starts_with("[Transient]"));

    sqlx::query("DELETE FROM scheduled_jobs WHERE id = $1")
        .bind(id)
        .execute(&db_pool)
        .await
        .expect("Cleanup failed");
}
