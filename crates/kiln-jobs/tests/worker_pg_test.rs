//! Worker integration tests against PostgreSQL.
//!
//! This test suite validates:
//! - The daemon picks up an enqueued job and attaches its artifact
//! - Two workers draining one queue never process a job twice
//!
//! Run with `cargo test -p kiln-jobs -- --ignored` against `DATABASE_URL`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use kiln_db::test_fixtures::TestDatabase;
use kiln_db::PgJobStore;
use kiln_jobs::mock::{MockHttpFetcher, MockToolRunner};
use kiln_jobs::processors::standard_processors;
use kiln_jobs::{
    JobKind, JobOptions, JobStatus, JobStore, JobWorker, KilnConfig, NewJob, RecordAttacher,
    WorkerBuilder, WorkerConfig,
};
use tokio::time::sleep;
use uuid::Uuid;

fn build_worker(db: &TestDatabase, root: &Path, runner: &MockToolRunner) -> JobWorker {
    let config = Arc::new(KilnConfig::default().with_root(root));
    let host = Arc::new(db.host.clone());
    WorkerBuilder::new(Arc::new(db.jobs.clone()))
        .with_config(
            WorkerConfig::default()
                .with_poll_interval(100)
                .with_throttle(0),
        )
        .with_processors(standard_processors(
            config.clone(),
            Arc::new(runner.clone()),
            host.clone(),
            Arc::new(MockHttpFetcher::new()),
        ))
        .with_attacher(RecordAttacher::new(config, host, Arc::new(runner.clone())))
        .with_notify(db.jobs.job_notify())
        .build()
}

fn merge_job(root: &Path, name: &str) -> NewJob {
    let input = root.join(format!("{name}.tif"));
    std::fs::write(&input, b"II*\0scan").expect("write input");
    NewJob::new(JobKind::PdfMerge, name)
        .with_source(input.to_string_lossy())
        .with_options(JobOptions {
            pdf_standard: "pdf".into(),
            ..JobOptions::default()
        })
}

/// Wait for a job to reach a specific status.
async fn wait_for_job_status(
    jobs: &PgJobStore,
    job_id: Uuid,
    expected: JobStatus,
    timeout_secs: u64,
) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed().as_secs() < timeout_secs {
        if let Ok(Some(job)) = jobs.get(job_id).await {
            if job.status == expected {
                return true;
            }
        }
        sleep(Duration::from_millis(100)).await;
    }
    false
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL pointing at a PostgreSQL instance
async fn test_daemon_processes_and_attaches() {
    dotenvy::dotenv().ok();
    let db = TestDatabase::new().await;
    let dir = tempfile::tempdir().expect("tempdir");
    db.add_record(1921, Some("council-minutes")).await;

    let runner = MockToolRunner::new();
    let handle = build_worker(&db, dir.path(), &runner).start();

    let id = db
        .jobs
        .enqueue(merge_job(dir.path(), "minutes").with_record(1921))
        .await
        .expect("enqueue");

    assert!(
        wait_for_job_status(&db.jobs, id, JobStatus::Completed, 10).await,
        "job should complete"
    );
    handle.shutdown_and_wait().await.expect("shutdown");

    let job = db.jobs.get(id).await.expect("get").expect("job");
    assert_eq!(job.processed_items, 1);
    assert!(job.output_object_id.is_some());
    assert!(dir
        .path()
        .join("uploads/r/council-minutes/minutes.pdf")
        .exists());

    let objects: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM digital_object")
        .fetch_one(&db.pool)
        .await
        .expect("count");
    assert_eq!(objects, 3, "master plus two derivatives");

    db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL pointing at a PostgreSQL instance
async fn test_two_workers_never_share_a_job() {
    dotenvy::dotenv().ok();
    let db = TestDatabase::new().await;
    let dir = tempfile::tempdir().expect("tempdir");

    let mut ids = Vec::new();
    for i in 0..6 {
        ids.push(
            db.jobs
                .enqueue(merge_job(dir.path(), &format!("batch_{i}")))
                .await
                .expect("enqueue"),
        );
    }

    let runner_a = MockToolRunner::new();
    let runner_b = MockToolRunner::new();
    let worker_a = build_worker(&db, dir.path(), &runner_a);
    let worker_b = build_worker(&db, dir.path(), &runner_b);

    let (a, b) = tokio::join!(worker_a.run_batch(None, None), worker_b.run_batch(None, None));
    let (a, b) = (a.expect("batch a"), b.expect("batch b"));

    assert_eq!(a.runs.len() + b.runs.len(), 6);
    assert!(a.is_clean() && b.is_clean());
    assert_eq!(
        runner_a.call_count_for("convert") + runner_b.call_count_for("convert"),
        6
    );
    for id in ids {
        let job = db.jobs.get(id).await.expect("get").expect("job");
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 1);
    }

    db.cleanup().await;
}
