//! PostgreSQL job store integration tests.
//!
//! Run with `cargo test -p kiln-db -- --ignored` against `DATABASE_URL`.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Duration;
use kiln_db::test_fixtures::TestDatabase;
use kiln_db::{
    HostRecordStore, ItemStatus, JobKind, JobOutput, JobStatus, JobStore, NewDigitalObject,
    NewJob, StaleRecovery, UsageKind,
};

fn merge_job(sources: &[&str]) -> NewJob {
    NewJob::new(JobKind::PdfMerge, "Minute book").with_sources(sources.iter().copied())
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL pointing at a PostgreSQL instance
async fn test_enqueue_persists_items_in_ordinal_order() {
    dotenvy::dotenv().ok();
    let db = TestDatabase::new().await;

    let id = db
        .jobs
        .enqueue(merge_job(&["/scans/c.tif", "/scans/a.tif", "/scans/b.tif"]))
        .await
        .expect("enqueue");

    let job = db.jobs.get(id).await.expect("get").expect("job exists");
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.total_items, 3);
    assert_eq!(job.attempts, 0);

    let items = db.jobs.items(id).await.expect("items");
    let sources: Vec<_> = items.iter().map(|i| i.source.as_str()).collect();
    assert_eq!(sources, vec!["/scans/c.tif", "/scans/a.tif", "/scans/b.tif"]);
    assert_eq!(
        items.iter().map(|i| i.ordinal).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );

    db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL pointing at a PostgreSQL instance
async fn test_concurrent_claims_never_share_a_job() {
    dotenvy::dotenv().ok();
    let db = TestDatabase::new().await;
    for _ in 0..5 {
        db.jobs.enqueue(merge_job(&["/scans/p.tif"])).await.unwrap();
    }

    let store = Arc::new(kiln_db::PgJobStore::new(db.pool.clone()));
    let mut handles = Vec::new();
    for _ in 0..10 {
        let store = store.clone();
        handles.push(tokio::spawn(async move { store.claim_next().await }));
    }

    let mut claimed = Vec::new();
    for handle in handles {
        if let Some(job) = handle.await.unwrap().unwrap() {
            claimed.push(job.id);
        }
    }
    claimed.sort();
    let before = claimed.len();
    claimed.dedup();
    assert_eq!(before, 5);
    assert_eq!(claimed.len(), 5);

    db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL pointing at a PostgreSQL instance
async fn test_release_exhausts_attempts_into_failed() {
    dotenvy::dotenv().ok();
    let db = TestDatabase::new().await;
    let id = db.jobs.enqueue(merge_job(&["/scans/p.tif"])).await.unwrap();

    for attempt in 1..=3 {
        let job = db.jobs.claim_next().await.unwrap().expect("claimable");
        assert_eq!(job.attempts, attempt);
        let status = db.jobs.release(id, "convert exited 1").await.unwrap();
        let expected = if attempt < 3 {
            JobStatus::Queued
        } else {
            JobStatus::Failed
        };
        assert_eq!(status, expected);
    }

    assert!(db.jobs.claim_next().await.unwrap().is_none());
    let job = db.jobs.get(id).await.unwrap().unwrap();
    assert_eq!(job.attempts, job.max_attempts);
    assert_eq!(job.error_message.as_deref(), Some("convert exited 1"));

    db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL pointing at a PostgreSQL instance
async fn test_complete_requeue_and_cleanup() {
    dotenvy::dotenv().ok();
    let db = TestDatabase::new().await;
    let id = db.jobs.enqueue(merge_job(&["/scans/p.tif"])).await.unwrap();

    let job = db.jobs.claim(id).await.unwrap().expect("claimed");
    assert_eq!(job.status, JobStatus::Processing);
    assert!(db.jobs.claim(id).await.unwrap().is_none());

    let item = db.jobs.items(id).await.unwrap().remove(0);
    db.jobs
        .update_item(item.id, ItemStatus::Processed, None)
        .await
        .unwrap();
    db.jobs
        .mark_completed(
            id,
            &JobOutput {
                output_ref: PathBuf::from("/tmp/kiln/job/minute_book.pdf"),
                processed_items: 1,
            },
        )
        .await
        .unwrap();
    db.jobs.append_log(id, "Merged 1 page").await.unwrap();
    db.jobs.append_log(id, "Attached").await.unwrap();

    let job = db.jobs.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.processed_items, 1);
    assert_eq!(job.notes.as_deref(), Some("Merged 1 page\nAttached"));

    let stats = db.jobs.queue_stats().await.unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.total_items, 1);

    // Recent terminal jobs survive cleanup.
    assert_eq!(db.jobs.cleanup(Duration::hours(24)).await.unwrap(), 0);

    assert!(db.jobs.requeue(id).await.unwrap());
    let job = db.jobs.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempts, 0);
    assert!(job.output_ref.is_none());

    db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL pointing at a PostgreSQL instance
async fn test_requeue_stale_recovers_abandoned_claims() {
    dotenvy::dotenv().ok();
    let db = TestDatabase::new().await;
    let retry = db.jobs.enqueue(merge_job(&["/scans/a.tif"])).await.unwrap();
    let spent = db
        .jobs
        .enqueue(merge_job(&["/scans/b.tif"]).with_max_attempts(1))
        .await
        .unwrap();
    db.jobs.claim(retry).await.unwrap().expect("claimed");
    db.jobs.claim(spent).await.unwrap().expect("claimed");

    // Fresh claims are left alone.
    let none = db
        .jobs
        .requeue_stale(Duration::hours(1), "worker gone")
        .await
        .unwrap();
    assert_eq!(none.total(), 0);

    sqlx::query("UPDATE job_queue SET updated_at = NOW() - INTERVAL '2 hours'")
        .execute(&db.pool)
        .await
        .unwrap();
    let recovery = db
        .jobs
        .requeue_stale(Duration::hours(1), "worker gone")
        .await
        .unwrap();
    assert_eq!(
        recovery,
        StaleRecovery {
            requeued: 1,
            failed: 1
        }
    );

    let job = db.jobs.get(retry).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.error_message.as_deref(), Some("worker gone"));
    let job = db.jobs.get(spent).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.completed_at.is_some());

    db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL pointing at a PostgreSQL instance
async fn test_host_record_lookup_and_insert() {
    dotenvy::dotenv().ok();
    let db = TestDatabase::new().await;
    db.add_record(42, Some("minute-book-1921")).await;
    db.add_record(43, None).await;

    let with_slug = db.host.find_record(42).await.unwrap().unwrap();
    assert_eq!(with_slug.path_key(), "minute-book-1921");
    let without_slug = db.host.find_record(43).await.unwrap().unwrap();
    assert_eq!(without_slug.path_key(), "0000000043");
    assert!(db.host.find_record(44).await.unwrap().is_none());

    assert!(!db.host.has_master_object(42).await.unwrap());
    let object_id = db
        .host
        .insert_digital_object(NewDigitalObject {
            parent_id: None,
            record_id: Some(42),
            usage: UsageKind::Master,
            mime_type: "application/pdf".into(),
            byte_size: 2048,
            checksum: Some("d41d8cd98f00b204e9800998ecf8427e".into()),
            name: "minute_book.pdf".into(),
            path: "r/minute-book-1921/minute_book.pdf".into(),
            sequence: 0,
        })
        .await
        .unwrap();
    assert!(object_id > 0);
    assert!(db.host.has_master_object(42).await.unwrap());

    db.cleanup().await;
}
