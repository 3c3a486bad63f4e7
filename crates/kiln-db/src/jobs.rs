//! Job store implementation.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use kiln_core::{
    Error, ItemStatus, Job, JobFilter, JobItem, JobKind, JobOutput, JobStatus, JobStore, NewJob,
    QueueStats, Result, StaleRecovery,
};

/// Default page size for `list_filtered` when the filter leaves it unset.
const DEFAULT_LIST_LIMIT: i64 = 50;

const JOB_COLUMNS: &str = "id, name, kind, status, attempts, max_attempts, record_id, options, \
     error_message, output_ref, output_object_id, total_items, processed_items, notes, \
     created_at, updated_at, completed_at";

/// PostgreSQL implementation of [`JobStore`].
///
/// Clones share the pool and the notify handle.
#[derive(Clone)]
pub struct PgJobStore {
    pool: Pool<Postgres>,
    /// Woken on enqueue so an idle daemon can skip the rest of its poll sleep.
    notify: Arc<Notify>,
}

impl PgJobStore {
    /// Create a new PgJobStore with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            pool,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Create a new PgJobStore sharing an existing notify handle.
    pub fn with_notify(pool: Pool<Postgres>, notify: Arc<Notify>) -> Self {
        Self { pool, notify }
    }

    /// Get the job notification handle for event-driven waking.
    pub fn job_notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Parse a job row into a Job struct.
    fn parse_job_row(row: &PgRow) -> Result<Job> {
        let kind: String = row.try_get("kind")?;
        let status: String = row.try_get("status")?;
        Ok(Job {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            kind: kind.parse()?,
            status: status.parse()?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            record_id: row.try_get("record_id")?,
            options: row.try_get("options")?,
            error_message: row.try_get("error_message")?,
            output_ref: row.try_get("output_ref")?,
            output_object_id: row.try_get("output_object_id")?,
            total_items: row.try_get("total_items")?,
            processed_items: row.try_get("processed_items")?,
            notes: row.try_get("notes")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn parse_item_row(row: &PgRow) -> Result<JobItem> {
        let status: String = row.try_get("status")?;
        Ok(JobItem {
            id: row.try_get("id")?,
            job_id: row.try_get("job_id")?,
            ordinal: row.try_get("ordinal")?,
            source: row.try_get("source")?,
            status: status.parse()?,
            error_message: row.try_get("error_message")?,
        })
    }

    fn effective_limit(limit: i64) -> i64 {
        if limit <= 0 {
            DEFAULT_LIST_LIMIT
        } else {
            limit
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn enqueue(&self, job: NewJob) -> Result<Uuid> {
        let job_id = Uuid::now_v7();
        let options = serde_json::to_value(&job.options)?;

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        sqlx::query(
            "INSERT INTO job_queue (id, name, kind, status, attempts, max_attempts, record_id,
                                    options, total_items)
             VALUES ($1, $2, $3, 'queued', 0, $4, $5, $6, $7)",
        )
        .bind(job_id)
        .bind(&job.name)
        .bind(job.kind.as_str())
        .bind(job.max_attempts)
        .bind(job.record_id)
        .bind(&options)
        .bind(job.sources.len() as i32)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        for (ordinal, source) in job.sources.iter().enumerate() {
            sqlx::query(
                "INSERT INTO job_item (id, job_id, ordinal, source, status)
                 VALUES ($1, $2, $3, $4, 'pending')",
            )
            .bind(Uuid::now_v7())
            .bind(job_id)
            .bind(ordinal as i32)
            .bind(source)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "db",
            component = "jobs",
            op = "enqueue",
            %job_id,
            job_kind = %job.kind,
            items = job.sources.len(),
            "Job enqueued"
        );
        self.notify.notify_waiters();
        Ok(job_id)
    }

    async fn claim_next_for_kinds(&self, kinds: &[JobKind]) -> Result<Option<Job>> {
        let kind_strings: Vec<String> = kinds.iter().map(|k| k.as_str().to_string()).collect();

        // Filter by kind before locking. Empty array = claim any kind.
        let query = format!(
            "UPDATE job_queue
             SET status = 'processing', attempts = attempts + 1, updated_at = NOW()
             WHERE id = (
                 SELECT id FROM job_queue
                 WHERE status = 'queued'
                   AND attempts < max_attempts
                   AND (cardinality($1::text[]) = 0 OR kind = ANY($1))
                 ORDER BY created_at ASC, id ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {JOB_COLUMNS}"
        );

        let row = sqlx::query(&query)
            .bind(&kind_strings)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_job_row).transpose()
    }

    async fn mark_processing(&self, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE job_queue
             SET status = 'processing', updated_at = NOW()
             WHERE id = $1 AND status = 'queued' AND attempts < max_attempts",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() == 1)
    }

    async fn increment_attempt(&self, job_id: Uuid) -> Result<i32> {
        let attempts: Option<i32> = sqlx::query_scalar(
            "UPDATE job_queue
             SET attempts = attempts + 1, updated_at = NOW()
             WHERE id = $1 AND attempts < max_attempts
             RETURNING attempts",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        attempts.ok_or_else(|| Error::Job(format!("job {job_id} has no attempts left")))
    }

    async fn claim(&self, job_id: Uuid) -> Result<Option<Job>> {
        // Single statement: the conditional update is the claim.
        let query = format!(
            "UPDATE job_queue
             SET status = 'processing', attempts = attempts + 1, updated_at = NOW()
             WHERE id = $1 AND status = 'queued' AND attempts < max_attempts
             RETURNING {JOB_COLUMNS}"
        );

        let row = sqlx::query(&query)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_job_row).transpose()
    }

    async fn mark_completed(&self, job_id: Uuid, output: &JobOutput) -> Result<()> {
        let result = sqlx::query(
            "UPDATE job_queue
             SET status = 'completed', output_ref = $2, processed_items = $3,
                 error_message = NULL, completed_at = NOW(), updated_at = NOW()
             WHERE id = $1 AND status = 'processing'",
        )
        .bind(job_id)
        .bind(output.output_ref.to_string_lossy().as_ref())
        .bind(output.processed_items)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::Job(format!("job {job_id} is not processing")));
        }
        Ok(())
    }

    async fn mark_failed(&self, job_id: Uuid, error: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE job_queue
             SET status = 'failed', error_message = $2, completed_at = NOW(), updated_at = NOW()
             WHERE id = $1 AND status IN ('queued', 'processing')",
        )
        .bind(job_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::JobNotFound(job_id));
        }
        Ok(())
    }

    async fn release(&self, job_id: Uuid, error: &str) -> Result<JobStatus> {
        let status: Option<String> = sqlx::query_scalar(
            "UPDATE job_queue
             SET status = CASE WHEN attempts < max_attempts THEN 'queued' ELSE 'failed' END,
                 completed_at = CASE WHEN attempts < max_attempts THEN NULL ELSE NOW() END,
                 error_message = $2,
                 updated_at = NOW()
             WHERE id = $1 AND status = 'processing'
             RETURNING status",
        )
        .bind(job_id)
        .bind(error)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        match status {
            Some(s) => s.parse(),
            None => Err(Error::Job(format!("job {job_id} is not processing"))),
        }
    }

    async fn requeue(&self, job_id: Uuid) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let result = sqlx::query(
            "UPDATE job_queue
             SET status = 'queued', attempts = 0, error_message = NULL, output_ref = NULL,
                 output_object_id = NULL, processed_items = 0, completed_at = NULL,
                 updated_at = NOW()
             WHERE id = $1 AND status <> 'processing'",
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            tx.rollback().await.map_err(Error::Database)?;
            return Ok(false);
        }

        sqlx::query(
            "UPDATE job_item SET status = 'pending', error_message = NULL WHERE job_id = $1",
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;
        self.notify.notify_waiters();
        Ok(true)
    }

    async fn set_output_object(&self, job_id: Uuid, object_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE job_queue SET output_object_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(job_id)
        .bind(object_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn append_log(&self, job_id: Uuid, line: &str) -> Result<()> {
        sqlx::query(
            "UPDATE job_queue
             SET notes = CASE WHEN notes IS NULL OR notes = '' THEN $2
                              ELSE notes || E'\\n' || $2 END,
                 updated_at = NOW()
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(line)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn items(&self, job_id: Uuid) -> Result<Vec<JobItem>> {
        let rows = sqlx::query(
            "SELECT id, job_id, ordinal, source, status, error_message
             FROM job_item WHERE job_id = $1
             ORDER BY ordinal ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(Self::parse_item_row).collect()
    }

    async fn update_item(
        &self,
        item_id: Uuid,
        status: ItemStatus,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE job_item SET status = $2, error_message = $3 WHERE id = $1")
            .bind(item_id)
            .bind(status.as_str())
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        let query = format!("SELECT {JOB_COLUMNS} FROM job_queue WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_job_row).transpose()
    }

    async fn list_filtered(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM job_queue
             WHERE ($1::text IS NULL OR status = $1)
               AND ($2::text IS NULL OR kind = $2)
             ORDER BY created_at DESC
             LIMIT $3 OFFSET $4"
        );

        let rows = sqlx::query(&query)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.kind.map(|k| k.as_str()))
            .bind(Self::effective_limit(filter.limit))
            .bind(filter.offset.max(0))
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        rows.iter().map(Self::parse_job_row).collect()
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            "SELECT
                COUNT(*) AS total_jobs,
                COUNT(*) FILTER (WHERE status = 'queued') AS queued,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                (SELECT COUNT(*) FROM job_item) AS total_items
             FROM job_queue",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(QueueStats {
            total_jobs: row.try_get("total_jobs")?,
            queued: row.try_get("queued")?,
            processing: row.try_get("processing")?,
            completed: row.try_get("completed")?,
            failed: row.try_get("failed")?,
            total_items: row.try_get("total_items")?,
        })
    }

    async fn requeue_stale(&self, older_than: Duration, error: &str) -> Result<StaleRecovery> {
        let row = sqlx::query(
            "WITH recovered AS (
                 UPDATE job_queue
                 SET status = CASE WHEN attempts < max_attempts THEN 'queued' ELSE 'failed' END,
                     completed_at = CASE WHEN attempts < max_attempts THEN NULL ELSE NOW() END,
                     error_message = $2,
                     updated_at = NOW()
                 WHERE status = 'processing'
                   AND updated_at <= NOW() - ($1::bigint * INTERVAL '1 second')
                 RETURNING status
             )
             SELECT
                COUNT(*) FILTER (WHERE status = 'queued') AS requeued,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed
             FROM recovered",
        )
        .bind(older_than.num_seconds())
        .bind(error)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        let requeued: i64 = row.try_get("requeued")?;
        let failed: i64 = row.try_get("failed")?;
        if requeued > 0 {
            self.notify.notify_waiters();
        }
        debug!(requeued, failed, "Recovered stale jobs");

        Ok(StaleRecovery {
            requeued: requeued as u64,
            failed: failed as u64,
        })
    }

    async fn cleanup(&self, older_than: Duration) -> Result<u64> {
        // Items go with their job (ON DELETE CASCADE).
        let result = sqlx::query(
            "DELETE FROM job_queue
             WHERE status IN ('completed', 'failed')
               AND updated_at < NOW() - ($1::bigint * INTERVAL '1 second')",
        )
        .bind(older_than.num_seconds())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_limit_defaults_when_unset() {
        assert_eq!(PgJobStore::effective_limit(0), DEFAULT_LIST_LIMIT);
        assert_eq!(PgJobStore::effective_limit(-5), DEFAULT_LIST_LIMIT);
        assert_eq!(PgJobStore::effective_limit(7), 7);
    }

    #[test]
    fn test_job_columns_cover_every_field() {
        for column in [
            "id",
            "name",
            "kind",
            "status",
            "attempts",
            "max_attempts",
            "record_id",
            "options",
            "error_message",
            "output_ref",
            "output_object_id",
            "total_items",
            "processed_items",
            "notes",
            "created_at",
            "updated_at",
            "completed_at",
        ] {
            assert!(
                JOB_COLUMNS.split(',').any(|c| c.trim() == column),
                "missing column {column}"
            );
        }
    }
}
