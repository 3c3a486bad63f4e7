//! Storage traits for the job queue and the host record store.

use async_trait::async_trait;
use chrono::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    HostRecord, ItemStatus, Job, JobFilter, JobItem, JobKind, JobOutput, JobStatus,
    NewDigitalObject, NewJob, QueueStats, StaleRecovery,
};

/// Durable job queue: the single source of truth for what work exists and
/// how it ended.
///
/// Every state transition is a single conditional write, so two workers can
/// never both win the claim for the same job.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a queued job together with its items (ordinal = position).
    async fn enqueue(&self, job: NewJob) -> Result<Uuid>;

    /// Claim the oldest queued job whose kind is in `kinds` and that still has
    /// attempts left. Moves it to `processing` and increments `attempts`.
    /// An empty slice means "claim any kind".
    async fn claim_next_for_kinds(&self, kinds: &[JobKind]) -> Result<Option<Job>>;

    /// Claim the oldest eligible job of any kind.
    async fn claim_next(&self) -> Result<Option<Job>> {
        self.claim_next_for_kinds(&[]).await
    }

    /// Conditionally move a job from `queued` to `processing`.
    ///
    /// Returns `true` only for the caller that performed the transition.
    async fn mark_processing(&self, job_id: Uuid) -> Result<bool>;

    /// Increment the attempt counter, returning the new value.
    async fn increment_attempt(&self, job_id: Uuid) -> Result<i32>;

    /// Claim one specific job. Returns `None` when the job is not queued or has
    /// no attempts left.
    async fn claim(&self, job_id: Uuid) -> Result<Option<Job>> {
        let Some(job) = self.get(job_id).await? else {
            return Ok(None);
        };
        if job.status != JobStatus::Queued || !job.has_attempts_left() {
            debug!(%job_id, status = %job.status, attempts = job.attempts, "Job not claimable");
            return Ok(None);
        }
        if !self.mark_processing(job_id).await? {
            debug!(%job_id, "Lost claim race");
            return Ok(None);
        }
        self.increment_attempt(job_id).await?;
        self.get(job_id).await
    }

    /// Record the output artifact and mark the job `completed`.
    async fn mark_completed(&self, job_id: Uuid, output: &JobOutput) -> Result<()>;

    /// Mark the job terminally `failed`.
    async fn mark_failed(&self, job_id: Uuid, error: &str) -> Result<()>;

    /// Record a retryable failure: back to `queued` while attempts remain,
    /// otherwise terminally `failed`. Returns the resulting status.
    async fn release(&self, job_id: Uuid, error: &str) -> Result<JobStatus>;

    /// Put a job back to `queued` with a fresh attempt budget, clearing its
    /// error and output. Refuses jobs that are currently `processing`.
    async fn requeue(&self, job_id: Uuid) -> Result<bool>;

    /// Store the host digital-object id the artifact was attached as.
    async fn set_output_object(&self, job_id: Uuid, object_id: i64) -> Result<()>;

    /// Append a line to the job's advisory notes.
    async fn append_log(&self, job_id: Uuid, line: &str) -> Result<()>;

    /// Items of a job in ordinal order.
    async fn items(&self, job_id: Uuid) -> Result<Vec<JobItem>>;

    /// Update one item's status.
    async fn update_item(
        &self,
        item_id: Uuid,
        status: ItemStatus,
        error: Option<&str>,
    ) -> Result<()>;

    /// Get job by ID.
    async fn get(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// List jobs, newest first.
    async fn list_filtered(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    /// Queue statistics.
    async fn queue_stats(&self) -> Result<QueueStats>;

    /// Recover `processing` jobs not updated within `older_than`, left behind by
    /// a worker that died mid-job: back to `queued` while attempts remain,
    /// otherwise terminally `failed`. Both record `error`.
    async fn requeue_stale(&self, older_than: Duration, error: &str) -> Result<StaleRecovery>;

    /// Delete terminal jobs (and their items) not updated within `older_than`.
    /// Returns the number of jobs removed.
    async fn cleanup(&self, older_than: Duration) -> Result<u64>;
}

/// The surrounding application's record store, seen from the worker.
#[async_trait]
pub trait HostRecordStore: Send + Sync {
    /// Look up a record and its slug. `None` when the record does not exist.
    async fn find_record(&self, record_id: i64) -> Result<Option<HostRecord>>;

    /// Whether the record already has a master digital object.
    async fn has_master_object(&self, record_id: i64) -> Result<bool>;

    /// Insert a digital-object row, returning its id.
    async fn insert_digital_object(&self, object: NewDigitalObject) -> Result<i64>;
}
