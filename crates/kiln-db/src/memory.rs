//! In-memory job and host stores.
//!
//! Same semantics as the PostgreSQL stores, held behind a single lock so every
//! check-and-set is atomic. Used by tests and by embedders without PostgreSQL.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

use kiln_core::{
    Error, HostRecord, HostRecordStore, ItemStatus, Job, JobFilter, JobItem, JobKind, JobOutput,
    JobStatus, JobStore, NewDigitalObject, NewJob, QueueStats, Result, StaleRecovery,
};

#[derive(Default)]
struct JobState {
    /// Creation order; claim scans front to back.
    jobs: Vec<Job>,
    items: HashMap<Uuid, Vec<JobItem>>,
}

impl JobState {
    fn job_mut(&mut self, job_id: Uuid) -> Result<&mut Job> {
        self.jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or(Error::JobNotFound(job_id))
    }
}

/// In-memory implementation of [`JobStore`].
#[derive(Clone, Default)]
pub struct MemoryJobStore {
    state: Arc<Mutex<JobState>>,
    notify: Arc<Notify>,
    fail_item_updates: Arc<AtomicBool>,
}

impl MemoryJobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the job notification handle for event-driven waking.
    pub fn job_notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    fn lock(&self) -> Result<MutexGuard<'_, JobState>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("job store lock poisoned".into()))
    }

    /// Make `update_item` fail, as a dropped connection would mid-job.
    pub fn fail_item_updates(&self, fail: bool) {
        self.fail_item_updates.store(fail, Ordering::SeqCst);
    }

    /// Overwrite the stored options JSON of a job.
    pub fn overwrite_options(&self, job_id: Uuid, options: serde_json::Value) -> Result<()> {
        let mut state = self.lock()?;
        state.job_mut(job_id)?.options = options;
        Ok(())
    }

    /// Overwrite `updated_at` of a job (for retention tests).
    pub fn backdate(&self, job_id: Uuid, age: Duration) -> Result<()> {
        let mut state = self.lock()?;
        state.job_mut(job_id)?.updated_at = Utc::now() - age;
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, job: NewJob) -> Result<Uuid> {
        let job_id = Uuid::now_v7();
        let now = Utc::now();
        let items: Vec<JobItem> = job
            .sources
            .iter()
            .enumerate()
            .map(|(ordinal, source)| JobItem {
                id: Uuid::now_v7(),
                job_id,
                ordinal: ordinal as i32,
                source: source.clone(),
                status: ItemStatus::Pending,
                error_message: None,
            })
            .collect();

        let record = Job {
            id: job_id,
            name: job.name,
            kind: job.kind,
            status: JobStatus::Queued,
            attempts: 0,
            max_attempts: job.max_attempts.max(1),
            record_id: job.record_id,
            options: serde_json::to_value(&job.options)?,
            error_message: None,
            output_ref: None,
            output_object_id: None,
            total_items: items.len() as i32,
            processed_items: 0,
            notes: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        {
            let mut state = self.lock()?;
            state.jobs.push(record);
            state.items.insert(job_id, items);
        }
        self.notify.notify_waiters();
        Ok(job_id)
    }

    async fn claim_next_for_kinds(&self, kinds: &[JobKind]) -> Result<Option<Job>> {
        let mut state = self.lock()?;
        let claimed = state.jobs.iter_mut().find(|j| {
            j.status == JobStatus::Queued
                && j.has_attempts_left()
                && (kinds.is_empty() || kinds.contains(&j.kind))
        });

        Ok(claimed.map(|job| {
            job.status = JobStatus::Processing;
            job.attempts += 1;
            job.updated_at = Utc::now();
            job.clone()
        }))
    }

    async fn mark_processing(&self, job_id: Uuid) -> Result<bool> {
        let mut state = self.lock()?;
        let job = state.job_mut(job_id)?;
        if job.status != JobStatus::Queued || !job.has_attempts_left() {
            return Ok(false);
        }
        job.status = JobStatus::Processing;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn increment_attempt(&self, job_id: Uuid) -> Result<i32> {
        let mut state = self.lock()?;
        let job = state.job_mut(job_id)?;
        if !job.has_attempts_left() {
            return Err(Error::Job(format!("job {job_id} has no attempts left")));
        }
        job.attempts += 1;
        job.updated_at = Utc::now();
        Ok(job.attempts)
    }

    async fn mark_completed(&self, job_id: Uuid, output: &JobOutput) -> Result<()> {
        let mut state = self.lock()?;
        let job = state.job_mut(job_id)?;
        if job.status != JobStatus::Processing {
            return Err(Error::Job(format!("job {job_id} is not processing")));
        }
        let now = Utc::now();
        job.status = JobStatus::Completed;
        job.output_ref = Some(output.output_ref.to_string_lossy().into_owned());
        job.processed_items = output.processed_items;
        job.error_message = None;
        job.completed_at = Some(now);
        job.updated_at = now;
        Ok(())
    }

    async fn mark_failed(&self, job_id: Uuid, error: &str) -> Result<()> {
        let mut state = self.lock()?;
        let job = state.job_mut(job_id)?;
        if job.status.is_terminal() {
            return Err(Error::Job(format!("job {job_id} is already {}", job.status)));
        }
        let now = Utc::now();
        job.status = JobStatus::Failed;
        job.error_message = Some(error.to_string());
        job.completed_at = Some(now);
        job.updated_at = now;
        Ok(())
    }

    async fn release(&self, job_id: Uuid, error: &str) -> Result<JobStatus> {
        let mut state = self.lock()?;
        let job = state.job_mut(job_id)?;
        if job.status != JobStatus::Processing {
            return Err(Error::Job(format!("job {job_id} is not processing")));
        }
        let now = Utc::now();
        if job.has_attempts_left() {
            job.status = JobStatus::Queued;
            job.completed_at = None;
        } else {
            job.status = JobStatus::Failed;
            job.completed_at = Some(now);
        }
        job.error_message = Some(error.to_string());
        job.updated_at = now;
        Ok(job.status)
    }

    async fn requeue(&self, job_id: Uuid) -> Result<bool> {
        {
            let mut state = self.lock()?;
            let job = state.job_mut(job_id)?;
            if job.status == JobStatus::Processing {
                return Ok(false);
            }
            job.status = JobStatus::Queued;
            job.attempts = 0;
            job.error_message = None;
            job.output_ref = None;
            job.output_object_id = None;
            job.processed_items = 0;
            job.completed_at = None;
            job.updated_at = Utc::now();
            if let Some(items) = state.items.get_mut(&job_id) {
                for item in items.iter_mut() {
                    item.status = ItemStatus::Pending;
                    item.error_message = None;
                }
            }
        }
        self.notify.notify_waiters();
        Ok(true)
    }

    async fn set_output_object(&self, job_id: Uuid, object_id: i64) -> Result<()> {
        let mut state = self.lock()?;
        let job = state.job_mut(job_id)?;
        job.output_object_id = Some(object_id);
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn append_log(&self, job_id: Uuid, line: &str) -> Result<()> {
        let mut state = self.lock()?;
        let job = state.job_mut(job_id)?;
        match job.notes.as_mut() {
            Some(notes) if !notes.is_empty() => {
                notes.push('\n');
                notes.push_str(line);
            }
            _ => job.notes = Some(line.to_string()),
        }
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn items(&self, job_id: Uuid) -> Result<Vec<JobItem>> {
        let state = self.lock()?;
        let mut items = state.items.get(&job_id).cloned().unwrap_or_default();
        items.sort_by_key(|i| i.ordinal);
        Ok(items)
    }

    async fn update_item(
        &self,
        item_id: Uuid,
        status: ItemStatus,
        error: Option<&str>,
    ) -> Result<()> {
        if self.fail_item_updates.load(Ordering::SeqCst) {
            return Err(Error::Internal("item update rejected".into()));
        }
        let mut state = self.lock()?;
        let item = state
            .items
            .values_mut()
            .flat_map(|items| items.iter_mut())
            .find(|i| i.id == item_id)
            .ok_or_else(|| Error::NotFound(format!("job item {item_id}")))?;
        item.status = status;
        item.error_message = error.map(str::to_string);
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        let state = self.lock()?;
        Ok(state.jobs.iter().find(|j| j.id == job_id).cloned())
    }

    async fn list_filtered(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let state = self.lock()?;
        let limit = if filter.limit <= 0 { 50 } else { filter.limit } as usize;
        Ok(state
            .jobs
            .iter()
            .rev()
            .filter(|j| filter.status.map_or(true, |s| j.status == s))
            .filter(|j| filter.kind.map_or(true, |k| j.kind == k))
            .skip(filter.offset.max(0) as usize)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let state = self.lock()?;
        let count = |status: JobStatus| state.jobs.iter().filter(|j| j.status == status).count();
        Ok(QueueStats {
            total_jobs: state.jobs.len() as i64,
            queued: count(JobStatus::Queued) as i64,
            processing: count(JobStatus::Processing) as i64,
            completed: count(JobStatus::Completed) as i64,
            failed: count(JobStatus::Failed) as i64,
            total_items: state.items.values().map(Vec::len).sum::<usize>() as i64,
        })
    }

    async fn requeue_stale(&self, older_than: Duration, error: &str) -> Result<StaleRecovery> {
        let now = Utc::now();
        let cutoff = now - older_than;
        let mut recovery = StaleRecovery::default();
        {
            let mut state = self.lock()?;
            for job in state
                .jobs
                .iter_mut()
                .filter(|j| j.status == JobStatus::Processing && j.updated_at <= cutoff)
            {
                if job.has_attempts_left() {
                    job.status = JobStatus::Queued;
                    job.completed_at = None;
                    recovery.requeued += 1;
                } else {
                    job.status = JobStatus::Failed;
                    job.completed_at = Some(now);
                    recovery.failed += 1;
                }
                job.error_message = Some(error.to_string());
                job.updated_at = now;
            }
        }
        if recovery.requeued > 0 {
            self.notify.notify_waiters();
        }
        Ok(recovery)
    }

    async fn cleanup(&self, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now() - older_than;
        let mut state = self.lock()?;
        let expired: Vec<Uuid> = state
            .jobs
            .iter()
            .filter(|j| j.status.is_terminal() && j.updated_at < cutoff)
            .map(|j| j.id)
            .collect();

        state.jobs.retain(|j| !expired.contains(&j.id));
        for id in &expired {
            state.items.remove(id);
        }
        Ok(expired.len() as u64)
    }
}

#[derive(Default)]
struct HostState {
    records: HashMap<i64, HostRecord>,
    /// Inserted objects, indexed by `id - 1`.
    objects: Vec<NewDigitalObject>,
}

/// In-memory implementation of [`HostRecordStore`].
#[derive(Clone, Default)]
pub struct MemoryHostStore {
    state: Arc<Mutex<HostState>>,
    fail_inserts: Arc<AtomicBool>,
}

impl MemoryHostStore {
    /// Create an empty host store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HostState>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("host store lock poisoned".into()))
    }

    /// Register a host record.
    pub fn add_record(&self, id: i64, slug: Option<&str>) -> Result<()> {
        self.lock()?.records.insert(
            id,
            HostRecord {
                id,
                slug: slug.map(str::to_string),
            },
        );
        Ok(())
    }

    /// Make every subsequent `insert_digital_object` fail.
    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    /// All inserted digital objects with their ids, in insertion order.
    pub fn objects(&self) -> Result<Vec<(i64, NewDigitalObject)>> {
        Ok(self
            .lock()?
            .objects
            .iter()
            .enumerate()
            .map(|(i, o)| (i as i64 + 1, o.clone()))
            .collect())
    }
}

#[async_trait]
impl HostRecordStore for MemoryHostStore {
    async fn find_record(&self, record_id: i64) -> Result<Option<HostRecord>> {
        Ok(self.lock()?.records.get(&record_id).cloned())
    }

    async fn has_master_object(&self, record_id: i64) -> Result<bool> {
        Ok(self
            .lock()?
            .objects
            .iter()
            .any(|o| o.record_id == Some(record_id)))
    }

    async fn insert_digital_object(&self, object: NewDigitalObject) -> Result<i64> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(Error::Attach("digital object insert rejected".into()));
        }
        let mut state = self.lock()?;
        state.objects.push(object);
        Ok(state.objects.len() as i64)
    }
}
