//! Drives one job through its lifecycle.
//!
//! ```text
//! queued --claim--> processing --ok--> completed
//! processing --fatal--> failed
//! processing --retryable, attempts left--> queued
//! processing --retryable, attempts exhausted--> failed
//! ```
//!
//! The orchestrator owns no state of its own; the job store is the single
//! source of truth. Storage errors escape to the caller, tool failures never do.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use kiln_core::defaults::{EVENT_BUS_CAPACITY, STALE_JOB_ERROR};
use kiln_core::{Error, Job, JobKind, JobOutput, JobStatus, JobStore, Result, StaleRecovery};

use crate::attach::RecordAttacher;
use crate::handler::{Artifact, ItemProcessor, JobContext, ProcessOutcome, ProcessReport};
use crate::worker::WorkerEvent;

/// What happened to one job during one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRun {
    pub job_id: Uuid,
    pub name: String,
    pub kind: JobKind,
    /// Status after this pass (`queued` when released for another attempt).
    pub status: JobStatus,
    /// Outcome summary (`4/6`, error reason).
    pub message: String,
    pub output_ref: Option<PathBuf>,
    pub output_object_id: Option<i64>,
    /// Set when the job completed but attaching its artifact failed.
    pub attach_error: Option<String>,
    /// Items that failed in this pass, even if the job completed.
    pub failed_items: usize,
    pub duration_ms: u64,
}

impl JobRun {
    fn new(job: &Job, status: JobStatus, message: impl Into<String>, start: Instant) -> Self {
        Self {
            job_id: job.id,
            name: job.name.clone(),
            kind: job.kind,
            status,
            message: message.into(),
            output_ref: None,
            output_object_id: None,
            attach_error: None,
            failed_items: 0,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    /// Whether the job ended `completed` in this pass.
    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Completed
    }

    /// Completed with every item processed.
    pub fn is_clean(&self) -> bool {
        self.succeeded() && self.failed_items == 0
    }
}

/// Claims jobs, dispatches them to processors and records the outcome.
pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    processors: HashMap<JobKind, Arc<dyn ItemProcessor>>,
    attacher: Option<RecordAttacher>,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl Orchestrator {
    /// Create an orchestrator with no processors.
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            store,
            processors: HashMap::new(),
            attacher: None,
            event_tx,
        }
    }

    /// Register a processor for its kind, replacing any previous one.
    pub fn with_processor(mut self, processor: Arc<dyn ItemProcessor>) -> Self {
        let kind = processor.kind();
        debug!(%kind, "Registered item processor");
        self.processors.insert(kind, processor);
        self
    }

    /// Register several processors.
    pub fn with_processors(self, processors: impl IntoIterator<Item = Arc<dyn ItemProcessor>>) -> Self {
        processors
            .into_iter()
            .fold(self, |orchestrator, p| orchestrator.with_processor(p))
    }

    /// Enable attaching completed artifacts to host records.
    pub fn with_attacher(mut self, attacher: RecordAttacher) -> Self {
        self.attacher = Some(attacher);
        self
    }

    /// Kinds with a registered processor.
    pub fn kinds(&self) -> Vec<JobKind> {
        let mut kinds: Vec<JobKind> = self.processors.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Subscribe to lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    pub(crate) fn emit(&self, event: WorkerEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Claim and process the oldest eligible job of any registered kind.
    ///
    /// Returns `None` when nothing is claimable.
    pub async fn run_once(&self) -> Result<Option<JobRun>> {
        self.run_once_for(None).await
    }

    /// Like [`run_once`](Self::run_once), limited to one kind when given.
    pub async fn run_once_for(&self, kind: Option<JobKind>) -> Result<Option<JobRun>> {
        let kinds = match kind {
            Some(kind) => vec![kind],
            None => self.kinds(),
        };
        if kinds.is_empty() {
            return Ok(None);
        }
        match self.store.claim_next_for_kinds(&kinds).await? {
            Some(job) => self.process(job).await.map(Some),
            None => Ok(None),
        }
    }

    /// Process one specific job.
    ///
    /// With `force`, a job that already ended is put back to `queued` with a
    /// fresh attempt budget first. Returns `None` when the job is not
    /// claimable (already running, or ended and not forced).
    pub async fn run_job(&self, job_id: Uuid, force: bool) -> Result<Option<JobRun>> {
        let job = self.store.get(job_id).await?.ok_or(Error::JobNotFound(job_id))?;

        if force && job.status != JobStatus::Processing && self.store.requeue(job_id).await? {
            info!(%job_id, previous = %job.status, "Job requeued");
            self.emit(WorkerEvent::JobRequeued {
                job_id,
                kind: job.kind,
                error: None,
            });
        }

        match self.store.claim(job_id).await? {
            Some(job) => self.process(job).await.map(Some),
            None => Ok(None),
        }
    }

    /// Process a job that has already been claimed.
    ///
    /// When a store call fails part way, the job is released for another
    /// attempt (best effort) before the error is returned, so it does not stay
    /// `processing`.
    pub async fn process(&self, job: Job) -> Result<JobRun> {
        let job_id = job.id;
        let kind = job.kind;
        match self.process_claimed(job).await {
            Ok(run) => Ok(run),
            Err(e) => {
                error!(
                    subsystem = "jobs",
                    component = "orchestrator",
                    op = "process",
                    %job_id,
                    job_kind = %kind,
                    error = %e,
                    "Store error while processing job"
                );
                match self.store.release(job_id, &format!("Worker error: {e}")).await {
                    Ok(status) => {
                        if status == JobStatus::Queued {
                            self.emit(WorkerEvent::JobRequeued {
                                job_id,
                                kind,
                                error: Some(e.to_string()),
                            });
                        }
                    }
                    // Already left `processing` (e.g. completed before the error).
                    Err(release_err) => {
                        debug!(%job_id, error = %release_err, "Release after store error skipped")
                    }
                }
                Err(e)
            }
        }
    }

    async fn process_claimed(&self, job: Job) -> Result<JobRun> {
        let start = Instant::now();
        let job_id = job.id;
        let kind = job.kind;

        info!(
            subsystem = "jobs",
            component = "orchestrator",
            op = "process",
            %job_id,
            job_kind = %kind,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            "Processing job"
        );
        self.emit(WorkerEvent::JobStarted { job_id, kind });

        let items = self.store.items(job_id).await?;
        if items.is_empty() {
            return self.finish_failed(&job, "No files to process", false, start).await;
        }

        let options = match job.typed_options() {
            Ok(options) => options,
            Err(e) => return self.finish_failed(&job, &e.to_string(), false, start).await,
        };

        let Some(processor) = self.processors.get(&kind).cloned() else {
            warn!(%job_id, job_kind = %kind, "No processor registered for job kind");
            let reason = format!("No processor for job kind: {kind}");
            return self.finish_failed(&job, &reason, false, start).await;
        };

        let event_tx = self.event_tx.clone();
        let ctx = JobContext::new(job, items, options).with_progress_callback(
            move |percent, message| {
                let _ = event_tx.send(WorkerEvent::JobProgress {
                    job_id,
                    percent,
                    message: message.map(String::from),
                });
            },
        );

        let report = match processor.process(&ctx).await {
            Ok(report) => report,
            Err(e) => {
                error!(%job_id, job_kind = %kind, error = %e, "Processor error");
                ProcessReport::new(ProcessOutcome::retryable(e.to_string()))
            }
        };

        for item in &report.items {
            self.store
                .update_item(item.item_id, item.status, item.error.as_deref())
                .await?;
        }
        for note in &report.notes {
            self.store.append_log(job_id, note).await?;
        }

        let processed = report.processed_count() as i32;
        let failed_items = report.failed_count();
        let mut run = match report.outcome {
            ProcessOutcome::Completed(artifact) => {
                self.finish_completed(&ctx, artifact, processed, start).await?
            }
            ProcessOutcome::Failed { reason, retryable } => {
                self.finish_failed(&ctx.job, &reason, retryable, start).await?
            }
        };
        run.failed_items = failed_items;
        Ok(run)
    }

    /// Recover jobs a dead worker left in `processing` for longer than
    /// `older_than`.
    pub async fn recover_stale(&self, older_than: std::time::Duration) -> Result<StaleRecovery> {
        let older_than = chrono::Duration::from_std(older_than)
            .map_err(|e| Error::Config(format!("stale threshold out of range: {e}")))?;
        let recovery = self.store.requeue_stale(older_than, STALE_JOB_ERROR).await?;
        if recovery.total() > 0 {
            warn!(
                subsystem = "jobs",
                component = "orchestrator",
                op = "recover",
                requeued = recovery.requeued,
                failed = recovery.failed,
                stale_after_secs = older_than.num_seconds(),
                "Recovered stale jobs"
            );
        }
        Ok(recovery)
    }

    async fn finish_completed(
        &self,
        ctx: &JobContext,
        artifact: Artifact,
        processed: i32,
        start: Instant,
    ) -> Result<JobRun> {
        let job = &ctx.job;
        let job_id = job.id;

        self.store
            .mark_completed(
                job_id,
                &JobOutput {
                    output_ref: artifact.path.clone(),
                    processed_items: processed,
                },
            )
            .await?;

        info!(
            subsystem = "jobs",
            component = "orchestrator",
            op = "complete",
            %job_id,
            job_kind = %job.kind,
            produced = %artifact.summary(),
            output = %artifact.path.display(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Job completed"
        );
        self.emit(WorkerEvent::JobCompleted {
            job_id,
            kind: job.kind,
            produced: artifact.produced,
            expected: artifact.expected,
        });

        let mut run = JobRun::new(job, JobStatus::Completed, artifact.summary(), start);
        run.output_ref = Some(artifact.path.clone());

        if let (true, Some(record_id), Some(mime), Some(attacher)) = (
            ctx.options.attach_to_record,
            job.record_id,
            artifact.mime_type.as_deref(),
            self.attacher.as_ref(),
        ) {
            match attacher.attach(record_id, &artifact.path, mime).await {
                Ok(outcome) => {
                    self.store.set_output_object(job_id, outcome.object_id).await?;
                    for failure in &outcome.derivative_failures {
                        self.store
                            .append_log(job_id, &format!("Derivative failed: {failure}"))
                            .await?;
                    }
                    run.output_object_id = Some(outcome.object_id);
                }
                Err(e) => {
                    // The job stays completed; the artifact is still on disk.
                    warn!(
                        subsystem = "jobs",
                        component = "orchestrator",
                        op = "attach",
                        %job_id,
                        record_id,
                        error = %e,
                        "Attach failed"
                    );
                    self.store
                        .append_log(job_id, &format!("Attach failed: {e}"))
                        .await?;
                    self.emit(WorkerEvent::AttachFailed {
                        job_id,
                        record_id,
                        error: e.to_string(),
                    });
                    run.attach_error = Some(e.to_string());
                }
            }
        }

        run.duration_ms = start.elapsed().as_millis() as u64;
        Ok(run)
    }

    async fn finish_failed(
        &self,
        job: &Job,
        reason: &str,
        retryable: bool,
        start: Instant,
    ) -> Result<JobRun> {
        let job_id = job.id;
        let status = if retryable {
            self.store.release(job_id, reason).await?
        } else {
            self.store.mark_failed(job_id, reason).await?;
            JobStatus::Failed
        };

        warn!(
            subsystem = "jobs",
            component = "orchestrator",
            op = "fail",
            %job_id,
            job_kind = %job.kind,
            retryable,
            %status,
            error = reason,
            duration_ms = start.elapsed().as_millis() as u64,
            "Job failed"
        );

        if status == JobStatus::Queued {
            self.emit(WorkerEvent::JobRequeued {
                job_id,
                kind: job.kind,
                error: Some(reason.to_string()),
            });
        } else {
            self.emit(WorkerEvent::JobFailed {
                job_id,
                kind: job.kind,
                error: reason.to_string(),
            });
        }

        Ok(JobRun::new(job, status, reason, start))
    }
}
