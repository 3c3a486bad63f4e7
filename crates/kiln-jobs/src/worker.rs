//! Job worker: the daemon loop and bounded batch runs.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use kiln_core::defaults::{
    JOB_BATCH_LIMIT, JOB_POLL_INTERVAL_MS, JOB_STALE_AFTER_SECS, JOB_THROTTLE_MS,
};
use kiln_core::{JobKind, JobStore, Result};

use crate::attach::RecordAttacher;
use crate::handler::ItemProcessor;
use crate::orchestrator::{JobRun, Orchestrator};

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between polls when the queue is empty, in milliseconds.
    pub poll_interval_ms: u64,
    /// Maximum jobs handled by one batch run.
    pub batch_limit: usize,
    /// Pause between jobs of a batch run, in milliseconds.
    pub throttle_ms: u64,
    /// Whether the daemon processes jobs at all.
    pub enabled: bool,
    /// Age after which a `processing` job is treated as abandoned, in seconds.
    pub stale_after_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: JOB_POLL_INTERVAL_MS,
            batch_limit: JOB_BATCH_LIMIT,
            throttle_ms: JOB_THROTTLE_MS,
            enabled: true,
            stale_after_secs: JOB_STALE_AFTER_SECS,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_WORKER_ENABLED` | `true` | Enable/disable the daemon |
    /// | `JOB_POLL_INTERVAL_MS` | `5000` | Polling interval when queue is empty |
    /// | `JOB_BATCH_LIMIT` | `10` | Jobs per batch run |
    /// | `JOB_THROTTLE_MS` | `500` | Pause between jobs of a batch |
    /// | `JOB_STALE_AFTER_SECS` | `600` | Age of an abandoned `processing` job |
    pub fn from_env() -> Self {
        let enabled = std::env::var("JOB_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let poll_interval_ms = std::env::var("JOB_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(JOB_POLL_INTERVAL_MS);

        let batch_limit = std::env::var("JOB_BATCH_LIMIT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(JOB_BATCH_LIMIT)
            .max(1);

        let throttle_ms = std::env::var("JOB_THROTTLE_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(JOB_THROTTLE_MS);

        let stale_after_secs = std::env::var("JOB_STALE_AFTER_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(JOB_STALE_AFTER_SECS);

        Self {
            poll_interval_ms,
            batch_limit,
            throttle_ms,
            enabled,
            stale_after_secs,
        }
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set the batch limit.
    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit.max(1);
        self
    }

    /// Set the pause between batch jobs.
    pub fn with_throttle(mut self, ms: u64) -> Self {
        self.throttle_ms = ms;
        self
    }

    /// Enable or disable the daemon.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the abandoned-job threshold.
    pub fn with_stale_after(mut self, secs: u64) -> Self {
        self.stale_after_secs = secs;
        self
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

/// Event emitted while jobs are processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// A job was claimed and is being processed.
    JobStarted { job_id: Uuid, kind: JobKind },
    /// A processor reported progress.
    JobProgress {
        job_id: Uuid,
        percent: i32,
        message: Option<String>,
    },
    /// A job completed.
    JobCompleted {
        job_id: Uuid,
        kind: JobKind,
        produced: u32,
        expected: u32,
    },
    /// A job ended terminally failed.
    JobFailed {
        job_id: Uuid,
        kind: JobKind,
        error: String,
    },
    /// A job went back to `queued`, after a retryable failure or a forced rerun.
    JobRequeued {
        job_id: Uuid,
        kind: JobKind,
        error: Option<String>,
    },
    /// A completed job could not be attached to its record.
    AttachFailed {
        job_id: Uuid,
        record_id: i64,
        error: String,
    },
    /// Worker started.
    WorkerStarted,
    /// Worker stopped.
    WorkerStopped,
}

/// Result of a bounded batch run.
#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub runs: Vec<JobRun>,
}

impl BatchSummary {
    /// Jobs that ended `completed`.
    pub fn succeeded(&self) -> usize {
        self.runs.iter().filter(|r| r.succeeded()).count()
    }

    /// Jobs that did not complete, including those released for a retry.
    pub fn failed(&self) -> usize {
        self.runs.len() - self.succeeded()
    }

    /// Failed items across all runs, including those of completed jobs.
    pub fn failed_items(&self) -> usize {
        self.runs.iter().map(|r| r.failed_items).sum()
    }

    /// Whether every processed job completed with all of its items.
    pub fn is_clean(&self) -> bool {
        self.runs.iter().all(JobRun::is_clean)
    }
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
    task: tokio::task::JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the worker to shut down gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| kiln_core::Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    /// Signal shutdown and wait for the loop to exit.
    pub async fn shutdown_and_wait(self) -> Result<()> {
        self.shutdown().await?;
        self.task
            .await
            .map_err(|e| kiln_core::Error::Internal(format!("Worker task failed: {e}")))
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }
}

/// Job worker that processes jobs from the queue one at a time.
pub struct JobWorker {
    orchestrator: Arc<Orchestrator>,
    config: WorkerConfig,
    notify: Option<Arc<Notify>>,
}

impl JobWorker {
    /// Create a worker around an orchestrator.
    pub fn new(orchestrator: Orchestrator, config: WorkerConfig) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            config,
            notify: None,
        }
    }

    /// Wake the daemon early when this is notified (job enqueued).
    pub fn with_notify(mut self, notify: Arc<Notify>) -> Self {
        self.notify = Some(notify);
        self
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.orchestrator.events()
    }

    /// Start the daemon loop and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.orchestrator.events();

        let task = tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_rx,
            task,
        }
    }

    /// Daemon loop: process one job per iteration, sleep only when idle.
    #[instrument(skip(self, shutdown_rx))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Job worker is disabled, not starting");
            return;
        }

        info!(
            subsystem = "jobs",
            component = "worker",
            poll_interval_ms = self.config.poll_interval_ms,
            kinds = ?self.orchestrator.kinds(),
            "Job worker started"
        );
        self.orchestrator.emit(WorkerEvent::WorkerStarted);

        // Jobs a previous process left mid-flight.
        if let Err(e) = self.orchestrator.recover_stale(self.config.stale_after()).await {
            warn!(subsystem = "jobs", component = "worker", error = %e, "Stale job recovery failed");
        }

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            if shutdown_rx.try_recv().is_ok() {
                info!("Job worker received shutdown signal");
                break;
            }

            match self.orchestrator.run_once().await {
                Ok(Some(run)) => {
                    debug!(job_id = %run.job_id, status = %run.status, "Job pass finished");
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(subsystem = "jobs", component = "worker", error = %e, "Worker iteration failed");
                }
            }

            let wake = async {
                match &self.notify {
                    Some(notify) => notify.notified().await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Job worker received shutdown signal");
                    break;
                }
                _ = wake => {
                    debug!("Woken by enqueue");
                }
                _ = sleep(poll_interval) => {}
            }
        }

        self.orchestrator.emit(WorkerEvent::WorkerStopped);
        info!("Job worker stopped");
    }

    /// Process up to `limit` eligible jobs (the configured batch limit when
    /// `None`), pausing between jobs. Stops early when the queue runs dry.
    ///
    /// A storage error aborts the batch; jobs already finished stay recorded.
    pub async fn run_batch(&self, kind: Option<JobKind>, limit: Option<usize>) -> Result<BatchSummary> {
        let limit = limit.unwrap_or(self.config.batch_limit);
        let throttle = Duration::from_millis(self.config.throttle_ms);
        let mut summary = BatchSummary::default();

        while summary.runs.len() < limit {
            let Some(run) = self.orchestrator.run_once_for(kind).await? else {
                break;
            };
            summary.runs.push(run);
            if summary.runs.len() < limit && !throttle.is_zero() {
                sleep(throttle).await;
            }
        }

        info!(
            subsystem = "jobs",
            component = "worker",
            op = "batch",
            processed = summary.runs.len(),
            succeeded = summary.succeeded(),
            failed = summary.failed(),
            failed_items = summary.failed_items(),
            "Batch finished"
        );
        Ok(summary)
    }
}

/// Builder for creating a job worker with processors.
pub struct WorkerBuilder {
    store: Arc<dyn JobStore>,
    config: WorkerConfig,
    processors: Vec<Arc<dyn ItemProcessor>>,
    attacher: Option<RecordAttacher>,
    notify: Option<Arc<Notify>>,
}

impl WorkerBuilder {
    /// Create a new worker builder.
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            config: WorkerConfig::default(),
            processors: Vec::new(),
            attacher: None,
            notify: None,
        }
    }

    /// Set the worker configuration.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a processor.
    pub fn with_processor(mut self, processor: Arc<dyn ItemProcessor>) -> Self {
        self.processors.push(processor);
        self
    }

    /// Add several processors.
    pub fn with_processors(mut self, processors: impl IntoIterator<Item = Arc<dyn ItemProcessor>>) -> Self {
        self.processors.extend(processors);
        self
    }

    /// Attach completed artifacts to host records.
    pub fn with_attacher(mut self, attacher: RecordAttacher) -> Self {
        self.attacher = Some(attacher);
        self
    }

    /// Wake the daemon when the store signals an enqueue.
    pub fn with_notify(mut self, notify: Arc<Notify>) -> Self {
        self.notify = Some(notify);
        self
    }

    /// Build and return the worker.
    pub fn build(self) -> JobWorker {
        let mut orchestrator = Orchestrator::new(self.store).with_processors(self.processors);
        if let Some(attacher) = self.attacher {
            orchestrator = orchestrator.with_attacher(attacher);
        }
        let worker = JobWorker::new(orchestrator, self.config);
        match self.notify {
            Some(notify) => worker.with_notify(notify),
            None => worker,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KilnConfig;
    use crate::mock::MockToolRunner;
    use crate::processors::PdfMergeProcessor;
    use kiln_core::{JobOptions, JobStatus, NewJob};
    use kiln_db::memory::MemoryJobStore;

    fn merge_job(dir: &std::path::Path, name: &str) -> NewJob {
        let input = dir.join(format!("{name}.tif"));
        std::fs::write(&input, b"tiff").unwrap();
        NewJob::new(JobKind::PdfMerge, name)
            .with_source(input.to_string_lossy())
            .with_options(JobOptions {
                pdf_standard: "pdf".into(),
                ..JobOptions::default()
            })
    }

    fn worker(store: &MemoryJobStore, dir: &std::path::Path, config: WorkerConfig) -> JobWorker {
        let kiln = Arc::new(KilnConfig::default().with_root(dir));
        WorkerBuilder::new(Arc::new(store.clone()))
            .with_config(config)
            .with_processor(Arc::new(PdfMergeProcessor::new(
                kiln,
                Arc::new(MockToolRunner::new()),
            )))
            .with_notify(store.job_notify())
            .build()
    }

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.poll_interval_ms, 5000);
        assert_eq!(config.batch_limit, 10);
        assert_eq!(config.throttle_ms, 500);
        assert!(config.enabled);
        assert_eq!(config.stale_after(), Duration::from_secs(600));
    }

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfig::default()
            .with_poll_interval(1000)
            .with_batch_limit(0)
            .with_throttle(0)
            .with_enabled(false)
            .with_stale_after(30);

        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.batch_limit, 1);
        assert_eq!(config.throttle_ms, 0);
        assert!(!config.enabled);
        assert_eq!(config.stale_after_secs, 30);
    }

    #[test]
    fn test_batch_summary_counts() {
        let summary = BatchSummary::default();
        assert!(summary.is_clean());
        assert_eq!(summary.failed(), 0);
    }

    #[tokio::test]
    async fn test_run_batch_respects_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryJobStore::new();
        for name in ["a", "b", "c"] {
            store.enqueue(merge_job(dir.path(), name)).await.unwrap();
        }
        let worker = worker(&store, dir.path(), WorkerConfig::default().with_throttle(0));

        let summary = worker.run_batch(None, Some(2)).await.unwrap();
        assert_eq!(summary.runs.len(), 2);
        assert_eq!(summary.succeeded(), 2);
        assert_eq!(summary.runs[0].name, "a");

        let rest = worker.run_batch(None, None).await.unwrap();
        assert_eq!(rest.runs.len(), 1);
        assert!(worker.run_batch(None, None).await.unwrap().runs.is_empty());
    }

    #[tokio::test]
    async fn test_run_batch_kind_filter() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryJobStore::new();
        store.enqueue(merge_job(dir.path(), "a")).await.unwrap();
        let worker = worker(&store, dir.path(), WorkerConfig::default().with_throttle(0));

        let summary = worker
            .run_batch(Some(JobKind::CoverFetch), None)
            .await
            .unwrap();
        assert!(summary.runs.is_empty());
    }

    #[tokio::test]
    async fn test_daemon_wakes_on_enqueue_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryJobStore::new();
        let worker = worker(&store, dir.path(), WorkerConfig::default().with_poll_interval(60_000));
        let handle = worker.start();
        let mut events = handle.events();

        // Let the daemon reach its idle wait before enqueueing.
        sleep(Duration::from_millis(50)).await;
        let id = store.enqueue(merge_job(dir.path(), "late")).await.unwrap();

        let completed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(WorkerEvent::JobCompleted { job_id, .. }) = events.recv().await {
                    break job_id;
                }
            }
        })
        .await
        .expect("job completed before the poll interval");
        assert_eq!(completed, id);
        assert_eq!(
            store.get(id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );

        handle.shutdown_and_wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_batch_with_failed_item_is_not_clean() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryJobStore::new();
        let job = merge_job(dir.path(), "a").with_source(dir.path().join("gone.tif").to_string_lossy());
        store.enqueue(job).await.unwrap();
        let worker = worker(&store, dir.path(), WorkerConfig::default().with_throttle(0));

        let summary = worker.run_batch(None, None).await.unwrap();
        assert_eq!(summary.succeeded(), 1);
        assert_eq!(summary.failed(), 0);
        assert_eq!(summary.failed_items(), 1);
        assert!(!summary.is_clean());
    }

    #[tokio::test]
    async fn test_daemon_recovers_stale_job_on_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryJobStore::new();
        let id = store.enqueue(merge_job(dir.path(), "orphan")).await.unwrap();
        store.claim_next().await.unwrap().unwrap();
        store.backdate(id, chrono::Duration::hours(1)).unwrap();

        let worker = worker(&store, dir.path(), WorkerConfig::default().with_stale_after(60));
        let mut events = worker.events();
        let handle = worker.start();

        let completed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(WorkerEvent::JobCompleted { job_id, .. }) = events.recv().await {
                    break job_id;
                }
            }
        })
        .await
        .expect("recovered job completed");
        assert_eq!(completed, id);
        assert_eq!(store.get(id).await.unwrap().unwrap().attempts, 2);

        handle.shutdown_and_wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_worker_exits_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryJobStore::new();
        let worker = worker(&store, dir.path(), WorkerConfig::default().with_enabled(false));
        let handle = worker.start();
        tokio::time::timeout(Duration::from_secs(1), handle.task)
            .await
            .expect("disabled worker returns")
            .unwrap();
    }
}
