//! Item processor contract: what a job kind receives and what it reports.

use std::path::PathBuf;

use async_trait::async_trait;
use uuid::Uuid;

use kiln_core::{ItemStatus, Job, JobItem, JobKind, JobOptions, Result};

/// Progress callback type for processors.
pub type ProgressCallback = Box<dyn Fn(i32, Option<&str>) + Send + Sync>;

/// Context provided to item processors.
pub struct JobContext {
    /// The claimed job.
    pub job: Job,
    /// Items in ordinal order.
    pub items: Vec<JobItem>,
    /// Typed view of `job.options`.
    pub options: JobOptions,
    progress_callback: Option<ProgressCallback>,
}

impl JobContext {
    /// Create a new job context from the job's already parsed options.
    pub fn new(job: Job, mut items: Vec<JobItem>, options: JobOptions) -> Self {
        items.sort_by_key(|i| i.ordinal);
        Self {
            job,
            items,
            options,
            progress_callback: None,
        }
    }

    /// Set the progress callback.
    pub fn with_progress_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(i32, Option<&str>) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
        self
    }

    /// Report progress to the callback.
    pub fn report_progress(&self, percent: i32, message: Option<&str>) {
        if let Some(ref callback) = self.progress_callback {
            callback(percent, message);
        }
    }

    /// Report progress after `done` of `total` units.
    pub fn report_step(&self, done: usize, total: usize, message: &str) {
        let percent = if total == 0 {
            100
        } else {
            ((done * 100) / total) as i32
        };
        self.report_progress(percent, Some(message));
    }

    pub fn job_id(&self) -> Uuid {
        self.job.id
    }
}

/// Per-item result, in the order the items were processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemResult {
    pub item_id: Uuid,
    pub ordinal: i32,
    pub status: ItemStatus,
    pub error: Option<String>,
}

impl ItemResult {
    /// Item handled successfully.
    pub fn processed(item: &JobItem) -> Self {
        Self {
            item_id: item.id,
            ordinal: item.ordinal,
            status: ItemStatus::Processed,
            error: None,
        }
    }

    /// Item failed with a reason.
    pub fn failed(item: &JobItem, reason: impl Into<String>) -> Self {
        Self {
            item_id: item.id,
            ordinal: item.ordinal,
            status: ItemStatus::Failed,
            error: Some(reason.into()),
        }
    }

    pub fn is_processed(&self) -> bool {
        self.status == ItemStatus::Processed
    }
}

/// The artifact a successful job produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Output file, or output directory for multi-file results.
    pub path: PathBuf,
    /// MIME type when the artifact is a single attachable file.
    pub mime_type: Option<String>,
    /// Units actually produced (pages, angles, images).
    pub produced: u32,
    /// Units that were expected.
    pub expected: u32,
}

impl Artifact {
    /// `produced/expected`, e.g. `4/6`.
    pub fn summary(&self) -> String {
        format!("{}/{}", self.produced, self.expected)
    }

    /// Whether fewer units were produced than expected.
    pub fn is_partial(&self) -> bool {
        self.produced < self.expected
    }
}

/// Overall outcome of a processor run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed(Artifact),
    Failed { reason: String, retryable: bool },
}

impl ProcessOutcome {
    /// Failure that another attempt cannot fix.
    pub fn fatal(reason: impl Into<String>) -> Self {
        ProcessOutcome::Failed {
            reason: reason.into(),
            retryable: false,
        }
    }

    /// Failure worth another attempt.
    pub fn retryable(reason: impl Into<String>) -> Self {
        ProcessOutcome::Failed {
            reason: reason.into(),
            retryable: true,
        }
    }
}

/// What a processor hands back to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessReport {
    pub items: Vec<ItemResult>,
    pub outcome: ProcessOutcome,
    /// Lines appended to the job's notes.
    pub notes: Vec<String>,
}

impl ProcessReport {
    /// Report with no item results yet.
    pub fn new(outcome: ProcessOutcome) -> Self {
        Self {
            items: Vec::new(),
            outcome,
            notes: Vec::new(),
        }
    }

    pub fn with_items(mut self, items: Vec<ItemResult>) -> Self {
        self.items = items;
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    /// Number of items marked processed.
    pub fn processed_count(&self) -> usize {
        self.items.iter().filter(|i| i.is_processed()).count()
    }

    /// Number of items marked failed.
    pub fn failed_count(&self) -> usize {
        self.items
            .iter()
            .filter(|i| i.status == ItemStatus::Failed)
            .count()
    }
}

/// Unit of work for one job kind.
#[async_trait]
pub trait ItemProcessor: Send + Sync {
    /// The job kind this processor handles.
    fn kind(&self) -> JobKind;

    /// Process all items of a claimed job.
    ///
    /// `Err` means the processor itself could not run (I/O, storage); the
    /// orchestrator treats it as a retryable failure.
    async fn process(&self, ctx: &JobContext) -> Result<ProcessReport>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::Utc;
    use kiln_core::JobStatus;
    use serde_json::json;

    use super::*;

    /// Build a processing job with items for processor unit tests.
    pub fn context(kind: JobKind, sources: &[&str], options: JobOptions) -> JobContext {
        let job_id = Uuid::now_v7();
        let job = Job {
            id: job_id,
            name: "Minute book 1921".to_string(),
            kind,
            status: JobStatus::Processing,
            attempts: 1,
            max_attempts: 3,
            record_id: Some(42),
            options: serde_json::to_value(&options).unwrap_or_else(|_| json!({})),
            error_message: None,
            output_ref: None,
            output_object_id: None,
            total_items: sources.len() as i32,
            processed_items: 0,
            notes: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
        };
        let items = sources
            .iter()
            .enumerate()
            .map(|(i, s)| JobItem {
                id: Uuid::now_v7(),
                job_id,
                ordinal: i as i32,
                source: s.to_string(),
                status: ItemStatus::Pending,
                error_message: None,
            })
            .collect();
        JobContext::new(job, items, options)
    }
}
