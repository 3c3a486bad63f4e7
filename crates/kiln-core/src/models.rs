//! Data models for the job queue and the host record store.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::defaults;
use crate::error::Error;

// =============================================================================
// JOB TYPES
// =============================================================================

/// Status of a job in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Database / wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Completed and failed jobs are never claimed again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(Error::InvalidInput(format!("unknown job status: {other}"))),
        }
    }
}

/// Kind of work a job performs. Each kind has exactly one item processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Merge ordered images into one (PDF or PDF/A) document.
    PdfMerge,
    /// Render fixed camera angles of 3D models with Blender.
    ModelRender,
    /// Download a book cover by ISBN and attach it to a record.
    CoverFetch,
}

impl JobKind {
    /// All kinds, in registration order.
    pub const ALL: [JobKind; 3] = [JobKind::PdfMerge, JobKind::ModelRender, JobKind::CoverFetch];

    /// Database / wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::PdfMerge => "pdf_merge",
            JobKind::ModelRender => "model_render",
            JobKind::CoverFetch => "cover_fetch",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pdf_merge" | "pdf-merge" => Ok(JobKind::PdfMerge),
            "model_render" | "model-render" => Ok(JobKind::ModelRender),
            "cover_fetch" | "cover-fetch" => Ok(JobKind::CoverFetch),
            other => Err(Error::InvalidInput(format!("unknown job kind: {other}"))),
        }
    }
}

/// A job in the processing queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    /// Optional link to a host-application record.
    pub record_id: Option<i64>,
    /// Kind-specific options, see [`JobOptions`].
    pub options: JsonValue,
    pub error_message: Option<String>,
    /// Path of the output artifact once completed.
    pub output_ref: Option<String>,
    /// Host digital-object id once the artifact was attached.
    pub output_object_id: Option<i64>,
    pub total_items: i32,
    pub processed_items: i32,
    /// Advisory progress trail; never used for control flow.
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Parse the typed view of this job's options. Unknown keys are ignored and
    /// missing keys take their defaults; a present key of the wrong type is an
    /// error.
    pub fn typed_options(&self) -> Result<JobOptions, Error> {
        serde_json::from_value(self.options.clone())
            .map_err(|e| Error::InvalidOptions(e.to_string()))
    }

    /// Whether another claim is allowed after a retryable failure.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Kind-specific job options stored as JSON on the job row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    /// `pdf`, `pdfa-1b`, `pdfa-2b` or `pdfa-3b`.
    pub pdf_standard: String,
    /// ImageMagick `-quality`.
    pub compression_quality: u32,
    /// ImageMagick `-density`.
    pub dpi: u32,
    /// Copy the artifact into the host upload tree and register it.
    pub attach_to_record: bool,
    /// Render width for 3D jobs.
    pub render_width: u32,
    /// Render height for 3D jobs.
    pub render_height: u32,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            pdf_standard: defaults::PDF_STANDARD.to_string(),
            compression_quality: defaults::PDF_QUALITY,
            dpi: defaults::PDF_DPI,
            attach_to_record: true,
            render_width: defaults::RENDER_WIDTH,
            render_height: defaults::RENDER_HEIGHT,
        }
    }
}

impl JobOptions {
    /// PDF/A conformance level (`1`, `2`, `3`) when a PDF/A standard is requested.
    pub fn pdfa_level(&self) -> Option<&'static str> {
        match self.pdf_standard.as_str() {
            "pdfa-1b" => Some("1"),
            "pdfa-3b" => Some("3"),
            s if s.starts_with("pdfa") => Some("2"),
            _ => None,
        }
    }
}

/// Status of a single job item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Processed,
    Failed,
}

impl ItemStatus {
    /// Database / wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Processed => "processed",
            ItemStatus::Failed => "failed",
        }
    }
}

impl FromStr for ItemStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ItemStatus::Pending),
            "processed" => Ok(ItemStatus::Processed),
            "failed" => Ok(ItemStatus::Failed),
            other => Err(Error::InvalidInput(format!("unknown item status: {other}"))),
        }
    }
}

/// One ordered input of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobItem {
    pub id: Uuid,
    pub job_id: Uuid,
    /// 0-based position; defines output composition order.
    pub ordinal: i32,
    /// Input file path, or a remote identifier (ISBN) for cover jobs.
    pub source: String,
    pub status: ItemStatus,
    pub error_message: Option<String>,
}

/// Request to enqueue a job with its ordered inputs.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub kind: JobKind,
    pub record_id: Option<i64>,
    pub options: JobOptions,
    pub max_attempts: i32,
    /// Item sources in ordinal order.
    pub sources: Vec<String>,
}

impl NewJob {
    /// Create a job request with default options and attempt ceiling.
    pub fn new(kind: JobKind, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            record_id: None,
            options: JobOptions::default(),
            max_attempts: defaults::JOB_MAX_ATTEMPTS,
            sources: Vec::new(),
        }
    }

    /// Append one input; its ordinal is its position.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.sources.push(source.into());
        self
    }

    /// Replace all inputs.
    pub fn with_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources = sources.into_iter().map(Into::into).collect();
        self
    }

    /// Link the job to a host record.
    pub fn with_record(mut self, record_id: i64) -> Self {
        self.record_id = Some(record_id);
        self
    }

    /// Set the options.
    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the attempt ceiling (at least one).
    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

/// Output recorded when a job completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutput {
    pub output_ref: PathBuf,
    pub processed_items: i32,
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub kind: Option<JobKind>,
    pub limit: i64,
    pub offset: i64,
}

/// Queue statistics summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total_jobs: i64,
    pub queued: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub total_items: i64,
}

/// Outcome of recovering `processing` jobs abandoned by a dead worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaleRecovery {
    /// Put back to `queued` (attempts left).
    pub requeued: u64,
    /// Moved to terminal `failed` (attempts exhausted).
    pub failed: u64,
}

impl StaleRecovery {
    pub fn total(&self) -> u64 {
        self.requeued + self.failed
    }
}

// =============================================================================
// HOST RECORDS
// =============================================================================

/// A record of the host application that artifacts can be attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRecord {
    pub id: i64,
    pub slug: Option<String>,
}

impl HostRecord {
    /// Upload directory key: the slug, or the zero-padded id when the record has none.
    pub fn path_key(&self) -> String {
        match &self.slug {
            Some(slug) if !slug.is_empty() => slug.clone(),
            _ => format!("{:010}", self.id),
        }
    }
}

/// How a digital object is used by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageKind {
    Master,
    Reference,
    Thumbnail,
}

impl UsageKind {
    /// Host taxonomy term id for this usage.
    pub fn term_id(&self) -> i32 {
        match self {
            UsageKind::Thumbnail => 137,
            UsageKind::Reference => 141,
            UsageKind::Master => 142,
        }
    }
}

/// Digital-object row inserted into the host store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDigitalObject {
    /// Master object this rendition derives from.
    pub parent_id: Option<i64>,
    /// Host record the master belongs to.
    pub record_id: Option<i64>,
    pub usage: UsageKind,
    pub mime_type: String,
    pub byte_size: i64,
    /// md5 hex digest.
    pub checksum: Option<String>,
    pub name: String,
    /// Path relative to the upload root.
    pub path: String,
    pub sequence: i32,
}
