//! # kiln-jobs
//!
//! Job processing for the kiln worker.
//!
//! This crate provides:
//! - Adapters for external tools (ImageMagick, Ghostscript, Blender) and HTTP
//! - One item processor per job kind (PDF merge, 3D render, cover fetch)
//! - Attaching finished artifacts to host records, with derivatives
//! - The orchestrator state machine and the daemon/batch worker
//! - Progress notifications via broadcast channels
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use kiln_db::{Database, PoolConfig};
//! use kiln_jobs::{processors, KilnConfig, ProcessRunner, ReqwestFetcher, WorkerBuilder, WorkerConfig};
//!
//! let db = Database::connect_with_config("postgres://...", PoolConfig::from_env()).await?;
//! let config = Arc::new(KilnConfig::from_env());
//! let runner = Arc::new(ProcessRunner::new());
//! let host = Arc::new(db.host.clone());
//! let fetcher = Arc::new(ReqwestFetcher::new(config.http_timeout)?);
//!
//! let worker = WorkerBuilder::new(Arc::new(db.jobs.clone()))
//!     .with_config(WorkerConfig::from_env())
//!     .with_processors(processors::standard_processors(config, runner, host, fetcher))
//!     .with_notify(db.jobs.job_notify())
//!     .build();
//!
//! let handle = worker.start();
//! let mut events = handle.events();
//! while let Ok(event) = events.recv().await {
//!     println!("Event: {:?}", event);
//! }
//! handle.shutdown().await?;
//! ```

pub mod attach;
pub mod config;
pub mod handler;
// Mock tool runner and HTTP fetcher for testing
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod orchestrator;
pub mod processors;
pub mod tools;
pub mod worker;

// Re-export core types
pub use kiln_core::*;

pub use attach::{AttachOutcome, RecordAttacher};
pub use config::KilnConfig;
pub use handler::{
    Artifact, ItemProcessor, ItemResult, JobContext, ProcessOutcome, ProcessReport,
};
pub use orchestrator::{JobRun, Orchestrator};
pub use processors::{CoverFetchProcessor, ModelRenderProcessor, PdfMergeProcessor};
pub use tools::{
    HttpFetcher, HttpOutcome, ProcessRunner, ReqwestFetcher, ToolInvocation, ToolOutput,
    ToolRunner,
};
pub use worker::{BatchSummary, JobWorker, WorkerBuilder, WorkerConfig, WorkerEvent, WorkerHandle};
