//! kiln: archive job worker.
//!
//! Runs queued PDF merge, 3D render and cover fetch jobs, either as a
//! long-running daemon (`kiln worker`) or as a bounded batch (`kiln run`).

mod commands;
mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use uuid::Uuid;

use kiln_core::{JobKind, JobStatus};

#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about = "Archive job worker: PDF merge, 3D renders, book covers")]
#[command(propagate_version = true)]
pub struct Cli {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL", default_value = "postgres://localhost/archive")]
    pub database_url: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the worker daemon until interrupted
    Worker,

    /// Process queued jobs once and exit
    Run(RunArgs),

    /// Queue a new job
    Enqueue(EnqueueArgs),

    /// Show queue statistics
    Stats,

    /// List jobs, newest first
    List {
        /// Only jobs with this status
        #[arg(long)]
        status: Option<JobStatus>,

        /// Only jobs of this kind
        #[arg(long)]
        kind: Option<JobKind>,

        /// Maximum number of jobs to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Delete finished jobs older than the retention window
    Cleanup {
        /// Retention window in hours
        #[arg(long, default_value_t = kiln_core::defaults::JOB_RETENTION_HOURS)]
        hours: i64,
    },

    /// Return jobs stuck in `processing` (worker died) to the queue
    Recover {
        /// Idle time after which a processing job counts as abandoned
        /// (default: JOB_STALE_AFTER_SECS)
        #[arg(long)]
        secs: Option<u64>,
    },

    /// Apply pending database migrations
    Migrate,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Process only this job
    #[arg(long)]
    pub id: Option<Uuid>,

    /// Rerun the job even if it already completed or failed (requires --id)
    #[arg(long, requires = "id")]
    pub force: bool,

    /// List what would be processed without running anything
    #[arg(long)]
    pub dry_run: bool,

    /// Only process jobs of this kind
    #[arg(long)]
    pub kind: Option<JobKind>,

    /// Maximum number of jobs to process (default: JOB_BATCH_LIMIT)
    #[arg(long)]
    pub limit: Option<usize>,
}

#[derive(Args, Debug)]
pub struct EnqueueArgs {
    /// Job kind: pdf_merge, model_render or cover_fetch
    #[arg(long)]
    pub kind: JobKind,

    /// Human-readable job name (also the PDF file name)
    #[arg(long)]
    pub name: String,

    /// Host record to attach the result to
    #[arg(long)]
    pub record: Option<i64>,

    /// pdf, pdfa-1b, pdfa-2b or pdfa-3b
    #[arg(long)]
    pub pdf_standard: Option<String>,

    /// ImageMagick quality
    #[arg(long)]
    pub quality: Option<u32>,

    /// ImageMagick density
    #[arg(long)]
    pub dpi: Option<u32>,

    /// Render width for 3D jobs
    #[arg(long)]
    pub width: Option<u32>,

    /// Render height for 3D jobs
    #[arg(long)]
    pub height: Option<u32>,

    /// Keep the artifact local instead of attaching it to the record
    #[arg(long)]
    pub no_attach: bool,

    /// Attempts before the job fails for good
    #[arg(long)]
    pub max_attempts: Option<i32>,

    /// Inputs in order: image or model paths, or ISBNs for cover jobs
    #[arg(required = true, num_args = 1..)]
    pub sources: Vec<String>,
}

impl EnqueueArgs {
    /// Absolute paths for file inputs; ISBNs are kept verbatim.
    pub fn resolved_sources(&self) -> Vec<String> {
        if self.kind == JobKind::CoverFetch {
            return self.sources.clone();
        }
        self.sources
            .iter()
            .map(|s| {
                let path = PathBuf::from(s);
                if path.is_absolute() {
                    s.clone()
                } else {
                    std::env::current_dir()
                        .map(|cwd| cwd.join(&path).to_string_lossy().into_owned())
                        .unwrap_or_else(|_| s.clone())
                }
            })
            .collect()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _log_guard = logging::init();

    commands::dispatch(cli).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_flags() {
        let cli = Cli::try_parse_from([
            "kiln", "run", "--kind", "model-render", "--limit", "3", "--dry-run",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.kind, Some(JobKind::ModelRender));
        assert_eq!(args.limit, Some(3));
        assert!(args.dry_run);
        assert!(!args.force);
    }

    #[test]
    fn test_force_requires_id() {
        assert!(Cli::try_parse_from(["kiln", "run", "--force"]).is_err());
        let id = Uuid::now_v7().to_string();
        assert!(Cli::try_parse_from(["kiln", "run", "--force", "--id", &id]).is_ok());
    }

    #[test]
    fn test_parse_enqueue_keeps_source_order() {
        let cli = Cli::try_parse_from([
            "kiln", "enqueue", "--kind", "pdf_merge", "--name", "Minutes", "--record", "12",
            "/s/3.tif", "/s/1.tif", "/s/2.tif",
        ])
        .unwrap();
        let Commands::Enqueue(args) = cli.command else {
            panic!("expected enqueue");
        };
        assert_eq!(args.record, Some(12));
        assert_eq!(args.resolved_sources(), vec!["/s/3.tif", "/s/1.tif", "/s/2.tif"]);
    }

    #[test]
    fn test_cover_sources_are_not_paths() {
        let cli = Cli::try_parse_from([
            "kiln", "enqueue", "--kind", "cover_fetch", "--name", "Cover", "978-0-14-044913-6",
        ])
        .unwrap();
        let Commands::Enqueue(args) = cli.command else {
            panic!("expected enqueue");
        };
        assert_eq!(args.resolved_sources(), vec!["978-0-14-044913-6"]);
    }

    #[test]
    fn test_parse_recover() {
        let cli = Cli::try_parse_from(["kiln", "recover", "--secs", "900"]).unwrap();
        assert!(matches!(cli.command, Commands::Recover { secs: Some(900) }));
        let cli = Cli::try_parse_from(["kiln", "recover"]).unwrap();
        assert!(matches!(cli.command, Commands::Recover { secs: None }));
    }

    #[test]
    fn test_cleanup_default_hours() {
        let cli = Cli::try_parse_from(["kiln", "cleanup"]).unwrap();
        assert!(matches!(cli.command, Commands::Cleanup { hours: 24 }));
    }
}
