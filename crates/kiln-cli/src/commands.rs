//! Subcommand implementations.
//!
//! Job outcomes are printed to stdout, one line per job, prefixed with
//! `OK`, `FAILED`, `SKIP` or `ERROR`. Diagnostics go through tracing.
//! Batch runs exit non-zero when any job or any item failed.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;
use uuid::Uuid;

use kiln_core::{HostRecordStore, Job, JobFilter, JobOptions, JobStatus, JobStore, NewJob};
use kiln_db::{log_pool_metrics, Database, PoolConfig};
use kiln_jobs::processors::standard_processors;
use kiln_jobs::{
    BatchSummary, HttpFetcher, JobRun, JobWorker, KilnConfig, Orchestrator, ProcessRunner,
    RecordAttacher, ReqwestFetcher, ToolRunner, WorkerBuilder, WorkerConfig,
};

use crate::{Cli, Commands, EnqueueArgs, RunArgs};

/// Upper bound of queued jobs scanned for a dry run.
const DRY_RUN_SCAN_LIMIT: i64 = 1000;

/// How often the daemon logs connection pool health.
const POOL_METRICS_INTERVAL: Duration = Duration::from_secs(60);

pub async fn dispatch(cli: Cli) -> anyhow::Result<ExitCode> {
    let db = Database::connect_with_config(&cli.database_url, PoolConfig::from_env())
        .await
        .context("connecting to database")?;

    match cli.command {
        Commands::Worker => worker(&db).await,
        Commands::Run(args) => run(&db, &args).await,
        Commands::Enqueue(args) => enqueue(&db, &args).await,
        Commands::Stats => stats(&db).await,
        Commands::List {
            status,
            kind,
            limit,
        } => list(&db, status, kind, limit).await,
        Commands::Cleanup { hours } => cleanup(&db, hours).await,
        Commands::Recover { secs } => recover(&db, secs).await,
        Commands::Migrate => {
            db.migrate().await.context("running migrations")?;
            println!("Migrations applied");
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Wire the production adapters into a worker.
fn build_worker(db: &Database, config: Arc<KilnConfig>) -> anyhow::Result<JobWorker> {
    let runner: Arc<dyn ToolRunner> = Arc::new(ProcessRunner::new());
    let host: Arc<dyn HostRecordStore> = Arc::new(db.host.clone());
    let fetcher: Arc<dyn HttpFetcher> =
        Arc::new(ReqwestFetcher::new(config.http_timeout).context("building HTTP client")?);

    let attacher = RecordAttacher::new(config.clone(), host.clone(), runner.clone());

    Ok(WorkerBuilder::new(Arc::new(db.jobs.clone()))
        .with_config(WorkerConfig::from_env())
        .with_processors(standard_processors(config, runner, host, fetcher))
        .with_attacher(attacher)
        .with_notify(db.jobs.job_notify())
        .build())
}

async fn worker(db: &Database) -> anyhow::Result<ExitCode> {
    let worker = build_worker(db, Arc::new(KilnConfig::from_env()))?;
    if !worker.config().enabled {
        println!("Job worker disabled (JOB_WORKER_ENABLED)");
        return Ok(ExitCode::SUCCESS);
    }

    let handle = worker.start();
    let mut metrics = tokio::time::interval(POOL_METRICS_INTERVAL);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            signal = &mut shutdown => {
                signal.context("waiting for shutdown signal")?;
                break;
            }
            _ = metrics.tick() => log_pool_metrics(&db.pool),
        }
    }
    info!("Shutdown requested");
    handle.shutdown_and_wait().await?;
    Ok(ExitCode::SUCCESS)
}

fn print_run(run: &JobRun) {
    let marker = if run.succeeded() { "OK" } else { "FAILED" };
    let mut line = format!(
        "{marker:<6} {} {} \"{}\" {}",
        run.job_id, run.kind, run.name, run.message
    );
    if let Some(output) = &run.output_ref {
        line.push_str(&format!(" -> {}", output.display()));
    }
    if run.status == JobStatus::Queued {
        line.push_str(" (will retry)");
    }
    if run.failed_items > 0 {
        line.push_str(&format!(" ({} item(s) failed)", run.failed_items));
    }
    println!("{line}");
    if let Some(error) = &run.attach_error {
        println!("       attach failed: {error}");
    }
}

/// Exit code 0 only when every job completed with all of its items.
fn print_summary(summary: &BatchSummary) -> ExitCode {
    println!(
        "Processed {} job(s): {} succeeded, {} failed, {} item(s) failed",
        summary.runs.len(),
        summary.succeeded(),
        summary.failed(),
        summary.failed_items()
    );
    if summary.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn run(db: &Database, args: &RunArgs) -> anyhow::Result<ExitCode> {
    if args.dry_run {
        return dry_run(db, args).await;
    }

    let worker = build_worker(db, Arc::new(KilnConfig::from_env()))?;

    if let Some(id) = args.id {
        return match worker.orchestrator().run_job(id, args.force).await {
            Ok(Some(run)) => {
                print_run(&run);
                Ok(print_summary(&BatchSummary { runs: vec![run] }))
            }
            Ok(None) => {
                let status = db
                    .jobs
                    .get(id)
                    .await?
                    .map(|j| j.status.to_string())
                    .unwrap_or_else(|| "missing".to_string());
                println!("SKIP   {id} is {status}; use --force to rerun");
                Ok(ExitCode::SUCCESS)
            }
            Err(e) => {
                println!("ERROR  {id}: {e}");
                Ok(ExitCode::FAILURE)
            }
        };
    }

    match worker.run_batch(args.kind, args.limit).await {
        Ok(summary) => {
            summary.runs.iter().for_each(print_run);
            Ok(print_summary(&summary))
        }
        Err(e) => {
            println!("ERROR  batch aborted: {e}");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn print_candidate(db: &Database, job: &Job) -> anyhow::Result<()> {
    println!(
        "WOULD RUN {} {} \"{}\" attempt {}/{}",
        job.id,
        job.kind,
        job.name,
        job.attempts + 1,
        job.max_attempts
    );
    for item in db.jobs.items(job.id).await? {
        println!("    [{}] {}", item.ordinal, item.source);
    }
    Ok(())
}

async fn dry_run(db: &Database, args: &RunArgs) -> anyhow::Result<ExitCode> {
    if let Some(id) = args.id {
        let Some(job) = db.jobs.get(id).await? else {
            println!("ERROR  {id}: job not found");
            return Ok(ExitCode::FAILURE);
        };
        let runnable = if args.force {
            job.status != JobStatus::Processing
        } else {
            job.status == JobStatus::Queued && job.has_attempts_left()
        };
        if runnable {
            print_candidate(db, &job).await?;
        } else {
            println!("SKIP   {id} is {}; use --force to rerun", job.status);
        }
        return Ok(ExitCode::SUCCESS);
    }

    let limit = args.limit.unwrap_or(WorkerConfig::from_env().batch_limit);
    let mut queued = db
        .jobs
        .list_filtered(&JobFilter {
            status: Some(JobStatus::Queued),
            kind: args.kind,
            limit: DRY_RUN_SCAN_LIMIT,
            offset: 0,
        })
        .await?;
    // Listed newest first; claims go oldest first.
    queued.reverse();

    let candidates: Vec<Job> = queued
        .into_iter()
        .filter(Job::has_attempts_left)
        .take(limit)
        .collect();
    for job in &candidates {
        print_candidate(db, job).await?;
    }
    println!("{} job(s) would be processed", candidates.len());
    Ok(ExitCode::SUCCESS)
}

async fn enqueue(db: &Database, args: &EnqueueArgs) -> anyhow::Result<ExitCode> {
    let config = KilnConfig::from_env();
    let defaults = JobOptions::default();
    let options = JobOptions {
        pdf_standard: args
            .pdf_standard
            .clone()
            .unwrap_or(defaults.pdf_standard),
        compression_quality: args.quality.unwrap_or(defaults.compression_quality),
        dpi: args.dpi.unwrap_or(defaults.dpi),
        attach_to_record: !args.no_attach,
        render_width: args.width.unwrap_or(defaults.render_width),
        render_height: args.height.unwrap_or(defaults.render_height),
    };

    let mut job = NewJob::new(args.kind, args.name.clone())
        .with_sources(args.resolved_sources())
        .with_options(options)
        .with_max_attempts(args.max_attempts.unwrap_or(config.max_attempts));
    if let Some(record) = args.record {
        job = job.with_record(record);
    }

    let id: Uuid = db.jobs.enqueue(job).await?;
    println!("Queued job {id}");
    Ok(ExitCode::SUCCESS)
}

async fn stats(db: &Database) -> anyhow::Result<ExitCode> {
    let stats = db.jobs.queue_stats().await?;
    println!("Jobs:       {}", stats.total_jobs);
    println!("  queued:     {}", stats.queued);
    println!("  processing: {}", stats.processing);
    println!("  completed:  {}", stats.completed);
    println!("  failed:     {}", stats.failed);
    println!("Items:      {}", stats.total_items);
    Ok(ExitCode::SUCCESS)
}

async fn list(
    db: &Database,
    status: Option<JobStatus>,
    kind: Option<kiln_core::JobKind>,
    limit: i64,
) -> anyhow::Result<ExitCode> {
    let jobs = db
        .jobs
        .list_filtered(&JobFilter {
            status,
            kind,
            limit,
            offset: 0,
        })
        .await?;

    for job in &jobs {
        println!(
            "{} {:<10} {:<12} {}/{} {:>3} item(s) \"{}\"{}",
            job.id,
            job.status.as_str(),
            job.kind.as_str(),
            job.attempts,
            job.max_attempts,
            job.total_items,
            job.name,
            job.error_message
                .as_deref()
                .map(|e| format!(" error: {e}"))
                .unwrap_or_default()
        );
    }
    println!("{} job(s)", jobs.len());
    Ok(ExitCode::SUCCESS)
}

async fn recover(db: &Database, secs: Option<u64>) -> anyhow::Result<ExitCode> {
    let secs = secs.unwrap_or_else(|| WorkerConfig::from_env().stale_after_secs);
    let orchestrator = Orchestrator::new(Arc::new(db.jobs.clone()));
    let recovery = orchestrator
        .recover_stale(Duration::from_secs(secs))
        .await?;
    println!(
        "Recovered {} stale job(s) idle more than {secs}s: {} requeued, {} failed",
        recovery.total(),
        recovery.requeued,
        recovery.failed
    );
    Ok(ExitCode::SUCCESS)
}

async fn cleanup(db: &Database, hours: i64) -> anyhow::Result<ExitCode> {
    let removed = db.jobs.cleanup(chrono::Duration::hours(hours.max(0))).await?;
    println!("Removed {removed} job(s) finished more than {hours} hour(s) ago");
    Ok(ExitCode::SUCCESS)
}
