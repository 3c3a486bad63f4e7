//! Merge ordered images into one PDF, optionally PDF/A.
//!
//! Pipeline:
//! 1. Drop items whose file is missing (item failure, job continues)
//! 2. One ImageMagick call with every remaining input in ordinal order
//! 3. For PDF/A standards, convert the intermediate with Ghostscript; on
//!    Ghostscript failure keep the plain PDF

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use kiln_core::defaults::PDF_FALLBACK_NAME;
use kiln_core::{JobKind, Result};

use crate::config::KilnConfig;
use crate::handler::{
    Artifact, ItemProcessor, ItemResult, JobContext, ProcessOutcome, ProcessReport,
};
use crate::tools::{is_nonempty_file, ToolInvocation, ToolRunner};

pub const PDF_MIME: &str = "application/pdf";

/// Make a job name safe to use as a file stem.
///
/// Only the last `/`-separated component is kept. Anything outside `[A-Za-z0-9_.-]` becomes `_`, runs of `_` collapse, and
/// leading/trailing `_` are trimmed. An empty result falls back to
/// `merged_document`.
pub fn sanitize_filename(name: &str) -> String {
    let base = name
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();
    let mut out = String::with_capacity(base.len());
    for c in base.chars() {
        let c = if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
            c
        } else {
            '_'
        };
        if c == '_' && out.ends_with('_') {
            continue;
        }
        out.push(c);
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        PDF_FALLBACK_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}

pub struct PdfMergeProcessor {
    config: Arc<KilnConfig>,
    runner: Arc<dyn ToolRunner>,
}

impl PdfMergeProcessor {
    pub fn new(config: Arc<KilnConfig>, runner: Arc<dyn ToolRunner>) -> Self {
        Self { config, runner }
    }

    fn convert_invocation(&self, ctx: &JobContext, inputs: &[&str], output: &Path) -> ToolInvocation {
        ToolInvocation::new(&self.config.convert_path, self.config.tool_timeout)
            .arg("-quality")
            .arg(ctx.options.compression_quality.to_string())
            .arg("-density")
            .arg(ctx.options.dpi.to_string())
            .args(inputs.iter().copied())
            .arg(output.as_os_str())
            .expect_output(output)
    }

    fn pdfa_invocation(&self, level: &str, input: &Path, output: &Path) -> ToolInvocation {
        let mut output_arg = std::ffi::OsString::from("-sOutputFile=");
        output_arg.push(output.as_os_str());
        ToolInvocation::new(&self.config.ghostscript_path, self.config.tool_timeout)
            .arg(format!("-dPDFA={level}"))
            .args([
                "-dBATCH",
                "-dNOPAUSE",
                "-dNOOUTERSAVE",
                "-sProcessColorModel=DeviceRGB",
                "-sDEVICE=pdfwrite",
                "-dPDFACompatibilityPolicy=1",
            ])
            .arg(output_arg)
            .arg(input.as_os_str())
            .expect_output(output)
    }
}

#[async_trait]
impl ItemProcessor for PdfMergeProcessor {
    fn kind(&self) -> JobKind {
        JobKind::PdfMerge
    }

    async fn process(&self, ctx: &JobContext) -> Result<ProcessReport> {
        let job_id = ctx.job_id();
        let mut results = Vec::with_capacity(ctx.items.len());
        let mut valid = Vec::with_capacity(ctx.items.len());

        for item in &ctx.items {
            if is_nonempty_file(Path::new(&item.source)).await {
                valid.push(item);
            } else {
                debug!(%job_id, source = %item.source, "Merge input missing");
                results.push(ItemResult::failed(
                    item,
                    format!("file not found: {}", item.source),
                ));
            }
        }

        if valid.is_empty() {
            return Ok(ProcessReport::new(ProcessOutcome::fatal("No valid input files"))
                .with_items(results));
        }

        let work_dir = self.config.job_work_dir(job_id);
        tokio::fs::create_dir_all(&work_dir).await?;

        let stem = sanitize_filename(&ctx.job.name);
        let final_path = work_dir.join(format!("{stem}.pdf"));
        let pdfa_level = ctx.options.pdfa_level();
        let merge_path: PathBuf = if pdfa_level.is_some() {
            work_dir.join(format!("{stem}_temp.pdf"))
        } else {
            final_path.clone()
        };

        let sources: Vec<&str> = valid.iter().map(|i| i.source.as_str()).collect();
        ctx.report_progress(10, Some("Merging images"));

        let convert = self.convert_invocation(ctx, &sources, &merge_path);
        let output = self.runner.run(&convert).await?;
        if !output.success || !is_nonempty_file(&merge_path).await {
            let reason = if output.success {
                "convert produced no output".to_string()
            } else {
                output.failure_reason("convert")
            };
            warn!(%job_id, %reason, "PDF merge failed");
            // Inputs stay pending so a retry processes them again.
            return Ok(ProcessReport::new(ProcessOutcome::retryable(reason)).with_items(results));
        }

        let mut report_notes = vec![format!("Merged {} page(s)", valid.len())];

        if let Some(level) = pdfa_level {
            ctx.report_progress(60, Some("Converting to PDF/A"));
            let gs = self.pdfa_invocation(level, &merge_path, &final_path);
            let gs_output = self.runner.run(&gs).await?;
            if gs_output.success && is_nonempty_file(&final_path).await {
                let _ = tokio::fs::remove_file(&merge_path).await;
                report_notes.push(format!("Converted to PDF/A-{level}b"));
            } else {
                warn!(
                    %job_id,
                    reason = %gs_output.failure_reason("gs"),
                    "PDF/A conversion failed, keeping plain PDF"
                );
                tokio::fs::rename(&merge_path, &final_path).await?;
                report_notes.push("PDF/A conversion failed, kept plain PDF".to_string());
            }
        }

        results.extend(valid.iter().map(|item| ItemResult::processed(item)));
        results.sort_by_key(|r| r.ordinal);

        info!(
            %job_id,
            pages = valid.len(),
            output = %final_path.display(),
            "PDF merge finished"
        );
        ctx.report_progress(100, Some("Merged"));

        let artifact = Artifact {
            path: final_path,
            mime_type: Some(PDF_MIME.to_string()),
            produced: valid.len() as u32,
            expected: ctx.items.len() as u32,
        };
        let mut report = ProcessReport::new(ProcessOutcome::Completed(artifact)).with_items(results);
        report.notes = report_notes;
        Ok(report)
    }
}
