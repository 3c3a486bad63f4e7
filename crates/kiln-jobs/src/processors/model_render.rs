//! Multi-angle renders of 3D models through headless Blender.
//!
//! Each item is one model file. Every model is rendered from the fixed set of
//! [`RENDER_ANGLES`] into `{render_dir}/{job_id}/{ordinal}/{angle}.png`.
//! A model counts as processed when at least one angle rendered.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use kiln_core::defaults::{MODEL_EXTENSIONS, RENDER_ANGLES};
use kiln_core::{JobKind, Result};

use crate::config::KilnConfig;
use crate::handler::{
    Artifact, ItemProcessor, ItemResult, JobContext, ProcessOutcome, ProcessReport,
};
use crate::tools::{is_nonempty_file, ToolInvocation, ToolRunner};

/// Lowercased extension when it is a supported model format.
pub fn model_extension(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    MODEL_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

pub struct ModelRenderProcessor {
    config: Arc<KilnConfig>,
    runner: Arc<dyn ToolRunner>,
}

impl ModelRenderProcessor {
    pub fn new(config: Arc<KilnConfig>, runner: Arc<dyn ToolRunner>) -> Self {
        Self { config, runner }
    }

    fn render_invocation(
        &self,
        ctx: &JobContext,
        model: &Path,
        angle: &str,
        output: &Path,
    ) -> ToolInvocation {
        ToolInvocation::new(&self.config.blender_path, self.config.tool_timeout)
            .args(["--background", "--factory-startup", "--python"])
            .arg(self.config.blender_script.as_os_str())
            .arg("--")
            .arg("--input")
            .arg(model.as_os_str())
            .arg("--output")
            .arg(output.as_os_str())
            .arg("--angle")
            .arg(angle)
            .arg("--width")
            .arg(ctx.options.render_width.to_string())
            .arg("--height")
            .arg(ctx.options.render_height.to_string())
            .expect_output(output)
    }

    /// Render every angle of one model, returning the angles that failed.
    async fn render_model(
        &self,
        ctx: &JobContext,
        model: &Path,
        out_dir: &Path,
        done_before: usize,
        total: usize,
    ) -> Result<Vec<(String, String)>> {
        tokio::fs::create_dir_all(out_dir).await?;
        let mut failures = Vec::new();

        for (i, angle) in RENDER_ANGLES.iter().enumerate() {
            let output = out_dir.join(format!("{angle}.png"));
            let invocation = self.render_invocation(ctx, model, angle, &output);
            let result = self.runner.run(&invocation).await?;

            if result.success && is_nonempty_file(&output).await {
                debug!(job_id = %ctx.job_id(), angle, "Rendered view");
            } else {
                let reason = if result.success {
                    "blender produced no output".to_string()
                } else {
                    result.failure_reason("blender")
                };
                warn!(job_id = %ctx.job_id(), angle, %reason, "View render failed");
                failures.push((angle.to_string(), reason));
            }
            ctx.report_step(done_before + i + 1, total, angle);
        }
        Ok(failures)
    }
}

#[async_trait]
impl ItemProcessor for ModelRenderProcessor {
    fn kind(&self) -> JobKind {
        JobKind::ModelRender
    }

    async fn process(&self, ctx: &JobContext) -> Result<ProcessReport> {
        let job_id = ctx.job_id();
        let job_dir = self.config.job_render_dir(job_id);
        let mut results = Vec::with_capacity(ctx.items.len());
        let mut notes = Vec::new();

        let mut models = Vec::new();
        for item in &ctx.items {
            let path = PathBuf::from(&item.source);
            if !is_nonempty_file(&path).await {
                results.push(ItemResult::failed(item, format!("file not found: {}", item.source)));
            } else if model_extension(&path).is_none() {
                results.push(ItemResult::failed(
                    item,
                    format!("unsupported model format: {}", item.source),
                ));
            } else {
                models.push((item, path));
            }
        }

        if models.is_empty() {
            return Ok(ProcessReport::new(ProcessOutcome::fatal("No valid input files"))
                .with_items(results));
        }

        let per_model = RENDER_ANGLES.len();
        let total = models.len() * per_model;
        let mut produced = 0usize;

        for (index, (item, path)) in models.iter().enumerate() {
            let out_dir = job_dir.join(item.ordinal.to_string());
            let failures = self
                .render_model(ctx, path, &out_dir, index * per_model, total)
                .await?;
            let rendered = per_model - failures.len();
            produced += rendered;

            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| item.source.clone());
            notes.push(format!("Rendered {rendered}/{per_model} views of {file_name}"));

            if rendered > 0 {
                results.push(ItemResult::processed(item));
            } else {
                let reason = failures
                    .first()
                    .map(|(angle, reason)| format!("no views rendered ({angle}: {reason})"))
                    .unwrap_or_else(|| "no views rendered".to_string());
                results.push(ItemResult::failed(item, reason));
            }
        }
        results.sort_by_key(|r| r.ordinal);

        info!(
            %job_id,
            produced,
            expected = total,
            "Model render finished"
        );

        let outcome = if produced == 0 {
            ProcessOutcome::retryable(format!("Rendered 0/{total} views"))
        } else {
            ProcessOutcome::Completed(Artifact {
                path: job_dir,
                mime_type: None,
                produced: produced as u32,
                expected: total as u32,
            })
        };

        let mut report = ProcessReport::new(outcome).with_items(results);
        report.notes = notes;
        Ok(report)
    }
}
