//! Book cover download from Open Library.
//!
//! Items are ISBNs tried in ordinal order; the first one that yields a real
//! cover wins and later items are left untouched. Open Library answers unknown
//! ISBNs with a tiny placeholder image, so small bodies count as "no cover".

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use kiln_core::defaults::COVER_MIN_BYTES;
use kiln_core::{HostRecordStore, JobKind, Result};

use crate::config::KilnConfig;
use crate::handler::{
    Artifact, ItemProcessor, ItemResult, JobContext, ProcessOutcome, ProcessReport,
};
use crate::tools::{HttpFetcher, HttpOutcome};

/// Uppercase and keep only `[0-9X]`.
pub fn normalize_isbn(raw: &str) -> String {
    raw.chars()
        .map(|c| c.to_ascii_uppercase())
        .filter(|c| c.is_ascii_digit() || *c == 'X')
        .collect()
}

/// Large-cover URL for a normalized ISBN.
pub fn cover_url(base: &str, isbn: &str) -> String {
    format!("{}/b/isbn/{isbn}-L.jpg", base.trim_end_matches('/'))
}

/// Why a single ISBN produced no cover.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Miss {
    /// The remote answered; there is nothing to download.
    Absent(String),
    /// Network error or server-side failure; may work on another attempt.
    Transient(String),
}

impl Miss {
    fn reason(&self) -> &str {
        match self {
            Miss::Absent(r) | Miss::Transient(r) => r,
        }
    }
}

/// Check a response and detect the image type from its bytes.
fn accept_cover(outcome: HttpOutcome) -> std::result::Result<(Vec<u8>, infer::Type), Miss> {
    match outcome {
        HttpOutcome::Success { status, body, .. } => {
            if status != 200 {
                return Err(Miss::Absent(format!("HTTP {status}")));
            }
            if body.len() < COVER_MIN_BYTES {
                return Err(Miss::Absent(format!(
                    "placeholder image ({} bytes)",
                    body.len()
                )));
            }
            match infer::get(&body) {
                Some(kind) if kind.matcher_type() == infer::MatcherType::Image => Ok((body, kind)),
                Some(kind) => Err(Miss::Absent(format!("not an image: {}", kind.mime_type()))),
                None => Err(Miss::Absent("unrecognized image data".to_string())),
            }
        }
        HttpOutcome::Failure {
            status: Some(status),
            reason,
        } if status < 500 => Err(Miss::Absent(reason)),
        HttpOutcome::Failure { reason, .. } => Err(Miss::Transient(reason)),
    }
}

pub struct CoverFetchProcessor {
    config: Arc<KilnConfig>,
    host: Arc<dyn HostRecordStore>,
    fetcher: Arc<dyn HttpFetcher>,
}

impl CoverFetchProcessor {
    pub fn new(
        config: Arc<KilnConfig>,
        host: Arc<dyn HostRecordStore>,
        fetcher: Arc<dyn HttpFetcher>,
    ) -> Self {
        Self {
            config,
            host,
            fetcher,
        }
    }
}

#[async_trait]
impl ItemProcessor for CoverFetchProcessor {
    fn kind(&self) -> JobKind {
        JobKind::CoverFetch
    }

    async fn process(&self, ctx: &JobContext) -> Result<ProcessReport> {
        let job_id = ctx.job_id();
        let work_dir = self.config.job_work_dir(job_id);

        if let Some(record_id) = ctx.job.record_id {
            if self.host.has_master_object(record_id).await? {
                info!(%job_id, record_id, "Record already has a digital object, skipping download");
                let items = ctx.items.iter().map(ItemResult::processed).collect();
                let artifact = Artifact {
                    path: work_dir,
                    mime_type: None,
                    produced: 0,
                    expected: 0,
                };
                return Ok(ProcessReport::new(ProcessOutcome::Completed(artifact))
                    .with_items(items)
                    .with_note("Record already has a digital object"));
            }
        }

        let mut results = Vec::new();
        let mut transient = None;

        for (index, item) in ctx.items.iter().enumerate() {
            let isbn = normalize_isbn(&item.source);
            if isbn.is_empty() {
                results.push(ItemResult::failed(item, format!("invalid ISBN: {}", item.source)));
                continue;
            }

            let url = cover_url(&self.config.covers_base_url, &isbn);
            debug!(%job_id, %url, "Fetching cover");
            ctx.report_step(index, ctx.items.len(), &isbn);

            let (body, kind) = match accept_cover(self.fetcher.get(&url).await) {
                Ok(found) => found,
                Err(miss) => {
                    debug!(%job_id, %isbn, reason = miss.reason(), "No cover");
                    results.push(ItemResult::failed(
                        item,
                        format!("no cover for {isbn}: {}", miss.reason()),
                    ));
                    if let Miss::Transient(reason) = miss {
                        transient = Some(reason);
                    }
                    continue;
                }
            };

            tokio::fs::create_dir_all(&work_dir).await?;
            let owner = ctx
                .job
                .record_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| job_id.simple().to_string());
            let file_name = format!(
                "cover-{owner}-{}.{}",
                chrono::Utc::now().timestamp(),
                kind.extension()
            );
            let path = work_dir.join(file_name);
            tokio::fs::write(&path, &body).await?;

            info!(
                %job_id,
                %isbn,
                bytes = body.len(),
                mime = kind.mime_type(),
                "Cover downloaded"
            );
            results.push(ItemResult::processed(item));

            let artifact = Artifact {
                path,
                mime_type: Some(kind.mime_type().to_string()),
                produced: 1,
                expected: 1,
            };
            return Ok(ProcessReport::new(ProcessOutcome::Completed(artifact))
                .with_items(results)
                .with_note(format!("Cover found for ISBN {isbn}")));
        }

        let outcome = match transient {
            Some(reason) => ProcessOutcome::retryable(format!("Cover fetch failed: {reason}")),
            None => ProcessOutcome::fatal("No cover available"),
        };
        Ok(ProcessReport::new(outcome).with_items(results))
    }
}
