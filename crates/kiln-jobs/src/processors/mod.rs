//! Item processors, one per job kind.

pub mod cover_fetch;
pub mod model_render;
pub mod pdf_merge;

use std::sync::Arc;

use kiln_core::HostRecordStore;

use crate::config::KilnConfig;
use crate::handler::ItemProcessor;
use crate::tools::{HttpFetcher, ToolRunner};

pub use cover_fetch::CoverFetchProcessor;
pub use model_render::ModelRenderProcessor;
pub use pdf_merge::PdfMergeProcessor;

/// One processor for every job kind, sharing the given adapters.
pub fn standard_processors(
    config: Arc<KilnConfig>,
    runner: Arc<dyn ToolRunner>,
    host: Arc<dyn HostRecordStore>,
    fetcher: Arc<dyn HttpFetcher>,
) -> Vec<Arc<dyn ItemProcessor>> {
    vec![
        Arc::new(PdfMergeProcessor::new(config.clone(), runner.clone())),
        Arc::new(ModelRenderProcessor::new(config.clone(), runner)),
        Arc::new(CoverFetchProcessor::new(config, host, fetcher)),
    ]
}
