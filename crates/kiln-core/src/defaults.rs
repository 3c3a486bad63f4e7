//! Centralized default constants for kiln.
//!
//! **This module is the single source of truth** for shared default values.
//! Crates reference these constants instead of defining their own magic numbers.

// =============================================================================
// JOB PROCESSING
// =============================================================================

/// Default maximum number of attempts for a job before it is terminally failed.
pub const JOB_MAX_ATTEMPTS: i32 = 3;

/// Daemon sleep between polls when the queue is empty (milliseconds).
pub const JOB_POLL_INTERVAL_MS: u64 = 5_000;

/// Maximum jobs processed by one batch (cron) invocation.
pub const JOB_BATCH_LIMIT: usize = 10;

/// Delay between jobs in batch mode, throttles external API calls (milliseconds).
pub const JOB_THROTTLE_MS: u64 = 500;

/// Retention window for terminal jobs removed by `cleanup` (hours).
pub const JOB_RETENTION_HOURS: i64 = 24;

/// A `processing` job untouched for this long belongs to a dead worker (seconds).
///
/// Matches [`TOOL_TIMEOUT_SECS`]: no single tool call outlives it.
pub const JOB_STALE_AFTER_SECS: u64 = TOOL_TIMEOUT_SECS;

/// Error recorded on jobs recovered from a dead worker.
pub const STALE_JOB_ERROR: &str = "Worker stopped while processing";

/// Capacity of the worker event broadcast channel.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// EXTERNAL TOOLS
// =============================================================================

/// Wall-clock cap per external process invocation (seconds).
///
/// Blender renders are the slow case.
pub const TOOL_TIMEOUT_SECS: u64 = 600;

/// Timeout for outbound HTTP requests (seconds).
pub const HTTP_TIMEOUT_SECS: u64 = 30;

/// Default ImageMagick binary.
pub const CONVERT_PATH: &str = "/usr/bin/convert";

/// Default Ghostscript binary.
pub const GHOSTSCRIPT_PATH: &str = "/usr/bin/gs";

/// Default Blender binary.
pub const BLENDER_PATH: &str = "/usr/bin/blender";

/// Default Blender render script.
pub const BLENDER_SCRIPT: &str = "tools/3d-thumbnail/blender_render.py";

// =============================================================================
// FILESYSTEM
// =============================================================================

/// Scratch directory for per-job work files.
pub const WORK_DIR: &str = "/tmp/kiln";

/// Directory for multi-angle renders.
pub const RENDER_DIR: &str = "/tmp/kiln/renders";

/// Root of the host application's upload tree.
pub const UPLOAD_ROOT: &str = "/usr/share/nginx/archive/uploads";

// =============================================================================
// PDF MERGE
// =============================================================================

/// Default output standard for merged documents.
pub const PDF_STANDARD: &str = "pdfa-2b";

/// Default ImageMagick compression quality.
pub const PDF_QUALITY: u32 = 85;

/// Default rasterization density.
pub const PDF_DPI: u32 = 300;

/// Fallback output name when a job name sanitizes to nothing.
pub const PDF_FALLBACK_NAME: &str = "merged_document";

// =============================================================================
// 3D RENDERING
// =============================================================================

/// Fixed camera angles rendered for every model, in output order.
pub const RENDER_ANGLES: [&str; 6] = ["front", "back", "left", "right", "top", "detail"];

/// Default render width in pixels.
pub const RENDER_WIDTH: u32 = 512;

/// Default render height in pixels.
pub const RENDER_HEIGHT: u32 = 512;

/// Model file extensions Blender can import.
pub const MODEL_EXTENSIONS: [&str; 7] = ["glb", "gltf", "obj", "stl", "fbx", "ply", "dae"];

// =============================================================================
// COVERS
// =============================================================================

/// Open Library covers endpoint.
pub const OPEN_LIBRARY_COVERS_URL: &str = "https://covers.openlibrary.org";

/// Responses smaller than this are Open Library's placeholder pixel.
pub const COVER_MIN_BYTES: usize = 1000;

/// User agent sent with cover downloads.
pub const HTTP_USER_AGENT: &str = "kiln/2026 (Archive Job Worker)";

// =============================================================================
// DERIVATIVES
// =============================================================================

/// Thumbnail bounding box.
pub const THUMBNAIL_SIZE: &str = "100x100";

/// Reference rendition bounding box.
pub const REFERENCE_SIZE: &str = "480x480";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_angles_are_six_and_ordered() {
        assert_eq!(RENDER_ANGLES.len(), 6);
        assert_eq!(RENDER_ANGLES[0], "front");
        assert_eq!(RENDER_ANGLES[5], "detail");
    }

    #[test]
    fn test_job_defaults_are_sane() {
        assert!(JOB_MAX_ATTEMPTS >= 1);
        assert!(JOB_BATCH_LIMIT >= 1);
        assert!(HTTP_TIMEOUT_SECS <= 30);
    }
}
