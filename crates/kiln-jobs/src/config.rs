//! Worker configuration: tool paths, directories, timeouts.
//!
//! Built once at startup and shared read-only by the orchestrator, the
//! processors and the attacher.

use std::path::{Path, PathBuf};
use std::time::Duration;

use kiln_core::defaults;

/// Immutable configuration for job processing.
#[derive(Debug, Clone)]
pub struct KilnConfig {
    /// ImageMagick `convert` binary.
    pub convert_path: PathBuf,
    /// Ghostscript binary.
    pub ghostscript_path: PathBuf,
    /// Blender binary.
    pub blender_path: PathBuf,
    /// Python script Blender runs to render one angle.
    pub blender_script: PathBuf,
    /// Scratch root; each job writes under `job_{id}/`.
    pub work_dir: PathBuf,
    /// Root for multi-angle renders; each job writes under `{id}/`.
    pub render_dir: PathBuf,
    /// Host upload tree that attached artifacts are copied into.
    pub upload_root: PathBuf,
    /// Wall-clock cap per external process.
    pub tool_timeout: Duration,
    /// Timeout for outbound HTTP requests.
    pub http_timeout: Duration,
    /// Attempt ceiling for jobs created through this process.
    pub max_attempts: i32,
    /// Open Library covers endpoint.
    pub covers_base_url: String,
}

impl Default for KilnConfig {
    fn default() -> Self {
        Self {
            convert_path: PathBuf::from(defaults::CONVERT_PATH),
            ghostscript_path: PathBuf::from(defaults::GHOSTSCRIPT_PATH),
            blender_path: PathBuf::from(defaults::BLENDER_PATH),
            blender_script: PathBuf::from(defaults::BLENDER_SCRIPT),
            work_dir: PathBuf::from(defaults::WORK_DIR),
            render_dir: PathBuf::from(defaults::RENDER_DIR),
            upload_root: PathBuf::from(defaults::UPLOAD_ROOT),
            tool_timeout: Duration::from_secs(defaults::TOOL_TIMEOUT_SECS),
            http_timeout: Duration::from_secs(defaults::HTTP_TIMEOUT_SECS),
            max_attempts: defaults::JOB_MAX_ATTEMPTS,
            covers_base_url: defaults::OPEN_LIBRARY_COVERS_URL.to_string(),
        }
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl KilnConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `KILN_CONVERT_PATH` | `/usr/bin/convert` | ImageMagick binary |
    /// | `KILN_GS_PATH` | `/usr/bin/gs` | Ghostscript binary |
    /// | `KILN_BLENDER_PATH` | `/usr/bin/blender` | Blender binary |
    /// | `KILN_BLENDER_SCRIPT` | `tools/3d-thumbnail/blender_render.py` | Render script |
    /// | `KILN_WORK_DIR` | `/tmp/kiln` | Scratch directory |
    /// | `KILN_RENDER_DIR` | `/tmp/kiln/renders` | Multi-angle output root |
    /// | `KILN_UPLOAD_ROOT` | `/usr/share/nginx/archive/uploads` | Host upload tree |
    /// | `KILN_TOOL_TIMEOUT_SECS` | `600` | Per-process timeout |
    /// | `KILN_HTTP_TIMEOUT_SECS` | `30` | HTTP timeout |
    /// | `KILN_MAX_ATTEMPTS` | `3` | Attempts per job |
    /// | `OPEN_LIBRARY_COVERS_URL` | `https://covers.openlibrary.org` | Covers endpoint |
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            convert_path: env_path("KILN_CONVERT_PATH").unwrap_or(base.convert_path),
            ghostscript_path: env_path("KILN_GS_PATH").unwrap_or(base.ghostscript_path),
            blender_path: env_path("KILN_BLENDER_PATH").unwrap_or(base.blender_path),
            blender_script: env_path("KILN_BLENDER_SCRIPT").unwrap_or(base.blender_script),
            work_dir: env_path("KILN_WORK_DIR").unwrap_or(base.work_dir),
            render_dir: env_path("KILN_RENDER_DIR").unwrap_or(base.render_dir),
            upload_root: env_path("KILN_UPLOAD_ROOT").unwrap_or(base.upload_root),
            tool_timeout: env_parse::<u64>("KILN_TOOL_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(base.tool_timeout),
            http_timeout: env_parse::<u64>("KILN_HTTP_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(base.http_timeout),
            max_attempts: env_parse::<i32>("KILN_MAX_ATTEMPTS")
                .unwrap_or(base.max_attempts)
                .max(1),
            covers_base_url: std::env::var("OPEN_LIBRARY_COVERS_URL")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(base.covers_base_url),
        }
    }

    /// Point all writable directories below one root (tests, sandboxes).
    pub fn with_root(mut self, root: &Path) -> Self {
        self.work_dir = root.join("work");
        self.render_dir = root.join("renders");
        self.upload_root = root.join("uploads");
        self
    }

    /// Set the attempt ceiling.
    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the covers endpoint.
    pub fn with_covers_base_url(mut self, url: impl Into<String>) -> Self {
        self.covers_base_url = url.into();
        self
    }

    /// Scratch directory of one job.
    pub fn job_work_dir(&self, job_id: uuid::Uuid) -> PathBuf {
        self.work_dir.join(format!("job_{job_id}"))
    }

    /// Render directory of one job.
    pub fn job_render_dir(&self, job_id: uuid::Uuid) -> PathBuf {
        self.render_dir.join(job_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_default_matches_core_defaults() {
        let config = KilnConfig::default();
        assert_eq!(config.convert_path, PathBuf::from("/usr/bin/convert"));
        assert_eq!(config.tool_timeout, Duration::from_secs(600));
        assert_eq!(config.http_timeout, Duration::from_secs(30));
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn test_with_root_moves_writable_dirs() {
        let config = KilnConfig::default().with_root(Path::new("/sandbox"));
        assert_eq!(config.work_dir, PathBuf::from("/sandbox/work"));
        assert_eq!(config.render_dir, PathBuf::from("/sandbox/renders"));
        assert_eq!(config.upload_root, PathBuf::from("/sandbox/uploads"));
        // Tool paths are untouched.
        assert_eq!(config.blender_path, PathBuf::from("/usr/bin/blender"));
    }

    #[test]
    fn test_job_dirs_are_keyed_by_id() {
        let config = KilnConfig::default().with_root(Path::new("/s"));
        let id = Uuid::now_v7();
        assert_eq!(
            config.job_work_dir(id),
            PathBuf::from(format!("/s/work/job_{id}"))
        );
        assert_eq!(
            config.job_render_dir(id),
            PathBuf::from(format!("/s/renders/{id}"))
        );
    }

    #[test]
    fn test_max_attempts_floor() {
        assert_eq!(KilnConfig::default().with_max_attempts(0).max_attempts, 1);
    }
}
