//! Attach a finished artifact to a host record.
//!
//! The artifact is copied to `{upload_root}/r/{slug}/`, registered as the
//! record's master digital object, and gets thumbnail and reference JPEG
//! renditions. A failed rendition is logged and skipped; it never removes
//! the master.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use kiln_core::defaults::{REFERENCE_SIZE, THUMBNAIL_SIZE};
use kiln_core::{Error, HostRecordStore, NewDigitalObject, Result, UsageKind};

use crate::config::KilnConfig;
use crate::tools::{is_nonempty_file, ToolInvocation, ToolRunner};

const DERIVATIVE_MIME: &str = "image/jpeg";

/// ImageMagick settings for one rendition.
struct Rendition {
    usage: UsageKind,
    suffix: &'static str,
    density: u32,
    /// `-thumbnail` or `-resize`.
    scale_op: &'static str,
    geometry: &'static str,
    quality: u32,
}

const RENDITIONS: [Rendition; 2] = [
    Rendition {
        usage: UsageKind::Thumbnail,
        suffix: "thumb",
        density: 72,
        scale_op: "-thumbnail",
        geometry: THUMBNAIL_SIZE,
        quality: 75,
    },
    Rendition {
        usage: UsageKind::Reference,
        suffix: "ref",
        density: 150,
        scale_op: "-resize",
        geometry: REFERENCE_SIZE,
        quality: 80,
    },
];

/// Result of a successful attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachOutcome {
    /// Id of the master digital object.
    pub object_id: i64,
    /// Where the master now lives.
    pub path: PathBuf,
    /// Ids of the renditions that were created.
    pub derivatives: Vec<i64>,
    /// Renditions that could not be created.
    pub derivative_failures: Vec<String>,
}

/// Size and md5 hex digest of a file.
async fn file_digest(path: &Path) -> Result<(i64, String)> {
    let bytes = tokio::fs::read(path).await?;
    Ok((bytes.len() as i64, format!("{:x}", md5::compute(&bytes))))
}

fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::Attach(format!("artifact has no file name: {}", path.display())))
}

/// Copies artifacts into the host upload tree and registers them.
#[derive(Clone)]
pub struct RecordAttacher {
    config: Arc<KilnConfig>,
    host: Arc<dyn HostRecordStore>,
    runner: Arc<dyn ToolRunner>,
}

impl RecordAttacher {
    pub fn new(
        config: Arc<KilnConfig>,
        host: Arc<dyn HostRecordStore>,
        runner: Arc<dyn ToolRunner>,
    ) -> Self {
        Self {
            config,
            host,
            runner,
        }
    }

    /// Attach `artifact` to `record_id` as its master object.
    pub async fn attach(
        &self,
        record_id: i64,
        artifact: &Path,
        mime_type: &str,
    ) -> Result<AttachOutcome> {
        let record = self
            .host
            .find_record(record_id)
            .await?
            .ok_or(Error::RecordNotFound(record_id))?;

        let key = record.path_key();
        let dest_dir = self.config.upload_root.join("r").join(&key);
        tokio::fs::create_dir_all(&dest_dir).await?;

        let name = file_name_of(artifact)?;
        let dest = dest_dir.join(&name);
        tokio::fs::copy(artifact, &dest)
            .await
            .map_err(|e| Error::Attach(format!("copy to {} failed: {e}", dest.display())))?;

        let (byte_size, checksum) = file_digest(&dest).await?;
        let object_id = self
            .host
            .insert_digital_object(NewDigitalObject {
                parent_id: None,
                record_id: Some(record_id),
                usage: UsageKind::Master,
                mime_type: mime_type.to_string(),
                byte_size,
                checksum: Some(checksum),
                name: name.clone(),
                path: format!("r/{key}/{name}"),
                sequence: 0,
            })
            .await?;

        info!(
            subsystem = "jobs",
            component = "attach",
            record_id,
            object_id,
            path = %dest.display(),
            "Attached master object"
        );

        let mut outcome = AttachOutcome {
            object_id,
            path: dest.clone(),
            derivatives: Vec::new(),
            derivative_failures: Vec::new(),
        };

        for rendition in &RENDITIONS {
            match self.derive(&dest, &key, object_id, rendition).await {
                Ok(id) => outcome.derivatives.push(id),
                Err(e) => {
                    warn!(
                        subsystem = "jobs",
                        component = "attach",
                        object_id,
                        rendition = rendition.suffix,
                        error = %e,
                        "Derivative generation failed"
                    );
                    outcome
                        .derivative_failures
                        .push(format!("{}: {e}", rendition.suffix));
                }
            }
        }

        Ok(outcome)
    }

    async fn derive(
        &self,
        master: &Path,
        key: &str,
        master_id: i64,
        rendition: &Rendition,
    ) -> Result<i64> {
        let stem = master
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "object".to_string());
        let name = format!("{stem}_{}.jpg", rendition.suffix);
        let output = master.with_file_name(&name);

        let mut first_page = master.as_os_str().to_owned();
        first_page.push("[0]");

        let invocation = ToolInvocation::new(&self.config.convert_path, self.config.tool_timeout)
            .arg("-density")
            .arg(rendition.density.to_string())
            .arg(first_page)
            .arg(rendition.scale_op)
            .arg(rendition.geometry)
            .arg("-flatten")
            .arg("-quality")
            .arg(rendition.quality.to_string())
            .arg(output.as_os_str())
            .expect_output(&output);

        let result = self.runner.run(&invocation).await?;
        if !result.success {
            return Err(Error::Attach(result.failure_reason("convert")));
        }
        if !is_nonempty_file(&output).await {
            return Err(Error::Attach("convert produced no output".into()));
        }

        let (byte_size, checksum) = file_digest(&output).await?;
        self.host
            .insert_digital_object(NewDigitalObject {
                parent_id: Some(master_id),
                record_id: None,
                usage: rendition.usage,
                mime_type: DERIVATIVE_MIME.to_string(),
                byte_size,
                checksum: Some(checksum),
                name: name.clone(),
                path: format!("r/{key}/{name}"),
                sequence: 0,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockToolRunner;
    use kiln_db::memory::MemoryHostStore;

    fn setup(dir: &Path, runner: MockToolRunner) -> (RecordAttacher, MemoryHostStore, PathBuf) {
        let host = MemoryHostStore::new();
        let config = Arc::new(KilnConfig::default().with_root(dir));
        let attacher = RecordAttacher::new(config, Arc::new(host.clone()), Arc::new(runner));
        let artifact = dir.join("Minute_book_1921.pdf");
        std::fs::write(&artifact, b"%PDF-1.7 test").unwrap();
        (attacher, host, artifact)
    }

    #[tokio::test]
    async fn test_attach_copies_and_registers_master_with_derivatives() {
        let dir = tempfile::tempdir().unwrap();
        let runner = MockToolRunner::new();
        let (attacher, host, artifact) = setup(dir.path(), runner.clone());
        host.add_record(42, Some("minute-book-1921")).unwrap();

        let outcome = attacher.attach(42, &artifact, "application/pdf").await.unwrap();

        assert_eq!(
            outcome.path,
            dir.path().join("uploads/r/minute-book-1921/Minute_book_1921.pdf")
        );
        assert!(outcome.path.exists());
        assert_eq!(outcome.derivatives.len(), 2);

        let objects = host.objects().unwrap();
        let (master_id, master) = &objects[0];
        assert_eq!(*master_id, outcome.object_id);
        assert_eq!(master.usage, UsageKind::Master);
        assert_eq!(master.record_id, Some(42));
        assert_eq!(master.path, "r/minute-book-1921/Minute_book_1921.pdf");
        assert_eq!(
            master.checksum.as_deref(),
            Some(format!("{:x}", md5::compute(b"%PDF-1.7 test")).as_str())
        );

        let (_, thumb) = &objects[1];
        assert_eq!(thumb.usage, UsageKind::Thumbnail);
        assert_eq!(thumb.parent_id, Some(outcome.object_id));
        assert_eq!(thumb.name, "Minute_book_1921_thumb.jpg");
        let (_, reference) = &objects[2];
        assert_eq!(reference.usage, UsageKind::Reference);

        let thumb_call = runner.get_calls().remove(0).arg_strings();
        assert_eq!(thumb_call[0], "-density");
        assert_eq!(thumb_call[1], "72");
        assert!(thumb_call[2].ends_with("Minute_book_1921.pdf[0]"));
        assert_eq!(thumb_call[3], "-thumbnail");
        assert_eq!(thumb_call[4], "100x100");
    }

    #[tokio::test]
    async fn test_record_without_slug_uses_padded_id() {
        let dir = tempfile::tempdir().unwrap();
        let (attacher, host, artifact) = setup(dir.path(), MockToolRunner::new());
        host.add_record(7, None).unwrap();

        let outcome = attacher.attach(7, &artifact, "application/pdf").await.unwrap();
        assert!(outcome.path.ends_with("r/0000000007/Minute_book_1921.pdf"));
    }

    #[tokio::test]
    async fn test_missing_record_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let (attacher, host, artifact) = setup(dir.path(), MockToolRunner::new());

        let err = attacher.attach(99, &artifact, "application/pdf").await.unwrap_err();
        assert!(matches!(err, Error::RecordNotFound(99)));
        assert!(host.objects().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_derivative_failure_keeps_master() {
        let dir = tempfile::tempdir().unwrap();
        let (attacher, host, artifact) =
            setup(dir.path(), MockToolRunner::new().fail_when_arg("_thumb.jpg"));
        host.add_record(42, Some("mb")).unwrap();

        let outcome = attacher.attach(42, &artifact, "application/pdf").await.unwrap();
        assert_eq!(outcome.derivatives.len(), 1);
        assert_eq!(outcome.derivative_failures.len(), 1);
        assert!(outcome.derivative_failures[0].starts_with("thumb:"));
        assert_eq!(host.objects().unwrap().len(), 2);
    }
}
