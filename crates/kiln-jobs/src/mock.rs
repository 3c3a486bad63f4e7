//! Mock tool runner and HTTP fetcher for deterministic testing.
//!
//! [`MockToolRunner`] never spawns a process. On success it writes the
//! invocation's declared output file, with the invocation arguments one per
//! line as content, so tests can assert input order from the artifact itself.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kiln_jobs::mock::MockToolRunner;
//!
//! let runner = MockToolRunner::new().fail_when_arg("top");
//! // ... run a model render job ...
//! assert_eq!(runner.call_count_for("blender"), 6);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use kiln_core::Result;

use crate::tools::{HttpFetcher, HttpOutcome, ToolInvocation, ToolOutput, ToolRunner};

#[derive(Debug, Clone)]
enum FailureRule {
    All,
    Program(String),
    ArgContains(String),
}

impl FailureRule {
    fn matches(&self, invocation: &ToolInvocation) -> bool {
        match self {
            FailureRule::All => true,
            FailureRule::Program(name) => invocation.program_name() == *name,
            FailureRule::ArgContains(needle) => invocation
                .arg_strings()
                .iter()
                .any(|a| a.contains(needle.as_str())),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct MockConfig {
    failures: Vec<FailureRule>,
    skip_output: bool,
}

/// Mock [`ToolRunner`] for testing.
#[derive(Clone, Default)]
pub struct MockToolRunner {
    config: Arc<MockConfig>,
    call_log: Arc<Mutex<Vec<ToolInvocation>>>,
}

impl MockToolRunner {
    /// Create a runner where every invocation succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every invocation.
    pub fn fail_all(mut self) -> Self {
        Arc::make_mut(&mut self.config)
            .failures
            .push(FailureRule::All);
        self
    }

    /// Fail invocations of one program (`convert`, `gs`, `blender`).
    pub fn fail_program(mut self, name: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.config)
            .failures
            .push(FailureRule::Program(name.into()));
        self
    }

    /// Fail invocations with an argument containing `needle`.
    pub fn fail_when_arg(mut self, needle: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.config)
            .failures
            .push(FailureRule::ArgContains(needle.into()));
        self
    }

    /// Report success without writing the declared output.
    pub fn without_output(mut self) -> Self {
        Arc::make_mut(&mut self.config).skip_output = true;
        self
    }

    /// Get all logged invocations for assertion.
    pub fn get_calls(&self) -> Vec<ToolInvocation> {
        self.call_log.lock().unwrap().clone()
    }

    /// Number of invocations of one program.
    pub fn call_count_for(&self, name: &str) -> usize {
        self.call_log
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.program_name() == name)
            .count()
    }

    /// Clear the call log.
    pub fn clear_calls(&self) {
        self.call_log.lock().unwrap().clear()
    }
}

#[async_trait]
impl ToolRunner for MockToolRunner {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput> {
        self.call_log.lock().unwrap().push(invocation.clone());

        if self.config.failures.iter().any(|r| r.matches(invocation)) {
            return Ok(ToolOutput::failed(
                Some(1),
                format!("{}: mock failure", invocation.program_name()),
            ));
        }

        if let (Some(output), false) = (&invocation.output, self.config.skip_output) {
            if let Some(parent) = output.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(output, invocation.arg_strings().join("\n")).await?;
        }
        Ok(ToolOutput::ok(""))
    }
}

/// Mock [`HttpFetcher`] for testing. Unknown URLs answer 404.
#[derive(Clone, Default)]
pub struct MockHttpFetcher {
    responses: Arc<HashMap<String, HttpOutcome>>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl MockHttpFetcher {
    /// Create a fetcher with no canned responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `url` with a 200 and the given body.
    pub fn with_body(mut self, url: impl Into<String>, body: Vec<u8>) -> Self {
        Arc::make_mut(&mut self.responses).insert(
            url.into(),
            HttpOutcome::Success {
                status: 200,
                body,
                content_type: None,
            },
        );
        self
    }

    /// Answer `url` with an arbitrary outcome.
    pub fn with_outcome(mut self, url: impl Into<String>, outcome: HttpOutcome) -> Self {
        Arc::make_mut(&mut self.responses).insert(url.into(), outcome);
        self
    }

    /// URLs requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpFetcher for MockHttpFetcher {
    async fn get(&self, url: &str) -> HttpOutcome {
        self.requests.lock().unwrap().push(url.to_string());
        self.responses
            .get(url)
            .cloned()
            .unwrap_or(HttpOutcome::Failure {
                status: Some(404),
                reason: "HTTP 404".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_mock_writes_declared_output_with_args() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("nested/out.pdf");
        let runner = MockToolRunner::new();
        let inv = ToolInvocation::new("/usr/bin/convert", Duration::from_secs(1))
            .args(["/a.tif", "/b.tif"])
            .arg(out.as_os_str())
            .expect_output(&out);

        let result = runner.run(&inv).await.unwrap();
        assert!(result.success);
        let content = std::fs::read_to_string(&out).unwrap();
        assert!(content.starts_with("/a.tif\n/b.tif"));
        assert_eq!(runner.call_count_for("convert"), 1);
    }

    #[tokio::test]
    async fn test_mock_failure_rules() {
        let runner = MockToolRunner::new().fail_program("gs").fail_when_arg("top");
        let gs = ToolInvocation::new("/usr/bin/gs", Duration::from_secs(1));
        let top = ToolInvocation::new("/usr/bin/blender", Duration::from_secs(1)).arg("top");
        let front = ToolInvocation::new("/usr/bin/blender", Duration::from_secs(1)).arg("front");

        assert!(!runner.run(&gs).await.unwrap().success);
        assert!(!runner.run(&top).await.unwrap().success);
        assert!(runner.run(&front).await.unwrap().success);
        assert_eq!(runner.get_calls().len(), 3);
    }

    #[tokio::test]
    async fn test_mock_http_defaults_to_404() {
        let fetcher = MockHttpFetcher::new().with_body("https://x/a.jpg", vec![1, 2, 3]);
        assert!(fetcher.get("https://x/a.jpg").await.is_success());
        assert_eq!(
            fetcher.get("https://x/b.jpg").await,
            HttpOutcome::Failure {
                status: Some(404),
                reason: "HTTP 404".into()
            }
        );
        assert_eq!(fetcher.requests().len(), 2);
    }
}
