//! External tool adapters.
//!
//! A tool failure (non-zero exit, timeout, missing binary, HTTP error) is a
//! normal outcome and is returned as data; `Err` is reserved for programmer
//! errors such as an empty program name.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use kiln_core::defaults::{HTTP_TIMEOUT_SECS, HTTP_USER_AGENT};
use kiln_core::{Error, Result};

/// Maximum number of bytes of combined output kept for diagnostics.
const MAX_OUTPUT_BYTES: usize = 8 * 1024;

/// One external process call. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub timeout: Duration,
    /// File the tool is expected to write, checked by the caller after success.
    pub output: Option<PathBuf>,
}

impl ToolInvocation {
    /// Create an invocation with no arguments.
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout,
            output: None,
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments in order.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Declare the file this invocation should produce.
    pub fn expect_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }

    /// Short program name for logs (`convert`, `gs`, `blender`).
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.to_string_lossy().into_owned())
    }

    /// Arguments as lossy UTF-8 strings.
    pub fn arg_strings(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }
}

impl fmt::Display for ToolInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Structured result of a [`ToolInvocation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    /// Zero exit code (and not timed out).
    pub success: bool,
    pub exit_code: Option<i32>,
    /// stdout followed by stderr, truncated for diagnostics.
    pub output: String,
    pub timed_out: bool,
}

impl ToolOutput {
    /// Successful run with the given output.
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            output: output.into(),
            timed_out: false,
        }
    }

    /// Failed run with an exit code.
    pub fn failed(exit_code: Option<i32>, output: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code,
            output: output.into(),
            timed_out: false,
        }
    }

    /// Run killed after its deadline.
    pub fn timed_out(timeout: Duration) -> Self {
        Self {
            success: false,
            exit_code: None,
            output: format!("timed out after {}s", timeout.as_secs()),
            timed_out: true,
        }
    }

    /// One-line reason suitable for an item or job error message.
    pub fn failure_reason(&self, program: &str) -> String {
        if self.timed_out {
            return format!("{program} {}", self.output);
        }
        let last_line = self
            .output
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
            .trim();
        match self.exit_code {
            Some(code) if last_line.is_empty() => format!("{program} exited with {code}"),
            Some(code) => format!("{program} exited with {code}: {last_line}"),
            None if last_line.is_empty() => format!("{program} failed"),
            None => format!("{program} failed: {last_line}"),
        }
    }
}

/// Runs external processes.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run one invocation to completion or timeout.
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput>;
}

/// [`ToolRunner`] backed by `tokio::process`.
///
/// The child is spawned with `kill_on_drop`, so abandoning the wait on timeout
/// terminates it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    /// Create a process runner.
    pub fn new() -> Self {
        Self
    }
}

fn combine_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut text = String::from_utf8_lossy(stdout).into_owned();
    let err = String::from_utf8_lossy(stderr);
    if !err.trim().is_empty() {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&err);
    }
    if text.len() > MAX_OUTPUT_BYTES {
        let mut cut = text.len() - MAX_OUTPUT_BYTES;
        while !text.is_char_boundary(cut) {
            cut += 1;
        }
        text = text.split_off(cut);
    }
    text
}

#[async_trait]
impl ToolRunner for ProcessRunner {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput> {
        if invocation.program.as_os_str().is_empty() {
            return Err(Error::InvalidInput("tool program is empty".into()));
        }

        let program = invocation.program_name();
        let start = Instant::now();

        let child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                warn!(
                    subsystem = "jobs",
                    component = "tools",
                    op = "spawn",
                    program = %program,
                    error = %e,
                    "Failed to start external tool"
                );
                return Ok(ToolOutput::failed(None, format!("failed to start: {e}")));
            }
        };

        let output = match tokio::time::timeout(invocation.timeout, child.wait_with_output()).await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Ok(ToolOutput::failed(None, format!("wait failed: {e}"))),
            Err(_) => {
                warn!(
                    subsystem = "jobs",
                    component = "tools",
                    op = "timeout",
                    program = %program,
                    timeout_secs = invocation.timeout.as_secs(),
                    "External tool timed out, killed"
                );
                return Ok(ToolOutput::timed_out(invocation.timeout));
            }
        };

        let text = combine_output(&output.stdout, &output.stderr);
        let result = if output.status.success() {
            ToolOutput::ok(text)
        } else {
            ToolOutput::failed(output.status.code(), text)
        };

        debug!(
            subsystem = "jobs",
            component = "tools",
            op = "run",
            program = %program,
            success = result.success,
            exit_code = ?result.exit_code,
            duration_ms = start.elapsed().as_millis() as u64,
            "External tool finished"
        );
        Ok(result)
    }
}

/// Outcome of an HTTP GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpOutcome {
    /// 2xx response with its body.
    Success {
        status: u16,
        body: Vec<u8>,
        content_type: Option<String>,
    },
    /// Non-2xx status, network error or timeout.
    Failure { status: Option<u16>, reason: String },
}

impl HttpOutcome {
    /// Whether the request succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, HttpOutcome::Success { .. })
    }
}

/// Fetches remote resources.
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    /// GET a URL. Never retries.
    async fn get(&self, url: &str) -> HttpOutcome;
}

/// [`HttpFetcher`] backed by reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    /// Create a fetcher with a fixed request timeout.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(HTTP_USER_AGENT)
            .build()?;
        Ok(Self { client })
    }

    /// Create a fetcher with the default timeout.
    pub fn with_default_timeout() -> Result<Self> {
        Self::new(Duration::from_secs(HTTP_TIMEOUT_SECS))
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn get(&self, url: &str) -> HttpOutcome {
        let start = Instant::now();
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                let reason = if e.is_timeout() {
                    "request timed out".to_string()
                } else {
                    format!("request failed: {e}")
                };
                debug!(subsystem = "jobs", component = "http", url, %reason, "HTTP GET failed");
                return HttpOutcome::Failure {
                    status: None,
                    reason,
                };
            }
        };

        let status = response.status().as_u16();
        if !response.status().is_success() {
            return HttpOutcome::Failure {
                status: Some(status),
                reason: format!("HTTP {status}"),
            };
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        match response.bytes().await {
            Ok(body) => {
                debug!(
                    subsystem = "jobs",
                    component = "http",
                    url,
                    status,
                    bytes = body.len(),
                    duration_ms = start.elapsed().as_millis() as u64,
                    "HTTP GET finished"
                );
                HttpOutcome::Success {
                    status,
                    body: body.to_vec(),
                    content_type,
                }
            }
            Err(e) => HttpOutcome::Failure {
                status: Some(status),
                reason: format!("failed to read body: {e}"),
            },
        }
    }
}

/// Whether a path exists and is a non-empty regular file.
pub async fn is_nonempty_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}
