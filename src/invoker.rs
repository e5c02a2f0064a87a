use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::errors::PipelineError;

const REDACTION_MARK: &str = "*****";
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// One external command to execute: the invoker launches it, waits for it and
/// captures its output, nothing more. Exit-code-zero-means-success is the
/// only interpretation applied; everything else is the caller's job.
#[derive(Debug, Clone)]
pub struct ToolRequest {
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
    /// Secret values scrubbed from captured output before it is stored.
    pub redact: Vec<String>,
    /// Display label used in timeout errors, usually the owning stage name.
    pub label: String,
}

impl ToolRequest {
    pub fn new(command: impl Into<String>) -> Self {
        let command = command.into();
        Self {
            label: command.clone(),
            command,
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            timeout: None,
            redact: Vec::new(),
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

#[derive(Debug, Clone)]
pub struct ToolResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ToolResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (true, true) => String::new(),
            (false, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Execute the command synchronously. A nonzero exit code comes back as data
/// in the `ToolResult`; only a failure to launch (or a timeout expiry) is an
/// error.
pub fn run(request: &ToolRequest) -> Result<ToolResult, PipelineError> {
    let mut command = Command::new(&request.command);
    command
        .args(&request.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = &request.cwd {
        command.current_dir(dir);
    }
    for (key, value) in &request.env {
        command.env(key, value);
    }

    debug!(command = %request.command, args = ?request.args, "Launching external tool");

    let mut child = command
        .spawn()
        .map_err(|source| PipelineError::ToolInvocation {
            command: request.command.clone(),
            source,
        })?;

    let stdout_reader = spawn_reader(child.stdout.take());
    let stderr_reader = spawn_reader(child.stderr.take());

    let status = match request.timeout {
        None => child.wait().map_err(|source| PipelineError::ToolInvocation {
            command: request.command.clone(),
            source,
        })?,
        Some(limit) => wait_with_deadline(&mut child, limit, request)?,
    };

    let stdout = redact(collect(stdout_reader), &request.redact);
    let stderr = redact(collect(stderr_reader), &request.redact);
    let exit_code = status.code().unwrap_or(-1);

    debug!(command = %request.command, exit_code, "External tool finished");

    Ok(ToolResult {
        exit_code,
        stdout,
        stderr,
    })
}

fn spawn_reader<R: Read + Send + 'static>(source: Option<R>) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = String::new();
        if let Some(mut source) = source {
            let _ = source.read_to_string(&mut buffer);
        }
        buffer
    })
}

fn collect(handle: JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}

fn wait_with_deadline(
    child: &mut Child,
    limit: Duration,
    request: &ToolRequest,
) -> Result<ExitStatus, PipelineError> {
    let deadline = Instant::now() + limit;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {}
            Err(source) => {
                return Err(PipelineError::ToolInvocation {
                    command: request.command.clone(),
                    source,
                });
            }
        }

        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(PipelineError::Timeout {
                stage: request.label.clone(),
                timeout_secs: limit.as_secs(),
            });
        }

        thread::sleep(POLL_INTERVAL);
    }
}

/// Scrub secret values from captured output. Empty redaction values are
/// skipped.
pub fn redact(mut text: String, secrets: &[String]) -> String {
    for secret in secrets {
        if !secret.is_empty() {
            text = text.replace(secret, REDACTION_MARK);
        }
    }
    text
}
