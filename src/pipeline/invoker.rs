//! External tool invocation.
//!
//! The engine only needs "run this program with these arguments in this
//! directory, maybe feed it stdin, and give back exit code plus captured
//! streams". [`ProcessInvoker`] does that with `tokio::process`; tests swap
//! in their own [`ToolInvoker`].

use crate::error::JobFailure;
use crate::partition::Lane;
use futures::future::BoxFuture;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

/// One invocation of the wrapped tool.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub stdin: Option<Vec<u8>>,
    /// Hard deadline; the child is killed when it passes.
    pub timeout: Option<Duration>,
}

/// Captured result of a finished process.
#[derive(Debug, Clone, Default)]
pub struct InvocationOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl InvocationOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Runs a command and captures its output.
///
/// Implementations return `Err` only when the process could not be run to
/// completion (spawn failure, timeout, broken pipes). A process that ran and
/// exited non-zero is an `Ok` output; the caller decides what that means.
pub trait ToolInvoker: Send + Sync {
    fn invoke(&self, request: InvocationRequest) -> BoxFuture<'_, Result<InvocationOutput, JobFailure>>;
}

/// [`ToolInvoker`] backed by OS child processes.
///
/// On unix each child leads its own process group. Dropping an in-flight
/// invocation (timeout or request cancellation) kills that whole group, so
/// tools started through wrapper scripts do not outlive their job.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessInvoker;

impl ToolInvoker for ProcessInvoker {
    fn invoke(&self, request: InvocationRequest) -> BoxFuture<'_, Result<InvocationOutput, JobFailure>> {
        Box::pin(run_process(request))
    }
}

async fn run_process(request: InvocationRequest) -> Result<InvocationOutput, JobFailure> {
    let mut command = Command::new(&request.program);
    command
        .args(&request.args)
        .current_dir(&request.cwd)
        .stdin(if request.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    command.process_group(0);

    let mut child = command
        .spawn()
        .map_err(|e| JobFailure::Spawn(format!("{}: {}", request.program, e)))?;
    let group = ProcessGroupGuard::new(&child);

    if let (Some(input), Some(mut pipe)) = (request.stdin, child.stdin.take()) {
        // Feed stdin concurrently so a chatty child cannot deadlock on a full stdout pipe.
        tokio::spawn(async move {
            if let Err(e) = pipe.write_all(&input).await {
                tracing::debug!("Tool closed stdin early: {}", e);
            }
        });
    }

    let output = match request.timeout {
        Some(after) => tokio::time::timeout(after, child.wait_with_output())
            .await
            .map_err(|_| JobFailure::Timeout { after })?,
        None => child.wait_with_output().await,
    }
    .map_err(|e| JobFailure::Io(e.to_string()))?;
    group.disarm();

    Ok(InvocationOutput {
        exit_code: output.status.code(),
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

/// Kills a child's process group when dropped, unless the child exited on its own.
struct ProcessGroupGuard {
    pgid: Option<i32>,
}

impl ProcessGroupGuard {
    fn new(child: &Child) -> Self {
        Self {
            pgid: child.id().and_then(|pid| i32::try_from(pid).ok()),
        }
    }

    fn disarm(mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_process_group(pgid);
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: i32) {
    // SAFETY: killpg only sends a signal. pgid names the group created for
    // this child by `process_group(0)`.
    #[allow(unsafe_code)]
    let result = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if result != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!("Failed to kill process group {}: {}", pgid, err);
        }
    }
}

// Elsewhere `kill_on_drop` covers the direct child.
#[cfg(not(unix))]
fn kill_process_group(_pgid: i32) {}

/// Program plus argument template with per-job placeholders.
#[derive(Debug, Clone)]
pub struct CommandTemplate {
    program: String,
    args: Vec<String>,
}

impl CommandTemplate {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Substitute `{input}`, `{workdir}`, `{lane}` and `{job}` in `template`.
    pub fn expand_one(template: &str, input: &Path, workdir: &Path, lane: &Lane, job: usize) -> String {
        template
            .replace("{input}", &input.to_string_lossy())
            .replace("{workdir}", &workdir.to_string_lossy())
            .replace("{lane}", &lane.label())
            .replace("{job}", &job.to_string())
    }

    /// Arguments for one job.
    pub fn expand(&self, input: &Path, workdir: &Path, lane: &Lane, job: usize) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| Self::expand_one(arg, input, workdir, lane, job))
            .collect()
    }
}
