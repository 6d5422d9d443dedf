use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::services::ServiceError;

/// Last part of stderr kept in errors and logs.
const STDERR_TAIL: usize = 2000;

/// Temporary working directory, removed on drop.
#[derive(Debug)]
pub(crate) struct ScratchDir(TempDir);

impl ScratchDir {
    pub(crate) fn new(purpose: &str) -> Result<Self, ServiceError> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("clipscope-{purpose}-"))
            .tempdir()?;
        Ok(Self(dir))
    }

    pub(crate) fn path(&self) -> &Path {
        self.0.path()
    }

    pub(crate) fn join(&self, name: &str) -> PathBuf {
        self.0.path().join(name)
    }
}

pub(crate) struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl ToolOutput {
    pub(crate) fn stderr_tail(&self) -> String {
        tail(&self.stderr)
    }

    /// Turn a non-zero exit into [`ServiceError::Process`].
    pub(crate) fn check(self, program: &str, retryable: bool) -> Result<Self, ServiceError> {
        if self.status.success() {
            return Ok(self);
        }
        Err(ServiceError::Process {
            program: program.to_owned(),
            status: self.status.to_string(),
            stderr: self.stderr_tail(),
            retryable,
        })
    }
}

fn tail(text: &str) -> String {
    let trimmed = text.trim();
    let mut start = trimmed.len().saturating_sub(STDERR_TAIL);
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_owned()
}

/// Run an external tool to completion, capturing its output.
///
/// The child is killed if `limit` elapses or the returned future is dropped.
pub(crate) async fn run_tool<I, S>(
    program: &str,
    args: I,
    limit: Duration,
) -> Result<ToolOutput, ServiceError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    debug!(program, command = ?cmd.as_std(), "spawning tool");

    let child = cmd.spawn().map_err(|source| ServiceError::Spawn {
        program: program.to_owned(),
        source,
    })?;

    let output = tokio::time::timeout(limit, child.wait_with_output())
        .await
        .map_err(|_| ServiceError::Timeout(program.to_owned()))??;

    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    trace!(program, status = %output.status, stderr = %tail(&stderr), "tool finished");
    Ok(ToolOutput {
        status: output.status,
        stdout: output.stdout,
        stderr,
    })
}
