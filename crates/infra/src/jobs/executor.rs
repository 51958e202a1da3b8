//! Command execution.
//!
//! The dispatch loop only sees [`CommandExecutor`]. Every way a command can go
//! wrong (non-zero exit, timeout, missing binary, spawn failure) comes back as
//! [`JobResult::Failure`] with a human-readable reason; executors never error.

use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use queuectl_core::JobResult;

const SUCCESS_FALLBACK: &str = "Command completed successfully";

/// Runs a job's command and reports the outcome.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `command`, giving up after `timeout`.
    async fn execute(&self, command: &str, timeout: Duration) -> JobResult;
}

#[async_trait]
impl<T: CommandExecutor + ?Sized> CommandExecutor for std::sync::Arc<T> {
    async fn execute(&self, command: &str, timeout: Duration) -> JobResult {
        (**self).execute(command, timeout).await
    }
}

/// Executes commands through a POSIX shell (`sh -c <command>`).
///
/// stdout and stderr are captured in full. A command that outlives its
/// timeout is killed.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: String,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different shell binary. It must accept `-c <command>`.
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(&self, command: &str, timeout: Duration) -> JobResult {
        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return JobResult::failure(format!("Command not found: {}: {e}", self.shell));
            }
            Err(e) => return JobResult::failure(format!("Execution error: {e}")),
        };

        // Dropping the wait future on timeout drops the child, which kills it.
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => normalize_output(output),
            Ok(Err(e)) => JobResult::failure(format!("Execution error: {e}")),
            Err(_) => {
                debug!(command, timeout_secs = timeout.as_secs(), "command timed out");
                JobResult::failure(format!(
                    "Command timed out after {} seconds",
                    timeout.as_secs()
                ))
            }
        }
    }
}

fn normalize_output(output: Output) -> JobResult {
    if output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        return if stdout.is_empty() {
            JobResult::success(SUCCESS_FALLBACK)
        } else {
            JobResult::success(stdout)
        };
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return JobResult::failure(stderr);
    }
    match output.status.code() {
        Some(code) => JobResult::failure(format!("Command failed with exit code {code}")),
        None => JobResult::failure(format!("Command terminated abnormally ({})", output.status)),
    }
}
