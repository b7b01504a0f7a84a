//! Local command execution using `tokio::process`

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, error, instrument, warn};

use crate::error::ExecError;
use crate::result::{CommandRequest, CommandResult};
use crate::traits::CommandExecutor;

/// Local command executor
///
/// Executes commands on the local machine using `tokio::process::Command`.
/// Children are killed when the executing future is dropped, so a timed-out
/// command does not outlive the actor that started it.
#[derive(Debug, Clone)]
pub struct LocalExecutor;

impl LocalExecutor {
    /// Create a new local executor
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    #[instrument(skip(self, request), fields(command = %request.command), level = "debug")]
    async fn execute(&self, request: &CommandRequest) -> Result<CommandResult, ExecError> {
        let start = Instant::now();

        debug!("executing local command");

        // Use shell to support pipes, redirections, etc.
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&request.command)
            .envs(&request.env)
            .stdin(if request.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &request.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| ExecError::SpawnError(e.to_string()))?;

        // Feed stdin from a separate task so a chatty child cannot deadlock us
        let writer = match (child.stdin.take(), request.stdin.clone()) {
            (Some(mut stdin), Some(input)) => Some(tokio::spawn(async move {
                stdin.write_all(input.as_bytes()).await?;
                stdin.shutdown().await
            })),
            _ => None,
        };

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        if let Some(writer) = writer {
            match writer.await {
                Ok(Ok(())) => {}
                // The child may exit without reading all of its input
                Ok(Err(e)) => warn!(error = %e, "failed to write command stdin"),
                Err(e) => return Err(ExecError::IoError(e.to_string())),
            }
        }

        let duration = start.elapsed();

        let status = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        debug!(status, duration = ?duration, "command completed");

        if !output.status.success() {
            error!(
                command = %request.command,
                status,
                stderr = %stderr,
                "command failed"
            );
        }

        Ok(CommandResult {
            status,
            stdout,
            stderr,
            duration,
        })
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandExecutor for LocalExecutor {
    async fn run(&self, request: &CommandRequest) -> Result<CommandResult, ExecError> {
        self.execute(request).await
    }

    #[instrument(skip(self, request), fields(command = %request.command), level = "debug")]
    async fn run_with_timeout(
        &self,
        request: &CommandRequest,
        timeout_duration: Duration,
    ) -> Result<CommandResult, ExecError> {
        let start = Instant::now();

        match timeout(timeout_duration, self.execute(request)).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    command = %request.command,
                    timeout = ?timeout_duration,
                    elapsed = ?start.elapsed(),
                    "command timed out"
                );
                Err(ExecError::Timeout {
                    timeout: timeout_duration,
                })
            }
        }
    }

    fn executor_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[tokio::test]
    async fn test_run_success() {
        let executor = LocalExecutor::new();
        let result = executor.run_shell("echo hello").await.unwrap();

        assert!(result.success());
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_failure() {
        let executor = LocalExecutor::new();
        let result = executor.run_shell("exit 42").await.unwrap();

        assert!(!result.success());
        assert_eq!(result.status, 42);
        assert!(matches!(
            result.into_success(),
            Err(ExecError::CommandFailed { status: 42, .. })
        ));
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let executor = LocalExecutor::new();
        let result = executor
            .run_with_timeout(&CommandRequest::shell("sleep 5"), Duration::from_millis(100))
            .await;

        assert!(matches!(result, Err(ExecError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_run_with_stdin_and_env() {
        let executor = LocalExecutor::new();
        let request = CommandRequest::shell("cat; printf \" $GREETING\"")
            .with_stdin("piped")
            .with_env("GREETING", "hi");
        let result = executor.run(&request).await.unwrap();

        assert!(result.success());
        assert_eq!(result.stdout, "piped hi");
    }

    #[tokio::test]
    async fn test_run_in_working_dir() {
        let dir = std::env::temp_dir();
        let executor = LocalExecutor::new();
        let result = executor
            .run(&CommandRequest::shell("pwd -P").with_working_dir(&dir))
            .await
            .unwrap();

        assert_eq!(
            PathBuf::from(result.stdout.trim()),
            dir.canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn test_run_with_stderr() {
        let executor = LocalExecutor::new();
        let result = executor.run_shell("echo error >&2").await.unwrap();

        assert!(result.success());
        assert_eq!(result.stderr.trim(), "error");
    }
}
