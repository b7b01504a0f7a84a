//! Reboot hook that runs a configured command

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uplift_core::{ExecutionState, RebootBoundary, RebootHook};
use uplift_exec::{CommandExecutor, CommandRequest, ExecError};

const REBOOT_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs a shell command such as `systemctl reboot` at a reboot boundary
pub struct CommandReboot {
    command: String,
    executor: Arc<dyn CommandExecutor>,
}

impl CommandReboot {
    pub fn new(command: impl Into<String>, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            command: command.into(),
            executor,
        }
    }
}

#[async_trait]
impl RebootHook for CommandReboot {
    async fn reboot(
        &self,
        state: &ExecutionState,
        boundary: RebootBoundary,
    ) -> Result<(), ExecError> {
        tracing::warn!(
            run_id = %state.run_id,
            boundary = %boundary,
            command = %self.command,
            "rebooting"
        );

        let request = CommandRequest::shell(&self.command)
            .with_env("UPLIFT_RUN_ID", state.run_id.clone())
            .with_env("UPLIFT_REBOOT_BOUNDARY", boundary.to_string());

        self.executor
            .run_with_timeout(&request, REBOOT_TIMEOUT)
            .await?
            .into_success()
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use uplift_exec::LocalExecutor;

    use super::*;

    #[tokio::test]
    async fn test_command_receives_run_id() {
        let state = ExecutionState::new("ipu");
        let hook = CommandReboot::new(
            format!("test \"$UPLIFT_RUN_ID\" = \"{}\"", state.run_id),
            Arc::new(LocalExecutor::new()),
        );

        hook.reboot(&state, RebootBoundary::ContinueStage).await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_command_is_an_error() {
        let state = ExecutionState::new("ipu");
        let hook = CommandReboot::new("exit 3", Arc::new(LocalExecutor::new()));

        let err = hook
            .reboot(&state, RebootBoundary::NewStage)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::CommandFailed { status: 3, .. }));
    }
}
