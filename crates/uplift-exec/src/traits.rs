//! Command executor trait

use std::time::Duration;

use async_trait::async_trait;

use crate::error::ExecError;
use crate::result::{CommandRequest, CommandResult};

/// Runs commands on behalf of actors
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run a command to completion
    async fn run(&self, request: &CommandRequest) -> Result<CommandResult, ExecError>;

    /// Run a command, giving up after `timeout`
    async fn run_with_timeout(
        &self,
        request: &CommandRequest,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError>;

    /// Short name of the executor, used in logs
    fn executor_type(&self) -> &'static str;

    /// Run a plain shell command line
    async fn run_shell(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        self.run(&CommandRequest::shell(cmd)).await
    }
}
