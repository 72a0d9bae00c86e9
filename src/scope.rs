//! Per-host handle passed to task bodies

use crate::error::Result;
use crate::executors::CommandExecutor;
use crate::models::{CommandResult, Context, Host, TransferResult};
use crate::transfer::FileTransfer;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Everything a task body may do against its host.
///
/// Each host gets its own scope; the context inside is never shared.
/// Successful commands and transfers are recorded in call order.
pub struct TaskScope {
    context: Context,
    executor: Arc<CommandExecutor>,
    transfer: Arc<FileTransfer>,
    results: Vec<CommandResult>,
    transfers: Vec<TransferResult>,
}

impl TaskScope {
    pub fn new(
        context: Context,
        executor: Arc<CommandExecutor>,
        transfer: Arc<FileTransfer>,
    ) -> Self {
        Self {
            context,
            executor,
            transfer,
            results: Vec::new(),
            transfers: Vec::new(),
        }
    }

    /// Run a command on the host. Non-zero exits are returned, not raised;
    /// chain [`CommandResult::ensure_success`] to fail on them.
    pub async fn run(&mut self, command: &str) -> Result<CommandResult> {
        let result = self.executor.run(&self.context, command).await?;
        self.results.push(result.clone());
        Ok(result)
    }

    /// Run a command on this machine in the local working directory
    pub async fn local(&mut self, command: &str) -> Result<CommandResult> {
        let result = self.executor.run_local(&self.context, command).await?;
        self.results.push(result.clone());
        Ok(result)
    }

    /// Upload a file to the host
    pub async fn put(
        &mut self,
        local_path: impl AsRef<Path>,
        remote_path: &str,
    ) -> Result<TransferResult> {
        let result = self
            .transfer
            .put(&self.context, local_path.as_ref(), remote_path)
            .await?;
        self.transfers.push(result.clone());
        Ok(result)
    }

    /// Print a line attributed to the host
    pub fn echo(&self, message: &str) {
        info!("[{}] {}", self.context.host, message);
        println!("[{}] {}", self.context.host, message);
    }

    pub fn cd(&mut self, dir: &str) {
        self.context.cd(dir);
    }

    pub fn lcd(&mut self, dir: impl AsRef<Path>) {
        self.context.lcd(dir);
    }

    pub fn host(&self) -> &Host {
        &self.context.host
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    pub fn results(&self) -> &[CommandResult] {
        &self.results
    }

    pub(crate) fn finish(self) -> (Vec<CommandResult>, Vec<TransferResult>) {
        (self.results, self.transfers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionManager, MockTransport};
    use crate::error::HostrunError;
    use crate::executors::ExecutorConfig;

    fn local_scope() -> TaskScope {
        let manager = Arc::new(ConnectionManager::new(Arc::new(MockTransport::new())));
        TaskScope::new(
            Context::new(Host::local()),
            Arc::new(CommandExecutor::new(manager.clone(), ExecutorConfig::default())),
            Arc::new(FileTransfer::new(manager)),
        )
    }

    #[tokio::test]
    async fn test_results_recorded_in_order() {
        let mut scope = local_scope();
        scope.run("echo one").await.unwrap();
        scope.run("exit 4").await.unwrap();
        scope.local("echo three").await.unwrap();

        let commands: Vec<&str> = scope.results().iter().map(|r| r.command.as_str()).collect();
        assert_eq!(commands, vec!["echo one", "exit 4", "echo three"]);
        assert_eq!(scope.results()[1].exit_code, 4);
    }

    #[tokio::test]
    async fn test_failed_command_not_recorded() {
        let mut scope = local_scope();
        let err = scope.run("").await.unwrap_err();
        assert!(matches!(err, HostrunError::Execution { .. }));
        assert!(scope.results().is_empty());
    }

    #[tokio::test]
    async fn test_cd_and_put_record_transfer() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("test.py"), "print(1)\n").unwrap();

        let mut scope = local_scope();
        scope.lcd(src.path());
        scope.cd(&dst.path().to_string_lossy());

        let transfer = scope.put(src.path().join("test.py"), ".").await.unwrap();
        assert!(transfer.remote_path.ends_with("/test.py"));

        let listing = scope.run("ls").await.unwrap();
        assert_eq!(listing.stdout.trim(), "test.py");

        let (results, transfers) = scope.finish();
        assert_eq!(results.len(), 1);
        assert_eq!(transfers.len(), 1);
    }
}
