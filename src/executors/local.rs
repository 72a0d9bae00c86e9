//! Local shell execution for the `local` pseudo-host

use crate::error::{HostrunError, Result};
use crate::executors::{combine_streams, truncate_output_bytes};
use crate::models::{CommandResult, Context, OutputMode, MAX_OUTPUT_SIZE};
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, error, info};

/// Shell used for every command line
pub const SHELL: &str = "/bin/sh";

/// Runs command lines through `/bin/sh -c` on this machine
#[derive(Debug, Clone, Default)]
pub struct LocalShell;

impl LocalShell {
    pub fn new() -> Self {
        Self
    }

    /// Run `command` with the context's working directory and environment
    pub async fn run(
        &self,
        context: &Context,
        command: &str,
        output: OutputMode,
        timeout: Option<Duration>,
    ) -> Result<CommandResult> {
        info!("[local] run: {}", command);

        let mut cmd = Command::new(SHELL);
        cmd.arg("-c").arg(combine_streams(command, output));

        if let Some(workdir) = &context.working_dir {
            if !Path::new(workdir).is_dir() {
                return Err(HostrunError::execution(
                    &context.host,
                    format!("working directory does not exist: {}", workdir),
                ));
            }
            cmd.current_dir(workdir);
        }

        cmd.envs(&context.env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        // Kill the child if the future is dropped (timeout or run cancellation)
        cmd.kill_on_drop(true);

        let start = Instant::now();
        let output = match timeout {
            Some(limit) => tokio::time::timeout(limit, cmd.output())
                .await
                .map_err(|_| {
                    error!("[local] command timed out after {:?}", limit);
                    HostrunError::Timeout {
                        host: context.host.to_string(),
                        after: limit,
                    }
                })?,
            None => cmd.output().await,
        }
        .map_err(|e| {
            error!("[local] failed to spawn {}: {}", SHELL, e);
            HostrunError::execution(&context.host, format!("failed to spawn shell: {}", e))
        })?;
        let duration = start.elapsed();

        let (stdout, stdout_truncated) = truncate_output_bytes(&output.stdout);
        let (stderr, stderr_truncated) = truncate_output_bytes(&output.stderr);
        let output_truncated = stdout_truncated || stderr_truncated;
        if output_truncated {
            debug!("Output truncated to {} bytes", MAX_OUTPUT_SIZE);
        }

        // Killed by a signal
        let exit_code = output.status.code().unwrap_or(-1);
        debug!("[local] exit code {} in {:?}", exit_code, duration);

        Ok(CommandResult {
            command: command.to_string(),
            exit_code,
            stdout,
            stderr,
            duration,
            output_truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Host;

    fn ctx() -> Context {
        Context::new(Host::local())
    }

    #[tokio::test]
    async fn test_local_success() {
        let result = LocalShell::new()
            .run(&ctx(), "echo hello", OutputMode::Separate, None)
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout.trim(), "hello");
        assert!(result.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_local_nonzero_is_not_error() {
        let result = LocalShell::new()
            .run(&ctx(), "echo oops >&2; exit 3", OutputMode::Separate, None)
            .await
            .unwrap();
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_local_env_and_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let context = ctx()
            .with_working_dir(dir.path().to_string_lossy())
            .with_env("GREETING", "hola");

        let result = LocalShell::new()
            .run(&context, "echo $GREETING; pwd", OutputMode::Separate, None)
            .await
            .unwrap();
        let lines: Vec<&str> = result.stdout.lines().collect();
        assert_eq!(lines[0], "hola");
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(
            Path::new(lines[1]).canonicalize().unwrap(),
            expected
        );
    }

    #[tokio::test]
    async fn test_local_combined_output() {
        let result = LocalShell::new()
            .run(&ctx(), "echo out; echo err >&2", OutputMode::Combined, None)
            .await
            .unwrap();
        assert!(result.stdout.contains("out"));
        assert!(result.stdout.contains("err"));
        assert!(result.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_local_missing_workdir() {
        let context = ctx().with_working_dir("/nonexistent/hostrun/dir");
        let result = LocalShell::new()
            .run(&context, "true", OutputMode::Separate, None)
            .await;
        assert!(matches!(result, Err(HostrunError::Execution { .. })));
    }

    #[tokio::test]
    async fn test_local_timeout() {
        let result = LocalShell::new()
            .run(
                &ctx(),
                "sleep 10",
                OutputMode::Separate,
                Some(Duration::from_millis(200)),
            )
            .await;
        assert!(matches!(result, Err(HostrunError::Timeout { .. })));
    }
}
