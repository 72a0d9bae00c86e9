//! Command execution, locally or through a pooled connection

pub mod local;
pub mod ssh;

use crate::connection::ConnectionManager;
use crate::error::{HostrunError, Result};
use crate::models::{CommandResult, Context, OutputMode, MAX_COMMAND_LEN, MAX_OUTPUT_SIZE};
use local::LocalShell;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Written to stderr by the remote wrapper when `cd` fails
pub(crate) const MISSING_WORKDIR_MARKER: &str = "hostrun: missing working directory";

/// Executor settings
#[derive(Debug, Clone, Default)]
pub struct ExecutorConfig {
    pub output: OutputMode,
    /// Per-command limit; none means wait for exit
    pub command_timeout: Option<Duration>,
}

/// Runs commands on the context's host
pub struct CommandExecutor {
    connections: Arc<ConnectionManager>,
    local: LocalShell,
    config: ExecutorConfig,
}

impl CommandExecutor {
    pub fn new(connections: Arc<ConnectionManager>, config: ExecutorConfig) -> Self {
        Self {
            connections,
            local: LocalShell::new(),
            config,
        }
    }

    /// Run `command` on `context.host`.
    ///
    /// A non-zero exit code is returned in the [`CommandResult`], not as an
    /// error. Errors are reserved for infrastructure failures.
    pub async fn run(&self, context: &Context, command: &str) -> Result<CommandResult> {
        validate_command(context, command)?;

        if context.host.is_local() {
            return self
                .local
                .run(
                    context,
                    command,
                    self.config.output,
                    self.config.command_timeout,
                )
                .await;
        }

        self.run_remote(context, command).await
    }

    /// Run `command` on this machine whatever the context's host is
    pub async fn run_local(&self, context: &Context, command: &str) -> Result<CommandResult> {
        self.run(&context.for_local(), command).await
    }

    async fn run_remote(&self, context: &Context, command: &str) -> Result<CommandResult> {
        let host = &context.host;
        let command_line = remote_command_line(context, command, self.config.output);

        info!("[{}] run: {}", host, command);
        debug!("[{}] command line: {}", host, command_line);

        let connection = self.connections.acquire(host).await?;
        let start = Instant::now();

        let exec = async {
            let mut connection = connection.lock().await;
            connection.exec(&command_line).await
        };
        let raw = match self.config.command_timeout {
            Some(limit) => match tokio::time::timeout(limit, exec).await {
                Ok(raw) => raw,
                Err(_) => {
                    error!("[{}] command timed out after {:?}", host, limit);
                    self.connections.release(host).await;
                    return Err(HostrunError::Timeout {
                        host: host.to_string(),
                        after: limit,
                    });
                }
            },
            None => exec.await,
        };
        let duration = start.elapsed();

        let raw = match raw {
            Ok(raw) => raw,
            Err(e) => {
                // The session is suspect; the next command reconnects
                warn!("[{}] dropping connection after error: {}", host, e);
                self.connections.release(host).await;
                return Err(e);
            }
        };

        let (stdout, stdout_truncated) = truncate_output_bytes(&raw.stdout);
        let (stderr, stderr_truncated) = truncate_output_bytes(&raw.stderr);
        let output_truncated = stdout_truncated || stderr_truncated;

        if raw.exit_code != 0 && stderr.contains(MISSING_WORKDIR_MARKER) {
            return Err(HostrunError::execution(
                host,
                format!(
                    "working directory does not exist: {}",
                    context.working_dir.as_deref().unwrap_or_default()
                ),
            ));
        }

        if output_truncated {
            warn!("Output truncated to {} bytes", MAX_OUTPUT_SIZE);
        }
        debug!("[{}] exit code {} in {:?}", host, raw.exit_code, duration);

        Ok(CommandResult {
            command: command.to_string(),
            exit_code: raw.exit_code,
            stdout,
            stderr,
            duration,
            output_truncated,
        })
    }
}

fn validate_command(context: &Context, command: &str) -> Result<()> {
    if command.trim().is_empty() {
        return Err(HostrunError::execution(
            &context.host,
            "command line is empty",
        ));
    }
    if command.len() > MAX_COMMAND_LEN {
        return Err(HostrunError::execution(
            &context.host,
            format!("command exceeds maximum length of {} bytes", MAX_COMMAND_LEN),
        ));
    }
    if command.contains('\0') {
        return Err(HostrunError::execution(
            &context.host,
            "command line contains a NUL byte",
        ));
    }
    for key in context.env.keys() {
        if !is_valid_env_name(key) {
            return Err(HostrunError::execution(
                &context.host,
                format!("invalid environment variable name '{}'", key),
            ));
        }
    }
    Ok(())
}

fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Quote `s` for a POSIX shell
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Redirect stderr into stdout for the rest of the script
pub(crate) fn combine_streams(command: &str, output: OutputMode) -> String {
    match output {
        OutputMode::Separate => command.to_string(),
        OutputMode::Combined => format!("exec 2>&1\n{}", command),
    }
}

/// Build the `/bin/sh -c` line sent over the wire
pub(crate) fn remote_command_line(context: &Context, command: &str, output: OutputMode) -> String {
    let mut script = String::new();

    if let Some(dir) = &context.working_dir {
        script.push_str(&format!(
            "cd -- {} 2>/dev/null || {{ echo {} >&2; exit 1; }}\n",
            shell_quote(dir),
            shell_quote(MISSING_WORKDIR_MARKER)
        ));
    }
    for (key, value) in &context.env {
        script.push_str(&format!("export {}={}\n", key, shell_quote(value)));
    }
    script.push_str(&combine_streams(command, output));

    format!("{} -c {}", local::SHELL, shell_quote(&script))
}

/// Truncate byte output to MAX_OUTPUT_SIZE
///
/// Returns (truncated_string, was_truncated)
pub(crate) fn truncate_output_bytes(data: &[u8]) -> (String, bool) {
    let truncated = data.len() > MAX_OUTPUT_SIZE;
    let bytes = if truncated {
        &data[..MAX_OUTPUT_SIZE]
    } else {
        data
    };

    let output = String::from_utf8_lossy(bytes).to_string();
    (output, truncated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, MockConnection, MockTransport, RawOutput};
    use crate::models::Host;

    fn remote() -> Context {
        Context::new(Host::new("web1", 22, "deploy"))
    }

    fn manager_with(conn: MockConnection) -> Arc<ConnectionManager> {
        let mut transport = MockTransport::new();
        let mut conn = Some(conn);
        transport
            .expect_connect()
            .times(1)
            .returning(move |_| Ok(Box::new(conn.take().unwrap()) as Box<dyn Connection>));
        Arc::new(ConnectionManager::new(Arc::new(transport)))
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_remote_command_line() {
        let context = remote()
            .with_working_dir("/home/lordferatum")
            .with_env("APP_ENV", "prod");
        let line = remote_command_line(&context, "python test.py", OutputMode::Separate);

        assert!(line.starts_with("/bin/sh -c '"));
        assert!(line.contains("cd -- '\\''/home/lordferatum'\\''"));
        assert!(line.contains("export APP_ENV='\\''prod'\\''"));
        assert!(line.ends_with("python test.py'"));
    }

    #[test]
    fn test_remote_command_line_bare() {
        let line = remote_command_line(&remote(), "uname -a", OutputMode::Separate);
        assert_eq!(line, "/bin/sh -c 'uname -a'");
    }

    #[test]
    fn test_env_name_validation() {
        assert!(is_valid_env_name("PATH"));
        assert!(is_valid_env_name("_private1"));
        assert!(!is_valid_env_name("1BAD"));
        assert!(!is_valid_env_name("BAD-NAME"));
        assert!(!is_valid_env_name(""));
    }

    #[test]
    fn test_truncate_output() {
        let (output, truncated) = truncate_output_bytes(b"hello");
        assert_eq!(output, "hello");
        assert!(!truncated);

        let large_data = vec![b'x'; MAX_OUTPUT_SIZE + 1000];
        let (output, truncated) = truncate_output_bytes(&large_data);
        assert_eq!(output.len(), MAX_OUTPUT_SIZE);
        assert!(truncated);
    }

    #[tokio::test]
    async fn test_remote_nonzero_exit_is_data() {
        let mut conn = MockConnection::new();
        conn.expect_exec().times(1).returning(|_| {
            Ok(RawOutput {
                exit_code: 2,
                stdout: b"partial".to_vec(),
                stderr: b"No such file".to_vec(),
            })
        });

        let executor = CommandExecutor::new(manager_with(conn), ExecutorConfig::default());
        let result = executor.run(&remote(), "ls /missing").await.unwrap();

        assert_eq!(result.exit_code, 2);
        assert_eq!(result.stdout, "partial");
        assert_eq!(result.stderr, "No such file");
        assert_eq!(result.command, "ls /missing");
    }

    #[tokio::test]
    async fn test_remote_missing_workdir() {
        let mut conn = MockConnection::new();
        conn.expect_exec().returning(|_| {
            Ok(RawOutput {
                exit_code: 1,
                stdout: vec![],
                stderr: format!("{}\n", MISSING_WORKDIR_MARKER).into_bytes(),
            })
        });

        let executor = CommandExecutor::new(manager_with(conn), ExecutorConfig::default());
        let context = remote().with_working_dir("/nope");
        let result = executor.run(&context, "ls").await;

        assert!(matches!(result, Err(HostrunError::Execution { .. })));
    }

    #[tokio::test]
    async fn test_remote_dropped_connection_is_released() {
        let mut conn = MockConnection::new();
        conn.expect_exec()
            .returning(|_| Err(HostrunError::execution("web1", "channel closed")));
        conn.expect_close().times(1).returning(|| Ok(()));

        let manager = manager_with(conn);
        let executor = CommandExecutor::new(manager.clone(), ExecutorConfig::default());
        let result = executor.run(&remote(), "uptime").await;

        assert!(matches!(result, Err(HostrunError::Execution { .. })));
        assert_eq!(manager.active(), 0);
    }

    #[tokio::test]
    async fn test_empty_command_rejected_before_connecting() {
        let transport = MockTransport::new();
        let manager = Arc::new(ConnectionManager::new(Arc::new(transport)));
        let executor = CommandExecutor::new(manager.clone(), ExecutorConfig::default());

        let result = executor.run(&remote(), "   ").await;
        assert!(matches!(result, Err(HostrunError::Execution { .. })));
        assert_eq!(manager.acquire_count(), 0);
    }

    #[tokio::test]
    async fn test_local_host_bypasses_connection_manager() {
        let transport = MockTransport::new();
        let manager = Arc::new(ConnectionManager::new(Arc::new(transport)));
        let executor = CommandExecutor::new(manager.clone(), ExecutorConfig::default());

        let result = executor
            .run(&Context::new(Host::local()), "echo local")
            .await
            .unwrap();

        assert_eq!(result.stdout.trim(), "local");
        assert_eq!(manager.acquire_count(), 0);
    }

    #[tokio::test]
    async fn test_run_local_from_remote_context() {
        let transport = MockTransport::new();
        let manager = Arc::new(ConnectionManager::new(Arc::new(transport)));
        let executor = CommandExecutor::new(manager.clone(), ExecutorConfig::default());

        let result = executor.run_local(&remote(), "echo here").await.unwrap();
        assert_eq!(result.stdout.trim(), "here");
        assert_eq!(manager.acquire_count(), 0);
    }
}
