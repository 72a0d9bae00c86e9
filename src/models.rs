//! Core data models for hostrun

use crate::error::{HostrunError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

// Input validation limits
pub const MAX_INVENTORY_SIZE: usize = 1_048_576; // 1 MB
pub const MAX_HOST_COUNT: usize = 1_000;
pub const MAX_COMMAND_LEN: usize = 65_536; // 64 KB
pub const MAX_OUTPUT_SIZE: usize = 10_485_760; // 10 MB

/// Name of the pseudo-host that means "this machine"
pub const LOCAL_HOST: &str = "local";
pub const DEFAULT_SSH_PORT: u16 = 22;

/// A machine addressable for command execution
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Host {
    pub address: String,
    pub port: u16,
    pub user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>, // Private key used for auth
}

impl Host {
    pub fn new(address: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port,
            user: user.into(),
            key_path: None,
        }
    }

    /// The local pseudo-host
    pub fn local() -> Self {
        let user = std::env::var("USER").unwrap_or_default();
        Self::new(LOCAL_HOST, 0, user)
    }

    pub fn with_key_path(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    pub fn is_local(&self) -> bool {
        self.address == LOCAL_HOST
    }

    /// Key under which the connection manager pools sessions
    pub fn connection_key(&self) -> ConnectionKey {
        ConnectionKey {
            address: self.address.clone(),
            port: self.port,
            user: self.user.clone(),
        }
    }
}

impl std::fmt::Display for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_local() {
            return write!(f, "{}", LOCAL_HOST);
        }
        let address = if self.address.contains(':') {
            format!("[{}]", self.address)
        } else {
            self.address.clone()
        };
        if self.user.is_empty() {
            write!(f, "{}:{}", address, self.port)
        } else {
            write!(f, "{}@{}:{}", self.user, address, self.port)
        }
    }
}

/// Identity of a pooled connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub address: String,
    pub port: u16,
    pub user: String,
}

/// Resolved per-host execution parameters for one task invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    pub host: Host,
    /// Remote directory commands run in
    pub working_dir: Option<String>,
    /// Directory `run_local` commands run in
    pub local_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl Context {
    pub fn new(host: Host) -> Self {
        Self {
            host,
            working_dir: None,
            local_dir: None,
            env: BTreeMap::new(),
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Change the remote working directory; relative paths nest
    pub fn cd(&mut self, dir: &str) {
        self.working_dir = Some(match &self.working_dir {
            Some(current) if !dir.starts_with('/') => {
                format!("{}/{}", current.trim_end_matches('/'), dir)
            }
            _ => dir.to_string(),
        });
    }

    /// Change the local working directory; relative paths nest
    pub fn lcd(&mut self, dir: impl AsRef<Path>) {
        let dir = dir.as_ref();
        self.local_dir = Some(match &self.local_dir {
            Some(current) if dir.is_relative() => current.join(dir),
            _ => dir.to_path_buf(),
        });
    }

    /// The same context retargeted at the local pseudo-host
    pub fn for_local(&self) -> Context {
        Context {
            host: Host::local(),
            working_dir: self
                .local_dir
                .as_ref()
                .map(|dir| dir.to_string_lossy().into_owned()),
            local_dir: self.local_dir.clone(),
            env: self.env.clone(),
        }
    }
}

/// How command output streams are captured
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    #[default]
    Separate,
    /// stderr folded into stdout
    Combined,
}

/// Result of one command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    #[serde(default)]
    pub output_truncated: bool, // True if output exceeded MAX_OUTPUT_SIZE
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into `CommandFailed`
    pub fn ensure_success(self) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(HostrunError::CommandFailed {
                command: self.command,
                exit_code: self.exit_code,
                stderr: self.stderr,
            })
        }
    }
}

/// Result of one file upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub bytes: u64,
}

/// Value returned by a task body
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskValue {
    #[default]
    Done,
    Flag(bool),
    ExitCode(i32),
}

impl TaskValue {
    pub fn is_success(&self) -> bool {
        match self {
            TaskValue::Done => true,
            TaskValue::Flag(flag) => *flag,
            TaskValue::ExitCode(code) => *code == 0,
        }
    }
}

impl From<CommandResult> for TaskValue {
    fn from(result: CommandResult) -> Self {
        TaskValue::ExitCode(result.exit_code)
    }
}

/// Per-host run state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Pending,
    Connecting,
    Running,
    Success,
    Failed,
    Skipped,
}

impl HostStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HostStatus::Success | HostStatus::Failed | HostStatus::Skipped
        )
    }

    /// Legal edges of the per-host state machine
    pub fn can_transition_to(&self, next: HostStatus) -> bool {
        use HostStatus::*;
        matches!(
            (self, next),
            (Pending, Connecting)
                | (Pending, Skipped)
                | (Connecting, Running)
                | (Connecting, Failed)
                | (Running, Success)
                | (Running, Failed)
        )
    }
}

impl std::fmt::Display for HostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostStatus::Pending => write!(f, "pending"),
            HostStatus::Connecting => write!(f, "connecting"),
            HostStatus::Running => write!(f, "running"),
            HostStatus::Success => write!(f, "success"),
            HostStatus::Failed => write!(f, "failed"),
            HostStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Final per-host result of a task invocation
#[derive(Debug, Serialize)]
pub struct RunOutcome {
    pub host: Host,
    pub status: HostStatus,
    pub results: Vec<CommandResult>,
    pub transfers: Vec<TransferResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<TaskValue>,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<HostrunError>,
    pub duration: Duration,
}

impl RunOutcome {
    /// Fresh outcome for a host that has not started
    pub fn pending(host: Host) -> Self {
        Self {
            host,
            status: HostStatus::Pending,
            results: Vec::new(),
            transfers: Vec::new(),
            value: None,
            error: None,
            duration: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == HostStatus::Success
    }

    pub fn is_failed(&self) -> bool {
        self.status == HostStatus::Failed
    }

    /// Most useful stderr for a failure report
    pub fn last_stderr(&self) -> Option<&str> {
        if let Some(HostrunError::CommandFailed { stderr, .. }) = &self.error {
            return Some(stderr.as_str());
        }
        self.results
            .last()
            .map(|r| r.stderr.as_str())
            .filter(|s| !s.trim().is_empty())
    }
}

fn serialize_error<S: Serializer>(
    error: &Option<HostrunError>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match error {
        Some(e) => serializer.serialize_some(&e.to_string()),
        None => serializer.serialize_none(),
    }
}

/// Exit status reserved for failures before any host work
pub const EXIT_SETUP_FAILURE: i32 = 255;

/// Aggregate result of one `run_task`
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub task: String,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub outcomes: Vec<RunOutcome>,
}

impl RunReport {
    /// True iff every non-skipped host succeeded
    pub fn is_success(&self) -> bool {
        self.outcomes
            .iter()
            .all(|o| o.status != HostStatus::Failed)
    }

    pub fn failed_hosts(&self) -> Vec<&Host> {
        self.outcomes
            .iter()
            .filter(|o| o.is_failed())
            .map(|o| &o.host)
            .collect()
    }

    pub fn outcome_for(&self, host: &Host) -> Option<&RunOutcome> {
        self.outcomes.iter().find(|o| &o.host == host)
    }

    /// 0 on success, else the failed host count (254 max)
    pub fn exit_code(&self) -> i32 {
        let failed = self.failed_hosts().len();
        failed.min(EXIT_SETUP_FAILURE as usize - 1) as i32
    }
}
