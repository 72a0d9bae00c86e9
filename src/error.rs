//! Error types for hostrun

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Why a connection could not be established
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    /// Host name did not resolve
    Dns,
    /// Server rejected every credential we offered
    Auth,
    /// TCP connect or handshake timed out
    Timeout,
    /// Nothing listening on the port
    Refused,
    /// Any other network or protocol failure
    Network,
}

impl ConnectFailure {
    /// Whether a retry may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectFailure::Timeout | ConnectFailure::Refused | ConnectFailure::Network
        )
    }
}

impl std::fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectFailure::Dns => write!(f, "dns"),
            ConnectFailure::Auth => write!(f, "auth"),
            ConnectFailure::Timeout => write!(f, "timeout"),
            ConnectFailure::Refused => write!(f, "refused"),
            ConnectFailure::Network => write!(f, "network"),
        }
    }
}

/// hostrun error types
#[derive(Error, Debug)]
pub enum HostrunError {
    /// A task with this name is already registered
    #[error("Task '{name}' is already registered")]
    DuplicateTask { name: String },

    /// No task with this name is registered
    #[error("Unknown task '{name}'")]
    UnknownTask { name: String },

    /// Arguments do not fit the task's parameters
    #[error("Invalid arguments for task '{task}': {message}")]
    Argument { task: String, message: String },

    /// Host specification could not be parsed
    #[error("Invalid host '{spec}': {reason}")]
    InvalidHost { spec: String, reason: String },

    /// Connection could not be established
    #[error("Connection to {host} failed ({kind}): {message}")]
    Connection {
        host: String,
        kind: ConnectFailure,
        message: String,
    },

    /// Operation exceeded its deadline
    #[error("Host {host} timed out after {after:?}")]
    Timeout { host: String, after: Duration },

    /// Infrastructure failure while running a command or transferring a file
    #[error("Execution failed on {host}: {message}")]
    Execution { host: String, message: String },

    /// Local file for an upload does not exist
    #[error("Local file not found: {0}")]
    FileNotFound(PathBuf),

    /// Remote path cannot be written
    #[error("Permission denied on {host}: {path}")]
    Permission { host: String, path: String },

    /// A command exited non-zero and the task chose to treat that as fatal
    #[error("Command '{command}' exited with code {exit_code}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// Task body reported failure through its return value
    #[error("Task failed: {0}")]
    TaskFailed(String),

    /// Inventory file exceeded the size limit
    #[error("Inventory exceeds 1MB limit (size: {0} bytes)")]
    InventorySizeExceeded(usize),

    /// Too many hosts in one run
    #[error("Host count {count} exceeds limit of {limit}")]
    HostCountExceeded { count: usize, limit: usize },

    /// YAML parsing errors
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    /// Settings could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Metrics registry errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HostrunError {
    pub(crate) fn execution(host: impl ToString, message: impl Into<String>) -> Self {
        HostrunError::Execution {
            host: host.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn connection(
        host: impl ToString,
        kind: ConnectFailure,
        message: impl Into<String>,
    ) -> Self {
        HostrunError::Connection {
            host: host.to_string(),
            kind,
            message: message.into(),
        }
    }

    /// Errors raised before any host work starts; they abort the whole run
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            HostrunError::DuplicateTask { .. }
                | HostrunError::UnknownTask { .. }
                | HostrunError::Argument { .. }
                | HostrunError::InvalidHost { .. }
                | HostrunError::InventorySizeExceeded(_)
                | HostrunError::HostCountExceeded { .. }
        )
    }

    /// Connection failures worth another attempt
    pub fn is_transient(&self) -> bool {
        match self {
            HostrunError::Connection { kind, .. } => kind.is_transient(),
            _ => false,
        }
    }
}

/// Result type alias using HostrunError
pub type Result<T> = std::result::Result<T, HostrunError>;
