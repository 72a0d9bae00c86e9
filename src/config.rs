//! Layered settings: defaults, optional file, then `HOSTRUN_*` environment
//!
//! ```text
//! HOSTRUN_HOSTS=web1,deploy@web2:2222 HOSTRUN_PARALLEL=true hostrun run uname
//! HOSTRUN_ENV=APP_ENV=prod,RUST_LOG=debug hostrun run deploy_script
//! ```
//!
//! Environment overrides are `NAME=value` list entries rather than a map:
//! `config` folds map keys to lower case, list values keep theirs.

use crate::error::{HostrunError, Result};
use crate::executors::ExecutorConfig;
use crate::inventory::HostDefaults;
use crate::models::{OutputMode, DEFAULT_SSH_PORT};
use crate::retry::{RetryConfig, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_MS};
use crate::runner::{RunnerConfig, DEFAULT_MAX_PARALLEL};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of every settings environment variable
pub const ENV_PREFIX: &str = "HOSTRUN";

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Process-wide settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub hosts: Vec<String>,
    pub exclude_hosts: Vec<String>,
    pub inventory: Option<PathBuf>,
    pub user: String,
    pub port: u16,
    pub key_path: Option<PathBuf>,
    /// Seconds
    pub connect_timeout: u64,
    pub connect_retries: u32,
    pub retry_delay_ms: u64,
    /// Seconds
    pub command_timeout: Option<u64>,
    /// Seconds
    pub run_timeout: Option<u64>,
    pub parallel: bool,
    pub max_parallel: usize,
    pub output: OutputMode,
    pub working_dir: Option<String>,
    /// `NAME=value` overrides exported before every command
    pub env: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        let defaults = HostDefaults::default();
        Self {
            hosts: Vec::new(),
            exclude_hosts: Vec::new(),
            inventory: None,
            user: defaults.user,
            port: DEFAULT_SSH_PORT,
            key_path: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT_SECS,
            connect_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            command_timeout: None,
            run_timeout: None,
            parallel: false,
            max_parallel: DEFAULT_MAX_PARALLEL,
            output: OutputMode::default(),
            working_dir: None,
            env: Vec::new(),
        }
    }
}

impl Settings {
    /// Load settings from an optional file and the process environment.
    ///
    /// The file format follows its extension (`.yaml`, `.toml`, `.json`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Like [`Settings::load`], reading variables from `env` instead of
    /// the process environment
    pub fn load_with_env(
        path: Option<&Path>,
        env: Option<config::Map<String, String>>,
    ) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("hosts")
                .with_list_parse_key("exclude_hosts")
                .with_list_parse_key("env")
                .source(env),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.env_vars()?;
        Ok(settings)
    }

    pub fn host_defaults(&self) -> HostDefaults {
        HostDefaults {
            user: self.user.clone(),
            port: self.port,
            key_path: self.key_path.clone(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(
            self.connect_retries,
            Duration::from_millis(self.retry_delay_ms),
        )
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            output: self.output,
            command_timeout: self.command_timeout.map(Duration::from_secs),
        }
    }

    /// Split the `env` entries into names and values
    pub fn env_vars(&self) -> Result<BTreeMap<String, String>> {
        self.env
            .iter()
            .map(|entry| match entry.split_once('=') {
                Some((name, value)) if !name.trim().is_empty() => {
                    Ok((name.trim().to_string(), value.to_string()))
                }
                _ => Err(HostrunError::Config(ConfigError::Message(format!(
                    "invalid env entry '{}': expected NAME=value",
                    entry
                )))),
            })
            .collect()
    }

    pub fn runner_config(&self) -> Result<RunnerConfig> {
        Ok(RunnerConfig {
            parallel: self.parallel,
            max_parallel: self.max_parallel,
            run_timeout: self.run_timeout.map(Duration::from_secs),
            working_dir: self.working_dir.clone(),
            env: self.env_vars()?,
        })
    }
}
