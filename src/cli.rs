//! CLI interface for hostrun

use crate::config::Settings;
use crate::connection::ConnectionManager;
use crate::executors::ssh::SshTransport;
use crate::inventory::{merge_hosts, parse_host_list, parse_inventory_file};
use crate::logging::{init_logging, LogConfig};
use crate::metrics::Metrics;
use crate::models::{ConnectionKey, Host, HostStatus, RunReport};
use crate::registry::{Args, TaskRegistry};
use crate::runner::Runner;
use crate::tasks::register_builtin;
use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// hostrun - run named tasks against remote hosts
#[derive(Parser, Debug)]
#[command(name = "hostrun")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run named tasks against remote hosts over SSH or locally", long_about = None)]
pub struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn", global = true)]
    pub log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty", global = true)]
    pub log_format: String,

    /// Settings file (YAML, TOML or JSON)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a task: `hostrun run hello Lluc Ferrer treat=Dr`
    Run(RunArgs),

    /// List registered tasks
    List,

    /// Show the hosts a run would target
    Hosts {
        #[command(flatten)]
        selection: HostSelection,
    },
}

/// Host selection flags; each overrides the matching setting
#[derive(clap::Args, Debug, Default, Clone)]
pub struct HostSelection {
    /// Comma-separated hosts (`user@host:port`, `host`, `local`)
    #[arg(short = 'H', long, value_delimiter = ',')]
    pub hosts: Vec<String>,

    /// YAML inventory file
    #[arg(short, long)]
    pub inventory: Option<PathBuf>,

    /// Default SSH user
    #[arg(short, long)]
    pub user: Option<String>,

    /// Default SSH port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Comma-separated hosts to skip
    #[arg(short = 'x', long = "exclude", value_delimiter = ',')]
    pub exclude: Vec<String>,
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Task name
    pub task: String,

    /// Task arguments: `value` or `name=value`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,

    #[command(flatten)]
    pub selection: HostSelection,

    /// Work on hosts concurrently
    #[arg(short = 'P', long)]
    pub parallel: bool,

    /// Upper bound on concurrent hosts
    #[arg(long)]
    pub max_parallel: Option<usize>,

    /// Deadline for the whole run, in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Print the run report as JSON
    #[arg(long)]
    pub json: bool,

    /// Write Prometheus metrics to this file after the run
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,
}

impl HostSelection {
    fn apply(&self, settings: &mut Settings) {
        if !self.hosts.is_empty() {
            settings.hosts = self.hosts.clone();
        }
        if let Some(inventory) = &self.inventory {
            settings.inventory = Some(inventory.clone());
        }
        if let Some(user) = &self.user {
            settings.user = user.clone();
        }
        if let Some(port) = self.port {
            settings.port = port;
        }
        if !self.exclude.is_empty() {
            settings.exclude_hosts = self.exclude.clone();
        }
    }
}

impl Cli {
    /// Initialize logging based on CLI arguments
    pub fn init_logging(&self) -> anyhow::Result<()> {
        let config = LogConfig {
            level: self.log_level.as_str().into(),
            format: self.log_format.as_str().into(),
        };

        init_logging(&config)
    }

    /// Execute the CLI command, returning the process exit status
    pub async fn execute(&self) -> anyhow::Result<i32> {
        match &self.command {
            Commands::Run(args) => self.run_task(args).await,
            Commands::List => {
                self.list_tasks()?;
                Ok(0)
            }
            Commands::Hosts { selection } => {
                self.show_hosts(selection)?;
                Ok(0)
            }
        }
    }

    fn load_settings(&self, selection: &HostSelection) -> anyhow::Result<Settings> {
        let mut settings = Settings::load(self.config.as_deref())?;
        selection.apply(&mut settings);
        debug!("Settings: {:?}", settings);
        Ok(settings)
    }

    async fn run_task(&self, run: &RunArgs) -> anyhow::Result<i32> {
        let mut settings = self.load_settings(&run.selection)?;
        if run.parallel {
            settings.parallel = true;
        }
        if let Some(max) = run.max_parallel {
            settings.max_parallel = max;
        }
        if let Some(timeout) = run.timeout {
            settings.run_timeout = Some(timeout);
        }

        let hosts = target_hosts(&settings)?;
        let excluded = excluded_keys(&settings)?;
        let args = Args::parse(&run.args)?;

        let mut registry = TaskRegistry::new();
        register_builtin(&mut registry)?;

        let mut transport = SshTransport::new(settings.connect_timeout());
        if let Some(key) = &settings.key_path {
            transport = transport.with_default_key(key);
        }
        let connections =
            ConnectionManager::with_retry(Arc::new(transport), settings.retry_config());
        let metrics = Arc::new(Metrics::new()?);

        let runner = Runner::new(
            Arc::new(registry),
            Arc::new(connections),
            settings.runner_config()?,
        )
        .with_executor_config(settings.executor_config())
        .with_metrics(Arc::clone(&metrics))
        .with_filter(move |host: &Host| !excluded.contains(&host.connection_key()));

        info!("Running '{}' on {} host(s)", run.task, hosts.len());
        let report = runner.run_task(&run.task, &args, &hosts).await?;

        if run.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print_summary(&report);
        }

        if let Some(path) = &run.metrics_file {
            std::fs::write(path, metrics.render()?)?;
            info!("Metrics written to {}", path.display());
        }

        Ok(report.exit_code())
    }

    fn list_tasks(&self) -> anyhow::Result<()> {
        let mut registry = TaskRegistry::new();
        register_builtin(&mut registry)?;

        println!("Available tasks:\n");
        let width = registry
            .tasks()
            .map(|t| t.signature().len())
            .max()
            .unwrap_or(0);
        for task in registry.tasks() {
            println!(
                "    {:<width$}  {}",
                task.signature(),
                task.description.as_deref().unwrap_or(""),
                width = width
            );
        }
        Ok(())
    }

    fn show_hosts(&self, selection: &HostSelection) -> anyhow::Result<()> {
        let settings = self.load_settings(selection)?;
        let excluded = excluded_keys(&settings)?;

        for host in target_hosts(&settings)? {
            if excluded.contains(&host.connection_key()) {
                println!("{} (excluded)", host);
            } else {
                println!("{}", host);
            }
        }
        Ok(())
    }
}

/// Hosts from `--hosts` and the inventory; the local host when both are empty
fn target_hosts(settings: &Settings) -> anyhow::Result<Vec<Host>> {
    let defaults = settings.host_defaults();
    let mut groups = vec![parse_host_list(&settings.hosts, &defaults)?];
    if let Some(path) = &settings.inventory {
        groups.push(parse_inventory_file(path, &defaults)?);
    }

    let mut hosts = merge_hosts(groups)?;
    if hosts.is_empty() {
        hosts.push(Host::local());
    }
    Ok(hosts)
}

fn excluded_keys(settings: &Settings) -> anyhow::Result<HashSet<ConnectionKey>> {
    let hosts = parse_host_list(&settings.exclude_hosts, &settings.host_defaults())?;
    Ok(hosts.iter().map(Host::connection_key).collect())
}

fn print_summary(report: &RunReport) {
    println!();
    for outcome in &report.outcomes {
        match outcome.status {
            HostStatus::Success => {
                println!("[{}] success ({:.2}s)", outcome.host, outcome.duration.as_secs_f64())
            }
            HostStatus::Skipped => println!("[{}] skipped", outcome.host),
            _ => {
                let reason = outcome
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| outcome.status.to_string());
                println!("[{}] FAILED: {}", outcome.host, reason);
                if let Some(stderr) = outcome.last_stderr() {
                    for line in stderr.lines() {
                        println!("[{}]     {}", outcome.host, line);
                    }
                }
            }
        }
    }

    let failed = report.failed_hosts().len();
    if failed == 0 {
        println!("\nDone.");
    } else {
        println!("\n{} of {} host(s) failed.", failed, report.outcomes.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_command() {
        let cli = Cli::try_parse_from([
            "hostrun",
            "run",
            "hello",
            "-H",
            "web1,deploy@web2:2222",
            "-P",
            "--timeout",
            "30",
            "Lluc",
            "Ferrer",
            "treat=Dr",
        ])
        .unwrap();

        match cli.command {
            Commands::Run(run) => {
                assert_eq!(run.task, "hello");
                assert_eq!(run.args, vec!["Lluc", "Ferrer", "treat=Dr"]);
                assert_eq!(run.selection.hosts, vec!["web1", "deploy@web2:2222"]);
                assert!(run.parallel);
                assert_eq!(run.timeout, Some(30));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_global_flags() {
        let cli = Cli::try_parse_from([
            "hostrun",
            "list",
            "--log-level",
            "debug",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.log_level, "debug");
        assert_eq!(cli.log_format, "json");
        assert!(matches!(cli.command, Commands::List));
    }

    #[test]
    fn test_selection_overrides_settings() {
        let mut settings = Settings::default();
        let selection = HostSelection {
            hosts: vec!["doble.me".to_string()],
            user: Some("lordferatum".to_string()),
            port: Some(2222),
            ..HostSelection::default()
        };
        selection.apply(&mut settings);

        let hosts = target_hosts(&settings).unwrap();
        assert_eq!(hosts, vec![Host::new("doble.me", 2222, "lordferatum")]);
    }

    #[test]
    fn test_empty_selection_targets_local() {
        let settings = Settings::default();
        assert_eq!(target_hosts(&settings).unwrap(), vec![Host::local()]);
    }

    #[test]
    fn test_excluded_keys() {
        let settings = Settings {
            user: "deploy".to_string(),
            exclude_hosts: vec!["db1".to_string()],
            ..Settings::default()
        };
        let excluded = excluded_keys(&settings).unwrap();
        assert!(excluded.contains(&Host::new("db1", 22, "deploy").connection_key()));
        assert!(!excluded.contains(&Host::new("web1", 22, "deploy").connection_key()));
    }
}
