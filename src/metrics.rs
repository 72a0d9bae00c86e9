//! Prometheus metrics for task runs
//!
//! Metrics live in a private registry and are rendered in the text
//! exposition format, suitable for a node-exporter textfile collector.
//!
//! # Available Metrics
//!
//! - `hostrun_host_runs_total{task, status}` - Counter of per-host runs by terminal status
//! - `hostrun_commands_total{location, outcome}` - Counter of commands by
//!   location (`local`, `remote`) and outcome (`success`, `nonzero`)
//! - `hostrun_command_duration_seconds{location}` - Histogram of command durations
//! - `hostrun_bytes_transferred_total` - Counter of uploaded bytes
//! - `hostrun_active_hosts` - Gauge of hosts currently being worked on
//!
//! # Example
//!
//! ```
//! use hostrun::metrics::Metrics;
//!
//! let metrics = Metrics::new()?;
//! metrics.record_host_run("deploy_script", "success");
//! assert!(metrics.render()?.contains("hostrun_host_runs_total"));
//! # Ok::<(), hostrun::error::HostrunError>(())
//! ```

use crate::error::Result;
use crate::models::{CommandResult, HostStatus, RunReport, TransferResult};
use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, IntCounter, Opts, Registry,
    TextEncoder,
};

/// Histogram bucket boundaries for command duration metrics (in seconds)
const COMMAND_DURATION_BUCKETS: &[f64] = &[0.01, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 300.0];

/// Run metrics
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    host_runs: CounterVec,
    commands: CounterVec,
    command_duration: HistogramVec,
    bytes_transferred: IntCounter,
    active_hosts: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let host_runs = CounterVec::new(
            Opts::new("hostrun_host_runs_total", "Total number of per-host task runs"),
            &["task", "status"],
        )?;

        let commands = CounterVec::new(
            Opts::new("hostrun_commands_total", "Total number of commands executed"),
            &["location", "outcome"],
        )?;

        let command_duration = HistogramVec::new(
            HistogramOpts::new(
                "hostrun_command_duration_seconds",
                "Command execution duration in seconds",
            )
            .buckets(COMMAND_DURATION_BUCKETS.to_vec()),
            &["location"],
        )?;

        let bytes_transferred = IntCounter::with_opts(Opts::new(
            "hostrun_bytes_transferred_total",
            "Total bytes uploaded to hosts",
        ))?;

        let active_hosts =
            Gauge::with_opts(Opts::new("hostrun_active_hosts", "Hosts currently running"))?;

        registry.register(Box::new(host_runs.clone()))?;
        registry.register(Box::new(commands.clone()))?;
        registry.register(Box::new(command_duration.clone()))?;
        registry.register(Box::new(bytes_transferred.clone()))?;
        registry.register(Box::new(active_hosts.clone()))?;

        Ok(Self {
            registry,
            host_runs,
            commands,
            command_duration,
            bytes_transferred,
            active_hosts,
        })
    }

    /// Record a host reaching a terminal status
    pub fn record_host_run(&self, task: &str, status: &str) {
        self.host_runs.with_label_values(&[task, status]).inc();
    }

    /// Record a finished command
    ///
    /// * `location` - `local` or `remote`
    pub fn record_command(&self, location: &str, result: &CommandResult) {
        let outcome = if result.success() { "success" } else { "nonzero" };
        self.commands.with_label_values(&[location, outcome]).inc();
        self.command_duration
            .with_label_values(&[location])
            .observe(result.duration.as_secs_f64());
    }

    pub fn record_transfer(&self, transfer: &TransferResult) {
        self.bytes_transferred.inc_by(transfer.bytes);
    }

    /// Record every host outcome of a finished run
    pub fn record_report(&self, report: &RunReport) {
        for outcome in &report.outcomes {
            self.record_host_run(&report.task, &outcome.status.to_string());
            if outcome.status == HostStatus::Skipped {
                continue;
            }
            let location = if outcome.host.is_local() {
                "local"
            } else {
                "remote"
            };
            for result in &outcome.results {
                self.record_command(location, result);
            }
            for transfer in &outcome.transfers {
                self.record_transfer(transfer);
            }
        }
    }

    pub fn inc_active_hosts(&self) {
        self.active_hosts.inc();
    }

    pub fn dec_active_hosts(&self) {
        self.active_hosts.dec();
    }

    /// Text exposition of every metric
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
