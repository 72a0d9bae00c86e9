//! Task runner: drives one task across a host list
//!
//! Each host moves through `Pending → Connecting → Running → Success|Failed`
//! (or `Pending → Skipped`). Hosts are isolated from each other: a failure,
//! timeout or panic on one host never stops the others.

use crate::connection::ConnectionManager;
use crate::error::{HostrunError, Result};
use crate::executors::{CommandExecutor, ExecutorConfig};
use crate::metrics::Metrics;
use crate::models::{Context, Host, HostStatus, RunOutcome, RunReport, TaskValue};
use crate::registry::{Args, BoundTask, TaskRegistry};
use crate::scope::TaskScope;
use crate::transfer::FileTransfer;
use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Default number of hosts worked on at once in parallel mode
pub const DEFAULT_MAX_PARALLEL: usize = 4;

/// Runner settings
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Work on hosts concurrently instead of one after another
    pub parallel: bool,
    pub max_parallel: usize,
    /// Time budget per host, counted from the moment it starts connecting
    pub run_timeout: Option<Duration>,
    /// Initial remote working directory for every host
    pub working_dir: Option<String>,
    /// Environment overrides applied to every command
    pub env: BTreeMap<String, String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            parallel: false,
            max_parallel: DEFAULT_MAX_PARALLEL,
            run_timeout: None,
            working_dir: None,
            env: BTreeMap::new(),
        }
    }
}

/// Pre-flight host filter; `false` skips the host
pub type HostFilter = Arc<dyn Fn(&Host) -> bool + Send + Sync>;

/// Runs registered tasks against hosts
pub struct Runner {
    registry: Arc<TaskRegistry>,
    connections: Arc<ConnectionManager>,
    config: RunnerConfig,
    executor_config: ExecutorConfig,
    filter: Option<HostFilter>,
    metrics: Option<Arc<Metrics>>,
}

impl Runner {
    pub fn new(
        registry: Arc<TaskRegistry>,
        connections: Arc<ConnectionManager>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            registry,
            connections,
            config,
            executor_config: ExecutorConfig::default(),
            filter: None,
            metrics: None,
        }
    }

    pub fn with_executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor_config = config;
        self
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Host) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Run task `name` with `args` on every host.
    ///
    /// Returns `Err` only when the task cannot be resolved; per-host
    /// failures are reported in the returned [`RunReport`], in host order.
    /// All pooled connections are closed before returning.
    pub async fn run_task(&self, name: &str, args: &Args, hosts: &[Host]) -> Result<RunReport> {
        let task = self.registry.resolve(name, args)?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();

        info!(
            "Starting task '{}' on {} host(s) (run {})",
            name,
            hosts.len(),
            run_id
        );

        let worker = HostWorker {
            run_id,
            task: Arc::new(task),
            connections: Arc::clone(&self.connections),
            executor: Arc::new(CommandExecutor::new(
                Arc::clone(&self.connections),
                self.executor_config.clone(),
            )),
            transfer: Arc::new(FileTransfer::new(Arc::clone(&self.connections))),
            run_timeout: self.config.run_timeout,
            working_dir: self.config.working_dir.clone(),
            env: self.config.env.clone(),
            filter: self.filter.clone(),
            metrics: self.metrics.clone(),
        };

        let outcomes = if self.config.parallel && hosts.len() > 1 {
            self.run_parallel(&worker, hosts).await
        } else {
            let mut outcomes = Vec::with_capacity(hosts.len());
            for host in hosts {
                outcomes.push(worker.run(host.clone()).await);
            }
            outcomes
        };

        self.connections.release_all().await;

        let report = RunReport {
            run_id,
            task: name.to_string(),
            started_at,
            duration: start.elapsed(),
            outcomes,
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_report(&report);
        }

        let failed = report.failed_hosts().len();
        if failed == 0 {
            info!("Task '{}' completed on all hosts", name);
        } else {
            error!(
                "Task '{}' failed on {} of {} host(s)",
                name,
                failed,
                report.outcomes.len()
            );
        }

        Ok(report)
    }

    async fn run_parallel(&self, worker: &HostWorker, hosts: &[Host]) -> Vec<RunOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let mut set = JoinSet::new();

        for (index, host) in hosts.iter().cloned().enumerate() {
            let worker = worker.clone();
            let semaphore = Arc::clone(&semaphore);
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                (index, worker.run(host).await)
            });
        }

        let mut slots: Vec<Option<RunOutcome>> = hosts.iter().map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, outcome)) => slots[index] = Some(outcome),
                Err(e) => error!("Host worker aborted: {}", e),
            }
        }

        slots
            .into_iter()
            .zip(hosts)
            .map(|(slot, host)| {
                slot.unwrap_or_else(|| {
                    let mut outcome = RunOutcome::pending(host.clone());
                    outcome.status = HostStatus::Failed;
                    outcome.error = Some(HostrunError::execution(host, "host worker aborted"));
                    outcome
                })
            })
            .collect()
    }
}

/// Per-run state shared by every host worker
#[derive(Clone)]
struct HostWorker {
    run_id: Uuid,
    task: Arc<BoundTask>,
    connections: Arc<ConnectionManager>,
    executor: Arc<CommandExecutor>,
    transfer: Arc<FileTransfer>,
    run_timeout: Option<Duration>,
    working_dir: Option<String>,
    env: BTreeMap<String, String>,
    filter: Option<HostFilter>,
    metrics: Option<Arc<Metrics>>,
}

impl HostWorker {
    async fn run(&self, host: Host) -> RunOutcome {
        let span = info_span!("host", run_id = %self.run_id, host = %host);
        async {
            if let Some(metrics) = &self.metrics {
                metrics.inc_active_hosts();
            }
            let outcome = self.drive(host).await;
            if let Some(metrics) = &self.metrics {
                metrics.dec_active_hosts();
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn drive(&self, host: Host) -> RunOutcome {
        let start = Instant::now();
        let mut outcome = RunOutcome::pending(host.clone());

        if let Some(filter) = &self.filter {
            if !filter(&host) {
                info!("[{}] skipped", host);
                transition(&mut outcome, HostStatus::Skipped);
                return outcome;
            }
        }

        // Queued hosts do not spend their budget waiting for earlier ones
        let deadline = self.run_timeout.map(|t| (Instant::now() + t, t));

        transition(&mut outcome, HostStatus::Connecting);
        if !host.is_local() {
            let connected = match deadline {
                Some((at, after)) => tokio::time::timeout_at(at, self.connections.acquire(&host))
                    .await
                    .unwrap_or_else(|_| Err(self.timeout_error(&host, after))),
                None => self.connections.acquire(&host).await,
            };
            if let Err(e) = connected {
                error!("[{}] {}", host, e);
                if matches!(e, HostrunError::Timeout { .. }) {
                    self.connections.release(&host).await;
                }
                return self.fail(outcome, e, start);
            }
        }

        transition(&mut outcome, HostStatus::Running);
        let mut context = Context::new(host.clone());
        context.working_dir = self.working_dir.clone();
        context.env = self.env.clone();
        let mut scope = TaskScope::new(
            context,
            Arc::clone(&self.executor),
            Arc::clone(&self.transfer),
        );

        let result = {
            let body = AssertUnwindSafe(self.task.invoke(&mut scope)).catch_unwind();
            let caught = match deadline {
                Some((at, after)) => match tokio::time::timeout_at(at, body).await {
                    Ok(caught) => caught,
                    Err(_) => Ok(Err(self.timeout_error(&host, after))),
                },
                None => body.await,
            };
            caught.unwrap_or_else(|panic| {
                Err(HostrunError::execution(
                    &host,
                    format!("task panicked: {}", panic_message(panic.as_ref())),
                ))
            })
        };

        if matches!(result, Err(HostrunError::Timeout { .. })) {
            self.connections.release(&host).await;
        }

        let (results, transfers) = scope.finish();
        outcome.results = results;
        outcome.transfers = transfers;

        match result {
            Ok(value) if value.is_success() => {
                outcome.value = Some(value);
                transition(&mut outcome, HostStatus::Success);
                outcome.duration = start.elapsed();
                info!("[{}] done in {:?}", host, outcome.duration);
                outcome
            }
            Ok(value) => {
                outcome.value = Some(value);
                let e = HostrunError::TaskFailed(failure_reason(value));
                error!("[{}] {}", host, e);
                self.fail(outcome, e, start)
            }
            Err(e) => {
                error!("[{}] {}", host, e);
                self.fail(outcome, e, start)
            }
        }
    }

    fn fail(&self, mut outcome: RunOutcome, error: HostrunError, start: Instant) -> RunOutcome {
        transition(&mut outcome, HostStatus::Failed);
        outcome.error = Some(error);
        outcome.duration = start.elapsed();
        outcome
    }

    fn timeout_error(&self, host: &Host, after: Duration) -> HostrunError {
        warn!("[{}] time budget of {:?} used up", host, after);
        HostrunError::Timeout {
            host: host.to_string(),
            after,
        }
    }
}

fn transition(outcome: &mut RunOutcome, next: HostStatus) {
    debug_assert!(
        outcome.status.can_transition_to(next),
        "illegal transition {} -> {}",
        outcome.status,
        next
    );
    debug!("[{}] {} -> {}", outcome.host, outcome.status, next);
    outcome.status = next;
}

fn failure_reason(value: TaskValue) -> String {
    match value {
        TaskValue::ExitCode(code) => format!("task returned exit code {}", code),
        _ => "task returned false".to_string(),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
