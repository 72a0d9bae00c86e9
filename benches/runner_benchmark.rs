use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use hostrun::connection::{Connection, ConnectionManager, RawOutput, Transport};
use hostrun::error::Result;
use hostrun::models::{Host, TaskValue};
use hostrun::registry::{Args, BoundArgs, Param, TaskFuture, TaskRegistry};
use hostrun::runner::{Runner, RunnerConfig};
use hostrun::scope::TaskScope;
use std::path::Path;
use std::sync::Arc;
use tokio::runtime::Runtime;

/// Transport answering instantly, to measure runner overhead alone
struct InstantTransport;

struct InstantConnection;

#[async_trait]
impl Transport for InstantTransport {
    async fn connect(&self, _host: &Host) -> Result<Box<dyn Connection>> {
        Ok(Box::new(InstantConnection))
    }
}

#[async_trait]
impl Connection for InstantConnection {
    async fn exec(&mut self, _command_line: &str) -> Result<RawOutput> {
        Ok(RawOutput::default())
    }

    async fn upload(&mut self, _local_path: &Path, _remote_path: &str) -> Result<u64> {
        Ok(0)
    }

    async fn is_dir(&mut self, _remote_path: &str) -> Result<bool> {
        Ok(false)
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

fn uname<'a>(scope: &'a mut TaskScope, _: &'a BoundArgs) -> TaskFuture<'a> {
    Box::pin(async move {
        Ok(scope.run("uname -a").await?.into())
    })
}

fn registry() -> Arc<TaskRegistry> {
    let mut registry = TaskRegistry::new();
    registry.register_fn("uname", vec![], uname).unwrap();
    registry
        .register_fn(
            "hello",
            vec![
                Param::required("name"),
                Param::required("surname"),
                Param::optional("treat", "Sr"),
            ],
            |_, _| Box::pin(async { Ok(TaskValue::Done) }),
        )
        .unwrap();
    Arc::new(registry)
}

fn hosts(count: usize) -> Vec<Host> {
    (0..count)
        .map(|i| Host::new(format!("web{}", i), 22, "deploy"))
        .collect()
}

/// Benchmark argument binding
fn bench_resolve(c: &mut Criterion) {
    let registry = registry();
    let args = Args::parse(["Lluc", "surname=Ferrer"]).unwrap();

    c.bench_function("resolve_hello", |b| {
        b.iter(|| registry.resolve(black_box("hello"), black_box(&args)).unwrap())
    });
}

/// Benchmark a full run across growing host lists
fn bench_run_task(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("run_task");

    for count in [1, 10, 100] {
        let targets = hosts(count);

        for parallel in [false, true] {
            let label = if parallel { "parallel" } else { "sequential" };
            group.bench_with_input(BenchmarkId::new(label, count), &targets, |b, targets| {
                b.iter(|| {
                    rt.block_on(async {
                        let manager = ConnectionManager::new(Arc::new(InstantTransport));
                        let config = RunnerConfig {
                            parallel,
                            ..RunnerConfig::default()
                        };
                        let runner = Runner::new(registry(), Arc::new(manager), config);
                        let report = runner
                            .run_task("uname", &Args::new(), black_box(targets))
                            .await
                            .unwrap();
                        assert!(report.is_success());
                    })
                });
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_resolve, bench_run_task);
criterion_main!(benches);
