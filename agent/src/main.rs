//! Worker and collective-worker runtime.
//!
//! Brings up one rank, classified by `shared::runner::Runner::run` into
//! either a plain worker or a collective worker, and drives it through a
//! handful of example calls using a minimal local driver standing in for
//! the controller/broker peer it would normally talk to. In a real
//! deployment that peer is a `server` process talking over the same
//! substrate; here, with everything in one process, the driver is inlined
//! so this binary can be exercised standalone.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tracing::info;

mod collective_worker;
mod worker;

use collective_worker::CollectiveWorker;
use shared::transport::{InProcessCollective, Mesh, MergedComm};
use shared::{BootstrapInfo, CollectiveMode, KwArgs, Message, Runner, RunnerConfig, StaticRegistry};
use worker::Worker;

/// Which role this process's demo plays. The real classification inside
/// library code happens via `RunnerConfig` and the rank/spawned status
/// `Runner::run` is given, not via this flag — it only picks which of the
/// two roles `agent` can demonstrate locally (`Controller`/`CollectiveBroker`
/// live in the `server` binary and are never reachable from here).
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum DemoRole {
    Worker,
    CollectiveWorker,
}

/// Command-line arguments for the worker runtime.
#[derive(Parser, Debug)]
#[command(name = "agent")]
#[command(about = "Worker for a named-call dispatch runtime", long_about = None)]
struct CliArgs {
    /// Path to the runner configuration file (TOML).
    #[arg(value_name = "CONFIG_FILE")]
    config_file: PathBuf,

    /// Rank this demo process plays, fed into bootstrap classification.
    #[arg(long = "rank", default_value_t = 1)]
    rank: usize,

    /// Which demo role to bring up against the in-process mesh.
    #[arg(long = "role", value_enum, default_value_t = DemoRole::Worker)]
    role: DemoRole,

    /// Number of example calls the local demo driver submits.
    #[arg(long = "calls", default_value_t = 4)]
    calls: usize,
}

fn example_registry(module_name: &str) -> StaticRegistry {
    let mut registry = StaticRegistry::new();
    registry.register(module_name, "square", |args, _kwargs| {
        let n = args
            .first()
            .and_then(|v| v.as_f64())
            .ok_or_else(|| anyhow::anyhow!("square expects one numeric argument"))?;
        Ok(json!(n * n))
    });
    registry
}

/// Brings up a plain `Worker` and drives it through `calls` example tasks
/// via an inlined local controller stand-in. If the worker dies with an
/// error, `abort` is called so a real controller parked in `get_result`
/// would be unblocked by the broadcasted `Exit` rather than hang forever.
async fn run_worker_demo(registry: Arc<StaticRegistry>, module_name: String, calls: usize) -> Result<()> {
    let (_mesh, driver, mut worker_channels) = Mesh::new_world(1);
    let worker_channel = worker_channels.remove(0);

    let mut worker = Worker::new(Arc::new(worker_channel), registry);
    let worker_handle = tokio::spawn(async move {
        let result = worker.serve().await;
        if result.is_err() {
            worker.abort().await;
        }
        result
    });

    for i in 0..calls {
        let (_source, msg) = loop {
            if let Some(m) = driver.try_recv().await {
                break m;
            }
            tokio::time::sleep(shared::POLL_BACKOFF / 10).await;
        };
        if !matches!(msg, Message::Ready) {
            anyhow::bail!("worker did not announce readiness before task {i}");
        }

        driver
            .send(
                1,
                Message::Task(shared::protocol::TaskDescriptor {
                    task_id: i as u64,
                    symbol_name: "square".to_string(),
                    module_name: module_name.clone(),
                    args: vec![json!(i as f64)],
                    kwargs: KwArgs::new(),
                    time_est: 1.0,
                    collective_mode: None,
                }),
            )
            .await?;

        let (_source, msg) = loop {
            if let Some(m) = driver.try_recv().await {
                break m;
            }
            tokio::time::sleep(shared::POLL_BACKOFF / 10).await;
        };
        match msg {
            Message::Done(record) => {
                info!(
                    task_id = record.task_id,
                    result = %record.value.as_single().cloned().unwrap_or_default(),
                    "collected result"
                );
            }
            other => anyhow::bail!("unexpected message from worker: {:?}", other.tag()),
        }
    }

    driver.send(1, Message::Exit).await?;
    worker_handle.await??;
    Ok(())
}

/// Brings up a `CollectiveWorker` inside a two-rank sub-group and drives it
/// through `calls` rounds of scatter/gather, playing the broker's root side
/// locally instead of importing the real `CollectiveBroker` (which lives in
/// the `server` crate that `agent` never depends on).
async fn run_collective_worker_demo(
    registry: Arc<StaticRegistry>,
    module_name: String,
    calls: usize,
) -> Result<()> {
    let group = InProcessCollective::new_group(2);
    let root = MergedComm::new(0, group.clone());
    let worker_comm = MergedComm::new(1, group);

    let mut worker = CollectiveWorker::new(worker_comm, registry, 0);
    let worker_handle = tokio::spawn(async move { worker.serve().await });

    for i in 0..calls {
        root.barrier().await;
        let descriptor = shared::protocol::TaskDescriptor {
            task_id: i as u64,
            symbol_name: "square".to_string(),
            module_name: module_name.clone(),
            args: vec![json!(i as f64)],
            kwargs: KwArgs::new(),
            time_est: 1.0,
            collective_mode: Some(CollectiveMode::Gather),
        };
        root.scatter(Some(vec![descriptor.clone(), descriptor])).await;

        root.barrier().await;
        let gathered = root
            .gather((None, None))
            .await
            .expect("root must see the full gather");
        let (value, _) = gathered[1].clone();
        info!(
            task_id = i as u64,
            result = %value.unwrap_or_default(),
            "collected result"
        );
    }

    root.barrier().await;
    root.scatter(Some(vec![
        shared::protocol::TaskDescriptor::exit_sentinel(),
        shared::protocol::TaskDescriptor::exit_sentinel(),
    ]))
    .await;

    worker_handle.await??;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("agent=info,shared=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli_args = CliArgs::parse();
    let config = RunnerConfig::load(&cli_args.config_file)
        .await
        .with_context(|| format!("failed to load {}", cli_args.config_file.display()))?;
    info!(?config, rank = cli_args.rank, "starting worker runtime");

    let registry = Arc::new(example_registry(&config.module_name));
    let spawned = matches!(cli_args.role, DemoRole::CollectiveWorker);
    let bootstrap = BootstrapInfo::new(cli_args.rank, 2, spawned);
    let module_name = config.module_name.clone();
    let calls = cli_args.calls;

    Runner::run(
        bootstrap,
        &config,
        |info| {
            Box::pin(async move {
                anyhow::bail!(
                    "rank {} classified as Controller; that role lives in the server binary",
                    info.rank
                )
            })
        },
        {
            let registry = registry.clone();
            let module_name = module_name.clone();
            move |_info| Box::pin(async move { run_worker_demo(registry, module_name, calls).await })
        },
        |info| {
            Box::pin(async move {
                anyhow::bail!(
                    "rank {} classified as CollectiveBroker; that role lives in the server binary",
                    info.rank
                )
            })
        },
        move |_info| Box::pin(async move { run_collective_worker_demo(registry, module_name, calls).await }),
    )
    .await
}
