//! Controller and collective-broker runtime.
//!
//! Brings up the controller on rank 0 and, for every other rank, lets
//! `shared::runner::Runner::run` classify that rank and dispatch into either
//! a small in-process demo worker (or, when the config calls for spawned
//! sub-groups, a demo collective broker plus its collective workers), then
//! submits a handful of example calls and prints the run report.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tracing::{error, info};

mod broker;
mod controller;
#[cfg(test)]
mod tests;

use broker::CollectiveBroker;
use controller::Controller;
use shared::transport::{InProcessCollective, Mesh, MergedComm, RankChannel};
use shared::{
    BootstrapInfo, CollectiveMode, KwArgs, Message, NameResolver, Runner, RunnerConfig,
    StaticRegistry, Transport,
};

/// Command-line arguments for the controller runtime.
#[derive(Parser, Debug)]
#[command(name = "server")]
#[command(about = "Controller for a named-call dispatch runtime", long_about = None)]
struct CliArgs {
    /// Path to the runner configuration file (TOML).
    #[arg(value_name = "CONFIG_FILE")]
    config_file: PathBuf,

    /// Number of plain worker ranks to bring up for this run. Zero runs
    /// every call synchronously on the controller itself.
    #[arg(long = "workers", default_value_t = 2)]
    workers: usize,

    /// Number of example calls to submit.
    #[arg(long = "calls", default_value_t = 6)]
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

/// A minimal worker loop for the controller binary's self-contained demo.
/// The full worker state machine, with its own tests, lives in the agent
/// binary; this is just enough to give the scheduler something to talk to.
async fn demo_worker_loop(transport: Arc<dyn Transport>, resolver: Arc<dyn NameResolver>) {
    let rank = transport.rank();
    loop {
        if transport.send(0, Message::Ready).await.is_err() {
            return;
        }
        let Some((_source, message)) = shared::poll_or_backoff(transport.as_ref()).await else {
            continue;
        };
        match message {
            Message::Exit => {
                info!(rank, "demo worker exiting");
                return;
            }
            Message::Task(descriptor) => {
                let Ok(invocable) = resolver.resolve(&descriptor.module_name, &descriptor.symbol_name)
                else {
                    error!(rank, "demo worker: unresolvable call");
                    return;
                };
                let call_start = Instant::now();
                let value = match invocable(descriptor.args, descriptor.kwargs) {
                    Ok(v) => v,
                    Err(e) => {
                        error!(rank, "demo worker call failed: {e}");
                        return;
                    }
                };
                let this_time = call_start.elapsed().as_secs_f64();
                let stats = shared::StatsRecord {
                    task_id: descriptor.task_id,
                    rank,
                    this_time,
                    time_over_est: this_time / descriptor.time_est,
                    n_processed: 1,
                    total_time: this_time,
                };
                let _ = transport
                    .send(
                        0,
                        Message::Done(shared::ResultRecord {
                            task_id: descriptor.task_id,
                            value: shared::ResultValue::Single(value),
                            stats,
                        }),
                    )
                    .await;
            }
            _ => return,
        }
    }
}

/// Stands in for a `CollectiveWorker` spawned by a demo broker's sub-group:
/// scatter in, compute, gather out, until the exit sentinel arrives. The
/// real implementation, with its own tests, lives in the agent binary. Also
/// reused directly by this crate's own tests, so there is exactly one copy
/// of this loop rather than one per call site.
async fn demo_collective_worker_loop(merged: MergedComm, resolver: Arc<dyn NameResolver>) {
    loop {
        merged.barrier().await;
        let descriptor = merged.scatter(None).await;
        if descriptor.is_exit_sentinel() {
            return;
        }
        match descriptor.collective_mode {
            Some(CollectiveMode::Gather) => {}
            other => {
                error!(mode = ?other, "collective worker: unsupported collective mode");
                return;
            }
        }
        let Ok(invocable) = resolver.resolve(&descriptor.module_name, &descriptor.symbol_name)
        else {
            return;
        };
        let call_start = Instant::now();
        let Ok(value) = invocable(descriptor.args, descriptor.kwargs) else {
            return;
        };
        let this_time = call_start.elapsed().as_secs_f64();
        let stats = shared::StatsRecord {
            task_id: descriptor.task_id,
            rank: merged.merged_rank,
            this_time,
            time_over_est: this_time / descriptor.time_est,
            n_processed: 1,
            total_time: this_time,
        };
        merged.barrier().await;
        merged.gather((Some(value), Some(stats))).await;
    }
}

/// Drives a single worker rank's classified role: a plain demo worker, or a
/// demo collective broker plus the sub-group it spawns. `classify` never
/// produces `Controller`/`CollectiveWorker` here since this rank is neither
/// rank 0 nor itself spawned, but `Runner::run` is the real dispatch either
/// way — those two branches exist only to make that explicit.
async fn run_worker_rank(
    bootstrap: BootstrapInfo,
    config: RunnerConfig,
    channel: RankChannel,
    registry: Arc<StaticRegistry>,
) -> Result<()> {
    let transport: Arc<dyn Transport> = Arc::new(channel);
    Runner::run(
        bootstrap,
        &config,
        |info| {
            Box::pin(async move {
                anyhow::bail!(
                    "rank {} classified as Controller; only rank 0 plays that role",
                    info.rank
                )
            })
        },
        {
            let transport = transport.clone();
            let registry = registry.clone();
            move |_info| Box::pin(async move { Ok(demo_worker_loop(transport, registry).await) })
        },
        {
            let nprocs_per_worker = config.nprocs_per_worker;
            let broker_is_worker = config.broker_is_worker;
            let registry = registry.clone();
            move |_info| {
                Box::pin(async move {
                    let group = InProcessCollective::new_group(nprocs_per_worker);
                    let maxprocs = if broker_is_worker {
                        nprocs_per_worker - 1
                    } else {
                        nprocs_per_worker
                    };
                    for sub_rank in 1..=maxprocs {
                        let merged = MergedComm::new(sub_rank, group.clone());
                        tokio::spawn(demo_collective_worker_loop(merged, registry.clone()));
                    }
                    let broker_merged = MergedComm::new(0, group);
                    let mut broker =
                        CollectiveBroker::new(transport, broker_merged, registry, broker_is_worker);
                    broker.serve().await.map_err(anyhow::Error::from)
                })
            }
        },
        |info| {
            Box::pin(async move {
                anyhow::bail!(
                    "rank {} classified as CollectiveWorker; this binary never spawns itself",
                    info.rank
                )
            })
        },
    )
    .await
}

/// Submits `calls` example calls through `controller`, collects every
/// result, then tells every worker to exit and logs the final report.
async fn run_controller_demo(mut controller: Controller, module_name: String, calls: usize) -> Result<()> {
    let mut task_ids = Vec::with_capacity(calls);
    for i in 0..calls {
        let task_id = controller
            .submit_call(
                "square",
                vec![json!(i as f64)],
                KwArgs::new(),
                module_name.clone(),
                1.0,
                None,
            )
            .await?;
        task_ids.push(task_id);
    }

    for task_id in task_ids {
        let (_, value) = controller.get_result(task_id).await?;
        info!(task_id, result = %value.as_single().cloned().unwrap_or_default(), "collected result");
    }

    controller.exit().await?;
    let report = controller.info();
    info!(?report, "run complete");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("server=info,shared=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli_args = CliArgs::parse();
    let config = RunnerConfig::load(&cli_args.config_file)
        .await
        .with_context(|| format!("failed to load {}", cli_args.config_file.display()))?;
    info!(?config, workers = cli_args.workers, "starting controller runtime");

    let registry = Arc::new(example_registry(&config.module_name));

    if cli_args.workers == 0 {
        let controller = Controller::standalone(registry.clone());
        return run_controller_demo(controller, config.module_name.clone(), cli_args.calls).await;
    }

    let (_mesh, controller_channel, worker_channels) = Mesh::new_world(cli_args.workers);
    let worker_ranks: Vec<_> = (1..=cli_args.workers).collect();
    let world_size = cli_args.workers + 1;

    for (rank, channel) in worker_ranks.iter().copied().zip(worker_channels) {
        let bootstrap = BootstrapInfo::new(rank, world_size, false);
        let config = config.clone();
        let registry = registry.clone();
        tokio::spawn(async move {
            if let Err(e) = run_worker_rank(bootstrap, config, channel, registry).await {
                error!(rank, "rank exited with error: {e}");
            }
        });
    }

    let controller_bootstrap = BootstrapInfo::new(0, world_size, false);
    let controller = Controller::new(Arc::new(controller_channel), registry, &worker_ranks);
    let module_name = config.module_name.clone();
    let calls = cli_args.calls;

    Runner::run(
        controller_bootstrap,
        &config,
        move |_info| Box::pin(async move { run_controller_demo(controller, module_name, calls).await }),
        |info| {
            Box::pin(async move {
                anyhow::bail!("rank {} classified as Worker; rank 0 always runs the controller", info.rank)
            })
        },
        |info| {
            Box::pin(async move {
                anyhow::bail!(
                    "rank {} classified as CollectiveBroker at rank 0; brokers are spawned on other ranks",
                    info.rank
                )
            })
        },
        |info| {
            Box::pin(async move {
                anyhow::bail!(
                    "rank {} classified as CollectiveWorker; rank 0 is never itself spawned",
                    info.rank
                )
            })
        },
    )
    .await
}
