//! A rank inside a sub-group spawned by a collective broker: receives its
//! task via scatter, executes it, contributes its result via gather.

use std::sync::Arc;
use std::time::Instant;

use tracing::info;

use shared::transport::MergedComm;
use shared::{CollectiveMode, DistwqError, NameResolver, Result, StatsRecord};

pub struct CollectiveWorker {
    merged: MergedComm,
    resolver: Arc<dyn NameResolver>,
    worker_id: usize,
    start_time: Instant,
    n_processed: u64,
}

impl CollectiveWorker {
    pub fn new(merged: MergedComm, resolver: Arc<dyn NameResolver>, worker_id: usize) -> Self {
        CollectiveWorker {
            merged,
            resolver,
            worker_id,
            start_time: Instant::now(),
            n_processed: 0,
        }
    }

    /// Serve submitted calls until told to exit. Tasks arrive via scatter
    /// and results leave via gather: every collective worker spawned by the
    /// same broker participates in both.
    pub async fn serve(&mut self) -> Result<()> {
        let merged_rank = self.merged.merged_rank;
        info!(worker_id = self.worker_id, merged_rank, "waiting for calls");

        loop {
            self.merged.barrier().await;
            let descriptor = self.merged.scatter(None).await;

            if descriptor.is_exit_sentinel() {
                info!(worker_id = self.worker_id, merged_rank, "exiting");
                return Ok(());
            }

            match descriptor.collective_mode {
                Some(CollectiveMode::Gather) => {}
                other => {
                    return Err(DistwqError::ProtocolViolation(format!(
                        "collective worker {merged_rank}: unsupported collective mode {other:?}"
                    )));
                }
            }

            let invocable = self
                .resolver
                .resolve(&descriptor.module_name, &descriptor.symbol_name)?;
            let call_start = Instant::now();
            let value = invocable(descriptor.args, descriptor.kwargs)
                .map_err(|e| DistwqError::UserFailure(e.to_string()))?;
            let this_time = call_start.elapsed().as_secs_f64();
            self.n_processed += 1;
            let stats = StatsRecord {
                task_id: descriptor.task_id,
                rank: merged_rank,
                this_time,
                time_over_est: this_time / descriptor.time_est,
                n_processed: self.n_processed,
                total_time: self.start_time.elapsed().as_secs_f64(),
            };

            self.merged.barrier().await;
            self.merged.gather((Some(value), Some(stats))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::transport::InProcessCollective;
    use shared::{KwArgs, StaticRegistry};
    use serde_json::json;

    #[tokio::test]
    async fn scatters_and_gathers_one_round_then_exits() {
        let group = InProcessCollective::new_group(2);
        let broker_comm = MergedComm::new(0, group.clone());
        let worker_comm = MergedComm::new(1, group);

        let mut registry = StaticRegistry::new();
        registry.register("__main__", "double", |args, _kwargs| {
            Ok(json!(args[0].as_f64().unwrap() * 2.0))
        });
        let mut worker = CollectiveWorker::new(worker_comm, Arc::new(registry), 0);
        let worker_handle = tokio::spawn(async move { worker.serve().await });

        broker_comm.barrier().await;
        broker_comm
            .scatter(Some(vec![
                shared::protocol::TaskDescriptor {
                    task_id: 7,
                    symbol_name: "double".to_string(),
                    module_name: "__main__".to_string(),
                    args: vec![json!(21.0)],
                    kwargs: KwArgs::new(),
                    time_est: 1.0,
                    collective_mode: Some(shared::CollectiveMode::Gather),
                },
                shared::protocol::TaskDescriptor {
                    task_id: 7,
                    symbol_name: "double".to_string(),
                    module_name: "__main__".to_string(),
                    args: vec![json!(21.0)],
                    kwargs: KwArgs::new(),
                    time_est: 1.0,
                    collective_mode: Some(shared::CollectiveMode::Gather),
                },
            ]))
            .await;

        broker_comm.barrier().await;
        let gathered = broker_comm.gather((None, None)).await.unwrap();
        let worker_value = gathered[1].0.clone().unwrap();
        assert_eq!(worker_value, json!(42.0));

        broker_comm.barrier().await;
        broker_comm
            .scatter(Some(vec![
                shared::protocol::TaskDescriptor::exit_sentinel(),
                shared::protocol::TaskDescriptor::exit_sentinel(),
            ]))
            .await;

        worker_handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn rejects_a_scattered_task_with_no_collective_mode() {
        let group = InProcessCollective::new_group(2);
        let broker_comm = MergedComm::new(0, group.clone());
        let worker_comm = MergedComm::new(1, group);

        let mut worker = CollectiveWorker::new(worker_comm, Arc::new(StaticRegistry::new()), 0);
        let worker_handle = tokio::spawn(async move { worker.serve().await });

        broker_comm.barrier().await;
        broker_comm
            .scatter(Some(vec![
                shared::protocol::TaskDescriptor {
                    task_id: 1,
                    symbol_name: "double".to_string(),
                    module_name: "__main__".to_string(),
                    args: vec![json!(1.0)],
                    kwargs: KwArgs::new(),
                    time_est: 1.0,
                    collective_mode: None,
                },
                shared::protocol::TaskDescriptor {
                    task_id: 1,
                    symbol_name: "double".to_string(),
                    module_name: "__main__".to_string(),
                    args: vec![json!(1.0)],
                    kwargs: KwArgs::new(),
                    time_est: 1.0,
                    collective_mode: None,
                },
            ]))
            .await;

        let err = worker_handle.await.unwrap().unwrap_err();
        assert!(matches!(err, DistwqError::ProtocolViolation(_)));
    }
}
