//! A collective broker: relays one task at a time from the controller to
//! a spawned sub-group via scatter, gathers their contributions, and
//! reports a single aggregated result back to the controller.

use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info};

use shared::protocol::TaskDescriptor;
use shared::transport::MergedComm;
use shared::{
    poll_or_backoff, CollectiveMode, DistwqError, Message, NameResolver, Rank, Result,
    ResultRecord, ResultValue, StatsRecord, Transport,
};

pub struct CollectiveBroker {
    transport: Arc<dyn Transport>,
    merged: MergedComm,
    resolver: Arc<dyn NameResolver>,
    is_worker: bool,
    start_time: Instant,
    n_processed: u64,
}

impl CollectiveBroker {
    pub fn new(
        transport: Arc<dyn Transport>,
        merged: MergedComm,
        resolver: Arc<dyn NameResolver>,
        is_worker: bool,
    ) -> Self {
        CollectiveBroker {
            transport,
            merged,
            resolver,
            is_worker,
            start_time: Instant::now(),
            n_processed: 0,
        }
    }

    pub async fn serve(&mut self) -> Result<()> {
        let rank: Rank = self.transport.rank();
        loop {
            self.transport.send(0, Message::Ready).await?;
            info!(rank, "getting next task from controller");

            let message = loop {
                if let Some((_source, message)) = poll_or_backoff(self.transport.as_ref()).await {
                    break message;
                }
            };

            match message {
                Message::Exit => {
                    info!(rank, "exiting");
                    self.merged.barrier().await;
                    let sentinels = vec![TaskDescriptor::exit_sentinel(); self.merged.size()];
                    self.merged.scatter(Some(sentinels)).await;
                    return Ok(());
                }
                Message::Task(descriptor) => {
                    let task_id = descriptor.task_id;
                    info!(rank, task_id, "sending task to sub-group");

                    self.merged.barrier().await;
                    let mut scattered = descriptor.clone();
                    scattered.collective_mode = Some(CollectiveMode::Gather);
                    let batch = vec![scattered; self.merged.size()];
                    self.merged.scatter(Some(batch)).await;

                    let own_contribution = if self.is_worker {
                        let invocable = self
                            .resolver
                            .resolve(&descriptor.module_name, &descriptor.symbol_name)?;
                        let call_start = Instant::now();
                        let value = invocable(descriptor.args, descriptor.kwargs)
                            .map_err(|e| DistwqError::UserFailure(e.to_string()))?;
                        let this_time = call_start.elapsed().as_secs_f64();
                        self.n_processed += 1;
                        let stats = StatsRecord {
                            task_id,
                            rank: self.merged.merged_rank,
                            this_time,
                            time_over_est: this_time / descriptor.time_est,
                            n_processed: self.n_processed,
                            total_time: self.start_time.elapsed().as_secs_f64(),
                        };
                        (Some(value), Some(stats))
                    } else {
                        (None, None)
                    };

                    info!(rank, task_id, "gathering data from sub-group");
                    self.merged.barrier().await;
                    let gathered = self
                        .merged
                        .gather(own_contribution)
                        .await
                        .expect("broker is root, gather must return Some");

                    let results: Vec<_> = gathered.iter().filter_map(|(v, _)| v.clone()).collect();
                    let stats: Vec<StatsRecord> =
                        gathered.into_iter().filter_map(|(_, s)| s).collect();
                    let straggler = stats
                        .iter()
                        .max_by(|a, b| a.this_time.partial_cmp(&b.this_time).unwrap())
                        .cloned()
                        .expect("at least one collective worker must report stats");

                    info!(rank, task_id, n_results = results.len(), "reporting to controller");
                    self.transport
                        .send(
                            0,
                            Message::Done(ResultRecord {
                                task_id,
                                value: ResultValue::Collective(results),
                                stats: straggler,
                            }),
                        )
                        .await?;
                }
                other => {
                    error!(rank, tag = %other.tag(), "protocol violation");
                    return Err(DistwqError::ProtocolViolation(format!(
                        "collective broker {rank}: unexpected message tag {}",
                        other.tag()
                    )));
                }
            }
        }
    }

    pub async fn abort(&self) {
        error!(rank = self.transport.rank(), "collective broker aborting");
        let _ = self.transport.send(0, Message::Exit).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared::transport::{InProcessCollective, Mesh};
    use shared::KwArgs;

    #[tokio::test]
    async fn relays_one_task_and_reports_aggregated_result() {
        let (_mesh, controller, mut workers) = Mesh::new_world(1);
        let broker_channel = Arc::new(workers.remove(0));

        let group = InProcessCollective::new_group(3);
        let broker_merged = MergedComm::new(0, group.clone());
        let worker_merged_a = MergedComm::new(1, group.clone());
        let worker_merged_b = MergedComm::new(2, group);

        let registry = Arc::new(crate::example_registry("__main__"));
        let mut broker =
            CollectiveBroker::new(broker_channel, broker_merged, registry.clone(), false);
        let broker_handle = tokio::spawn(async move { broker.serve().await });
        tokio::spawn(crate::demo_collective_worker_loop(worker_merged_a, registry.clone()));
        tokio::spawn(crate::demo_collective_worker_loop(worker_merged_b, registry));

        let (source, msg) = loop {
            if let Some(m) = controller.try_recv().await {
                break m;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };
        assert_eq!(source, 1);
        assert!(matches!(msg, Message::Ready));

        controller
            .send(
                1,
                Message::Task(TaskDescriptor {
                    task_id: 3,
                    symbol_name: "square".to_string(),
                    module_name: "__main__".to_string(),
                    args: vec![json!(6.0)],
                    kwargs: KwArgs::new(),
                    time_est: 1.0,
                    collective_mode: None,
                }),
            )
            .await
            .unwrap();

        let (source, msg) = loop {
            if let Some(m) = controller.try_recv().await {
                break m;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };
        assert_eq!(source, 1);
        match msg {
            Message::Done(record) => {
                assert_eq!(record.task_id, 3);
                let values = record.value.as_collective().unwrap();
                assert_eq!(values.len(), 2);
                assert!(values.contains(&json!(36.0)));
            }
            other => panic!("unexpected message {other:?}"),
        }

        controller.send(1, Message::Exit).await.unwrap();
        broker_handle.await.unwrap().unwrap();
    }
}
