//! A plain worker: announces readiness, executes one task at a time,
//! reports back, repeats until told to exit.

use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info};

use shared::{
    poll_or_backoff, DistwqError, Message, NameResolver, Rank, Result, ResultRecord, ResultValue,
    StatsRecord, Transport,
};

pub struct Worker {
    transport: Arc<dyn Transport>,
    resolver: Arc<dyn NameResolver>,
    start_time: Instant,
    n_processed: u64,
}

impl Worker {
    pub fn new(transport: Arc<dyn Transport>, resolver: Arc<dyn NameResolver>) -> Self {
        Worker {
            transport,
            resolver,
            start_time: Instant::now(),
            n_processed: 0,
        }
    }

    /// Serve submitted calls until told to exit. Call this directly if the
    /// caller needs worker-specific setup/teardown around the serve loop.
    pub async fn serve(&mut self) -> Result<()> {
        let rank = self.transport.rank();
        info!(rank, "waiting for calls");
        let mut ready = true;

        loop {
            if ready {
                self.transport.send(0, Message::Ready).await?;
            }

            let message = match poll_or_backoff(self.transport.as_ref()).await {
                None => {
                    ready = false;
                    continue;
                }
                Some((_source, message)) => message,
            };

            match message {
                Message::Exit => {
                    info!(rank, "exiting");
                    return Ok(());
                }
                Message::Task(descriptor) => {
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
                        rank,
                        this_time,
                        time_over_est: this_time / descriptor.time_est,
                        n_processed: self.n_processed,
                        total_time: self.start_time.elapsed().as_secs_f64(),
                    };
                    self.transport
                        .send(
                            0,
                            Message::Done(ResultRecord {
                                task_id: descriptor.task_id,
                                value: ResultValue::Single(value),
                                stats,
                            }),
                        )
                        .await?;
                    ready = true;
                }
                other => {
                    error!(rank, tag = %other.tag(), "protocol violation");
                    return Err(DistwqError::ProtocolViolation(format!(
                        "worker {rank}: unexpected message tag {}",
                        other.tag()
                    )));
                }
            }
        }
    }

    pub async fn abort(&self) {
        error!(rank = self.transport.rank(), "worker aborting");
        let _ = self.transport.send(0, Message::Exit).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::transport::Mesh;
    use shared::{KwArgs, StaticRegistry};
    use serde_json::json;

    #[tokio::test]
    async fn executes_one_task_then_exits() {
        let (_mesh, controller, mut workers) = Mesh::new_world(1);
        let worker_channel = workers.remove(0);

        let mut registry = StaticRegistry::new();
        registry.register("__main__", "square", |args, _kwargs| {
            Ok(json!(args[0].as_f64().unwrap() * args[0].as_f64().unwrap()))
        });

        let mut worker = Worker::new(Arc::new(worker_channel), Arc::new(registry));
        let handle = tokio::spawn(async move { worker.serve().await });

        // Wait for READY.
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
                Message::Task(shared::protocol::TaskDescriptor {
                    task_id: 0,
                    symbol_name: "square".to_string(),
                    module_name: "__main__".to_string(),
                    args: vec![json!(5.0)],
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
                assert_eq!(record.task_id, 0);
                assert_eq!(record.value.as_single().unwrap(), &json!(25.0));
            }
            other => panic!("unexpected message {other:?}"),
        }

        controller.send(1, Message::Exit).await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn abort_notifies_the_controller_with_exit() {
        let (_mesh, controller, mut workers) = Mesh::new_world(1);
        let worker_channel = workers.remove(0);
        let worker = Worker::new(Arc::new(worker_channel), Arc::new(StaticRegistry::new()));

        worker.abort().await;

        let (source, msg) = controller.try_recv().await.unwrap();
        assert_eq!(source, 1);
        assert!(matches!(msg, Message::Exit));
    }
}
