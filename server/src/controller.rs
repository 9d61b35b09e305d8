//! The scheduler: accepts submissions, assigns them by least estimated
//! load among ready workers, and delivers results in submission order per
//! worker.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info};

use shared::protocol::KwArgs;
use shared::stats::{build_report, RunReport};
use shared::{
    poll_or_backoff, DistwqError, Message, NameResolver, Rank, Result, ResultRecord, ResultValue,
    StatsRecord, TaskDescriptor, TaskId, Transport, Value,
};

/// The controller's full bookkeeping state.
pub struct Controller {
    transport: Option<Arc<dyn Transport>>,
    resolver: Arc<dyn NameResolver>,
    workers_available: bool,

    count: TaskId,
    total_time_est: HashMap<Rank, f64>,
    ready_workers: VecDeque<Rank>,
    assigned: HashMap<TaskId, Rank>,
    worker_queue: HashMap<Rank, VecDeque<TaskId>>,
    task_queue: VecDeque<TaskId>,
    result_queue: VecDeque<TaskId>,
    results: HashMap<TaskId, ResultValue>,
    stats: Vec<StatsRecord>,
    n_processed: HashMap<Rank, u64>,
    total_time: HashMap<Rank, f64>,

    start_time: Instant,
}

impl Controller {
    /// Build a controller over `worker_ranks`, communicating through
    /// `transport`. Rank 0's `total_time_est` is seeded to infinity so the
    /// controller itself is never picked as a worker.
    pub fn new(
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn NameResolver>,
        worker_ranks: &[Rank],
    ) -> Self {
        let mut total_time_est = HashMap::new();
        total_time_est.insert(0, f64::INFINITY);
        let mut worker_queue = HashMap::new();
        let mut n_processed = HashMap::new();
        let mut total_time = HashMap::new();
        for &rank in worker_ranks {
            total_time_est.insert(rank, 0.0);
            worker_queue.insert(rank, VecDeque::new());
            n_processed.insert(rank, 0);
            total_time.insert(rank, 0.0);
        }

        Controller {
            transport: Some(transport),
            resolver,
            workers_available: !worker_ranks.is_empty(),
            count: 0,
            total_time_est,
            ready_workers: VecDeque::new(),
            assigned: HashMap::new(),
            worker_queue,
            task_queue: VecDeque::new(),
            result_queue: VecDeque::new(),
            results: HashMap::new(),
            stats: Vec::new(),
            n_processed,
            total_time,
            start_time: Instant::now(),
        }
    }

    /// Degenerate controller for size-1 runs: no transport, every call
    /// resolved and executed synchronously.
    pub fn standalone(resolver: Arc<dyn NameResolver>) -> Self {
        Controller {
            transport: None,
            resolver,
            workers_available: false,
            count: 0,
            total_time_est: HashMap::new(),
            ready_workers: VecDeque::new(),
            assigned: HashMap::new(),
            worker_queue: HashMap::new(),
            task_queue: VecDeque::new(),
            result_queue: VecDeque::new(),
            results: HashMap::new(),
            stats: Vec::new(),
            n_processed: HashMap::new(),
            total_time: HashMap::new(),
            start_time: Instant::now(),
        }
    }

    pub fn workers_available(&self) -> bool {
        self.workers_available
    }

    /// Submit a call for asynchronous (or, with no workers, synchronous)
    /// execution. Returns the task id, generated if `task_id` was `None`.
    pub async fn submit_call(
        &mut self,
        symbol_name: impl Into<String>,
        args: Vec<Value>,
        kwargs: KwArgs,
        module_name: impl Into<String>,
        time_est: f64,
        task_id: Option<TaskId>,
    ) -> Result<TaskId> {
        debug_assert!(time_est > 0.0, "time_est must be positive");
        let symbol_name = symbol_name.into();
        let module_name = module_name.into();

        let task_id = match task_id {
            Some(id) => {
                // `assigned` covers in-flight async calls; `results` covers
                // calls executed synchronously (standalone mode never adds
                // those to `assigned`, see the comment below).
                if self.assigned.contains_key(&id) || self.results.contains_key(&id) {
                    return Err(DistwqError::DuplicateId(id));
                }
                id
            }
            None => {
                let id = self.count;
                self.count += 1;
                id
            }
        };

        if !self.workers_available {
            let invocable = self.resolver.resolve(&module_name, &symbol_name)?;
            info!(task_id, symbol = %symbol_name, "calling on controller rank, no workers available");
            let call_start = Instant::now();
            let value = invocable(args, kwargs)
                .map_err(|e| DistwqError::UserFailure(e.to_string()))?;
            let this_time = call_start.elapsed().as_secs_f64();
            let n_processed = *self.n_processed.entry(0).and_modify(|n| *n += 1).or_insert(1);
            let total_time = self.start_time.elapsed().as_secs_f64();
            self.total_time.insert(0, total_time);
            self.results.insert(task_id, ResultValue::Single(value));
            self.stats.push(StatsRecord {
                task_id,
                rank: 0,
                this_time,
                time_over_est: this_time / time_est,
                n_processed,
                total_time,
            });
            // Executed synchronously: it is immediately "done", so it goes
            // straight to result_queue rather than lingering in task_queue
            // forever.
            self.result_queue.push_back(task_id);
            return Ok(task_id);
        }

        let rank = loop {
            self.recv_step().await?;
            if !self.ready_workers.is_empty() {
                break *self
                    .ready_workers
                    .iter()
                    .min_by(|a, b| self.total_time_est[a].partial_cmp(&self.total_time_est[b]).unwrap())
                    .expect("just checked non-empty");
            }
        };

        let descriptor = TaskDescriptor {
            task_id,
            symbol_name: symbol_name.clone(),
            module_name,
            args,
            kwargs,
            time_est,
            collective_mode: None,
        };
        info!(task_id, rank, symbol = %symbol_name, "assigning call to worker");
        self.transport
            .as_ref()
            .expect("workers_available implies a transport")
            .send(rank, Message::Task(descriptor))
            .await?;
        let pos = self
            .ready_workers
            .iter()
            .position(|&r| r == rank)
            .expect("rank was just selected from ready_workers");
        self.ready_workers.remove(pos);

        *self.total_time_est.entry(rank).or_insert(0.0) += time_est;
        self.task_queue.push_back(task_id);
        self.worker_queue.entry(rank).or_default().push_back(task_id);
        self.assigned.insert(task_id, rank);
        Ok(task_id)
    }

    /// Return the result of an earlier submitted call, blocking (via the
    /// receive loop) until it is available. Per-worker order must be
    /// respected: out-of-order retrieval fails with `OutOfOrder`.
    pub async fn get_result(&mut self, task_id: TaskId) -> Result<(TaskId, ResultValue)> {
        if let Some(value) = self.results.get(&task_id).cloned() {
            self.remove_from_result_queue(task_id);
            return Ok((task_id, value));
        }

        let rank = *self
            .assigned
            .get(&task_id)
            .ok_or_else(|| DistwqError::ProtocolViolation(format!("unknown task id {task_id}")))?;

        if self.workers_available {
            let expected = *self
                .worker_queue
                .get(&rank)
                .and_then(|q| q.front())
                .ok_or_else(|| DistwqError::ProtocolViolation("worker queue is empty".into()))?;
            if expected != task_id {
                return Err(DistwqError::OutOfOrder { task_id, expected });
            }
            debug!(task_id, rank, "waiting for result from worker");
            while !self.results.contains_key(&task_id) {
                self.recv_step().await?;
            }
        }

        let value = self
            .results
            .get(&task_id)
            .cloned()
            .expect("just confirmed present");
        self.remove_from_result_queue(task_id);
        Ok((task_id, value))
    }

    /// Return the next result whose id has not yet been retrieved, or
    /// `None` if there is nothing in flight.
    pub async fn get_next_result(&mut self) -> Result<Option<(TaskId, ResultValue)>> {
        if let Some(task_id) = self.result_queue.pop_front() {
            let value = self
                .results
                .get(&task_id)
                .cloned()
                .ok_or_else(|| DistwqError::ProtocolViolation(format!("missing result for {task_id}")))?;
            return Ok(Some((task_id, value)));
        }
        if let Some(&task_id) = self.task_queue.front() {
            return self.get_result(task_id).await.map(Some);
        }
        Ok(None)
    }

    /// Observational run statistics. Rendering/printing policy is left to
    /// the caller.
    pub fn info(&self) -> RunReport {
        build_report(
            &self.stats,
            self.task_queue.len(),
            &self.n_processed,
            &self.total_time,
            &self.total_time_est,
        )
    }

    /// Drain all remaining results, then tell every worker rank to exit.
    /// Must only be called after all desired submissions have been made.
    pub async fn exit(&mut self) -> Result<()> {
        while self.get_next_result().await?.is_some() {}
        if let Some(transport) = self.transport.clone() {
            let ranks: Vec<Rank> = self.worker_queue.keys().copied().collect();
            for rank in ranks {
                info!(rank, "telling worker to exit");
                transport.send(rank, Message::Exit).await?;
            }
        }
        Ok(())
    }

    /// Abort the whole job: broadcast EXIT to every known rank. The
    /// in-process analogue of `MPI_Abort`.
    pub async fn abort(&self) {
        error!("controller aborting, broadcasting EXIT to every known rank");
        if let Some(transport) = &self.transport {
            for &rank in self.worker_queue.keys() {
                let _ = transport.send(rank, Message::Exit).await;
            }
        }
    }

    fn remove_from_result_queue(&mut self, task_id: TaskId) {
        if let Some(pos) = self.result_queue.iter().position(|&id| id == task_id) {
            self.result_queue.remove(pos);
        }
    }

    /// Non-blocking poll of the substrate for a single incoming message,
    /// updating bookkeeping for READY/DONE. Any other tag is fatal.
    async fn recv_step(&mut self) -> Result<()> {
        let transport = self
            .transport
            .as_ref()
            .expect("recv_step requires a transport")
            .clone();
        match poll_or_backoff(transport.as_ref()).await {
            None => Ok(()),
            Some((source, Message::Ready)) => {
                debug!(source, "worker announced ready");
                self.ready_workers.push_back(source);
                Ok(())
            }
            Some((source, Message::Done(record))) => {
                let ResultRecord { task_id, value, stats } = record;
                debug!(task_id, source, "received result from worker");
                self.results.insert(task_id, value);
                self.n_processed.insert(source, stats.n_processed);
                self.total_time.insert(source, stats.total_time);
                self.stats.push(stats);
                if let Some(pos) = self.task_queue.iter().position(|&id| id == task_id) {
                    self.task_queue.remove(pos);
                }
                if let Some(queue) = self.worker_queue.get_mut(&source) {
                    if let Some(pos) = queue.iter().position(|&id| id == task_id) {
                        queue.remove(pos);
                    }
                }
                self.result_queue.push_back(task_id);
                self.assigned.remove(&task_id);
                Ok(())
            }
            Some((source, other)) => {
                error!(source, tag = %other.tag(), "protocol violation");
                Err(DistwqError::ProtocolViolation(format!(
                    "unexpected message tag {} from rank {source}",
                    other.tag()
                )))
            }
        }
    }
}
