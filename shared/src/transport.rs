//! The message-passing substrate.
//!
//! Point-to-point send/recv, probe, dynamic spawn, and collective
//! scatter/gather/barrier are normally provided by an external substrate
//! such as MPI. This module supplies a concrete, in-process substitute
//! (every rank is a tokio task in the same process) behind the `Transport`
//! and `CollectiveGroup` traits, so the engine in `controller`/`worker` can
//! be exercised and tested without a real multi-process transport. A
//! future networked substrate would implement these same two traits.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Barrier};

use crate::error::{DistwqError, Result};
use crate::protocol::{Message, Rank, StatsRecord, TaskDescriptor, Value};

/// Back-off used whenever a non-blocking probe finds nothing, for every
/// serve loop (controller, worker, broker). Deliberately coarse: this is a
/// mixed polling-plus-sleep loop, not a busy spin.
pub const POLL_BACKOFF: Duration = Duration::from_secs(1);

/// Point-to-point half of the substrate: READY/TASK/DONE/EXIT between a
/// controller and its direct workers/brokers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// This participant's rank in the mesh.
    fn rank(&self) -> Rank;

    /// Send a message to `dest`. Analogous to a non-blocking MPI `isend`
    /// immediately `wait()`-ed on.
    async fn send(&self, dest: Rank, msg: Message) -> Result<()>;

    /// Non-blocking probe-and-receive of a message from any source.
    /// Returns `None` if nothing is pending (the caller backs off).
    async fn try_recv(&self) -> Option<(Rank, Message)>;
}

/// Poll `transport` once; sleep for [`POLL_BACKOFF`] if nothing arrived.
/// Centralizes the "non-blocking probe, ~1s sleep on empty" discipline used
/// by every serve loop.
pub async fn poll_or_backoff(transport: &dyn Transport) -> Option<(Rank, Message)> {
    match transport.try_recv().await {
        Some(msg) => Some(msg),
        None => {
            tokio::time::sleep(POLL_BACKOFF).await;
            None
        }
    }
}

/// Registry of per-rank inboxes. Owns no application state; it only routes
/// `Message`s between ranks and hands out fresh ranks for dynamic spawn.
pub struct Mesh {
    senders: Mutex<HashMap<Rank, mpsc::UnboundedSender<(Rank, Message)>>>,
    next_rank: AtomicUsize,
}

impl Mesh {
    /// Build a world of one controller (rank 0) plus `n_workers` plain
    /// worker/broker ranks (ranks `1..=n_workers`), returning the
    /// controller's channel and each worker's channel.
    pub fn new_world(n_workers: usize) -> (Arc<Mesh>, RankChannel, Vec<RankChannel>) {
        let mesh = Arc::new(Mesh {
            senders: Mutex::new(HashMap::new()),
            next_rank: AtomicUsize::new(n_workers + 1),
        });
        let controller = mesh.register(0);
        let workers = (1..=n_workers).map(|r| mesh.register(r)).collect();
        (mesh, controller, workers)
    }

    /// Register a specific rank and return its channel. Panics if the rank
    /// is already registered — ranks are assigned once, at world/spawn time.
    pub fn register(self: &Arc<Self>, rank: Rank) -> RankChannel {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut senders = self.senders.lock().expect("mesh lock poisoned");
        if senders.insert(rank, tx).is_some() {
            panic!("rank {rank} registered twice");
        }
        RankChannel {
            rank,
            mesh: self.clone(),
            inbox: Mutex::new(rx),
        }
    }

    /// Allocate and register a fresh rank, for dynamic spawn.
    pub fn spawn_rank(self: &Arc<Self>) -> RankChannel {
        let rank = self.next_rank.fetch_add(1, Ordering::SeqCst);
        self.register(rank)
    }
}

/// A single rank's point-to-point endpoint.
pub struct RankChannel {
    rank: Rank,
    mesh: Arc<Mesh>,
    inbox: Mutex<mpsc::UnboundedReceiver<(Rank, Message)>>,
}

#[async_trait]
impl Transport for RankChannel {
    fn rank(&self) -> Rank {
        self.rank
    }

    async fn send(&self, dest: Rank, msg: Message) -> Result<()> {
        let senders = self.mesh.senders.lock().expect("mesh lock poisoned");
        let tx = senders
            .get(&dest)
            .ok_or_else(|| DistwqError::ProtocolViolation(format!("no such rank {dest}")))?;
        tx.send((self.rank, msg))
            .map_err(|_| DistwqError::ProtocolViolation(format!("rank {dest} is gone")))
    }

    async fn try_recv(&self) -> Option<(Rank, Message)> {
        let mut inbox = self.inbox.lock().expect("mesh lock poisoned");
        inbox.try_recv().ok()
    }
}

/// One rank's contribution to a gather, or `(None, None)` for a
/// non-participating rank (filtered out on the root side).
pub type GatherItem = (Option<Value>, Option<StatsRecord>);

/// Collective half of the substrate: barrier/scatter/gather across a
/// spawned sub-group plus its broker, addressed by "merged rank" (the
/// broker is always merged rank 0; this is the one root every gather and
/// scatter uses, resolving what would otherwise be an ambiguous choice of
/// shared root).
#[async_trait]
pub trait CollectiveGroup: Send + Sync {
    fn size(&self) -> usize;
    async fn barrier(&self, merged_rank: Rank);
    async fn scatter(
        &self,
        merged_rank: Rank,
        root: Rank,
        items: Option<Vec<TaskDescriptor>>,
    ) -> TaskDescriptor;
    async fn gather(
        &self,
        merged_rank: Rank,
        root: Rank,
        item: GatherItem,
    ) -> Option<Vec<GatherItem>>;
}

/// In-process collective group: one shared set of slots plus a
/// [`tokio::sync::Barrier`], indexed by merged rank.
pub struct InProcessCollective {
    size: usize,
    barrier: Barrier,
    scatter_slots: Vec<Mutex<Option<TaskDescriptor>>>,
    gather_slots: Vec<Mutex<Option<GatherItem>>>,
}

impl InProcessCollective {
    pub fn new_group(size: usize) -> Arc<Self> {
        Arc::new(InProcessCollective {
            size,
            barrier: Barrier::new(size),
            scatter_slots: (0..size).map(|_| Mutex::new(None)).collect(),
            gather_slots: (0..size).map(|_| Mutex::new(None)).collect(),
        })
    }
}

#[async_trait]
impl CollectiveGroup for InProcessCollective {
    fn size(&self) -> usize {
        self.size
    }

    async fn barrier(&self, _merged_rank: Rank) {
        self.barrier.wait().await;
    }

    async fn scatter(
        &self,
        merged_rank: Rank,
        root: Rank,
        items: Option<Vec<TaskDescriptor>>,
    ) -> TaskDescriptor {
        if merged_rank == root {
            let items = items.expect("root must supply scatter items");
            assert_eq!(items.len(), self.size, "scatter item count mismatch");
            for (i, item) in items.into_iter().enumerate() {
                *self.scatter_slots[i].lock().expect("poisoned") = Some(item);
            }
        }
        // First barrier: every rank waits until root has populated all slots.
        self.barrier.wait().await;
        let mine = self.scatter_slots[merged_rank]
            .lock()
            .expect("poisoned")
            .take()
            .expect("scatter slot was empty at this rank");
        // Second barrier: root must not reuse slots before every rank reads.
        self.barrier.wait().await;
        mine
    }

    async fn gather(
        &self,
        merged_rank: Rank,
        root: Rank,
        item: GatherItem,
    ) -> Option<Vec<GatherItem>> {
        *self.gather_slots[merged_rank].lock().expect("poisoned") = Some(item);
        self.barrier.wait().await;
        let collected = if merged_rank == root {
            Some(
                self.gather_slots
                    .iter()
                    .map(|slot| slot.lock().expect("poisoned").take().expect("gather slot empty"))
                    .collect(),
            )
        } else {
            None
        };
        self.barrier.wait().await;
        collected
    }
}

/// A merged communicator bound to one merged rank: a broker plus its
/// spawned sub-group, addressed as a single collective. Root is always 0.
pub struct MergedComm {
    pub merged_rank: Rank,
    group: Arc<dyn CollectiveGroup>,
}

impl MergedComm {
    pub const ROOT: Rank = 0;

    pub fn new(merged_rank: Rank, group: Arc<dyn CollectiveGroup>) -> Self {
        MergedComm { merged_rank, group }
    }

    pub fn size(&self) -> usize {
        self.group.size()
    }

    pub async fn barrier(&self) {
        self.group.barrier(self.merged_rank).await;
    }

    pub async fn scatter(&self, items: Option<Vec<TaskDescriptor>>) -> TaskDescriptor {
        self.group.scatter(self.merged_rank, Self::ROOT, items).await
    }

    pub async fn gather(&self, item: GatherItem) -> Option<Vec<GatherItem>> {
        self.group.gather(self.merged_rank, Self::ROOT, item).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::KwArgs;
    use serde_json::json;

    #[tokio::test]
    async fn mesh_delivers_point_to_point_with_source_rank() {
        let (_mesh, controller, mut workers) = Mesh::new_world(1);
        let worker = workers.remove(0);

        controller.send(1, Message::Exit).await.unwrap();
        let (source, msg) = worker.try_recv().await.unwrap();
        assert_eq!(source, 0);
        assert!(matches!(msg, Message::Exit));

        worker.send(0, Message::Ready).await.unwrap();
        let (source, msg) = controller.try_recv().await.unwrap();
        assert_eq!(source, 1);
        assert!(matches!(msg, Message::Ready));
    }

    #[tokio::test]
    async fn mesh_try_recv_is_none_when_inbox_is_empty() {
        let (_mesh, controller, _workers) = Mesh::new_world(1);
        assert!(controller.try_recv().await.is_none());
    }

    #[tokio::test]
    async fn mesh_send_to_unknown_rank_fails() {
        let (_mesh, controller, _workers) = Mesh::new_world(1);
        let err = controller.send(99, Message::Exit).await.unwrap_err();
        assert!(matches!(err, DistwqError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn mesh_spawn_rank_allocates_past_the_initial_world() {
        let (mesh, _controller, workers) = Mesh::new_world(2);
        let spawned = mesh.spawn_rank();
        assert_eq!(spawned.rank(), workers.len() + 1);
    }

    #[tokio::test]
    async fn collective_scatter_and_gather_round_trip() {
        let group = InProcessCollective::new_group(2);
        let root = MergedComm::new(0, group.clone());
        let other = MergedComm::new(1, group);

        let descriptor_for = |task_id: crate::protocol::TaskId| TaskDescriptor {
            task_id,
            symbol_name: "square".to_string(),
            module_name: "__main__".to_string(),
            args: vec![json!(task_id as f64)],
            kwargs: KwArgs::new(),
            time_est: 1.0,
            collective_mode: None,
        };

        let other_handle = tokio::spawn(async move {
            other.barrier().await;
            let mine = other.scatter(None).await;
            other.barrier().await;
            let stats = StatsRecord {
                task_id: mine.task_id,
                rank: 1,
                this_time: 0.0,
                time_over_est: 0.0,
                n_processed: 1,
                total_time: 0.0,
            };
            other.gather((Some(json!(mine.task_id * mine.task_id)), Some(stats))).await;
            mine.task_id
        });

        root.barrier().await;
        let mine = root
            .scatter(Some(vec![descriptor_for(7), descriptor_for(9)]))
            .await;
        assert_eq!(mine.task_id, 7);

        root.barrier().await;
        let stats = StatsRecord {
            task_id: mine.task_id,
            rank: 0,
            this_time: 0.0,
            time_over_est: 0.0,
            n_processed: 1,
            total_time: 0.0,
        };
        let gathered = root
            .gather((Some(json!(mine.task_id * mine.task_id)), Some(stats)))
            .await
            .expect("root must see the full gather");

        assert_eq!(other_handle.await.unwrap(), 9);
        assert_eq!(gathered.len(), 2);
        assert_eq!(gathered[0].0, Some(json!(49.0)));
        assert_eq!(gathered[1].0, Some(json!(81.0)));
    }

    #[tokio::test]
    async fn collective_exit_sentinel_round_trips_through_scatter() {
        let group = InProcessCollective::new_group(2);
        let root = MergedComm::new(0, group.clone());
        let other = MergedComm::new(1, group);

        let other_handle = tokio::spawn(async move {
            other.barrier().await;
            other.scatter(None).await
        });

        root.barrier().await;
        let sentinels = vec![TaskDescriptor::exit_sentinel(), TaskDescriptor::exit_sentinel()];
        let mine = root.scatter(Some(sentinels)).await;
        assert!(mine.is_exit_sentinel());
        assert!(other_handle.await.unwrap().is_exit_sentinel());
    }
}
