//! Explicit bootstrap record and role classification.
//!
//! Rather than scattering role determination across module-level globals
//! (`is_controller`, `is_worker`, `spawned`, `size`, `rank`, `start_time`),
//! a `BootstrapInfo` value is constructed once by whichever binary starts
//! up and passed explicitly to every component constructor instead.

use std::time::Instant;

use crate::config::RunnerConfig;
use crate::protocol::Rank;

/// The role a rank plays for the lifetime of the run, determined once at
/// startup from [`BootstrapInfo`] and [`RunnerConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Rank 0, not itself a spawned child: owns the scheduler.
    Controller,
    /// A single-rank worker: executes one task at a time.
    Worker,
    /// A worker, from the controller's perspective, that relays tasks to a
    /// spawned sub-group and aggregates their results.
    CollectiveBroker,
    /// A rank inside a sub-group spawned by a `CollectiveBroker`.
    CollectiveWorker,
}

/// Immutable facts about this process's place in the mesh, established
/// once at startup.
#[derive(Debug, Clone)]
pub struct BootstrapInfo {
    pub rank: Rank,
    pub size: usize,
    pub spawned: bool,
    pub start_time: Instant,
}

impl BootstrapInfo {
    pub fn new(rank: Rank, size: usize, spawned: bool) -> Self {
        BootstrapInfo {
            rank,
            size,
            spawned,
            start_time: Instant::now(),
        }
    }

    /// Whether any worker ranks exist at all.
    pub fn workers_available(&self) -> bool {
        self.size > 1
    }

    /// Classify this rank's role.
    ///
    /// The degenerate single-rank case (no substrate, controller runs
    /// everything itself) is handled by the caller before a `BootstrapInfo`
    /// is even built — see `Controller::standalone`.
    pub fn classify(&self, config: &RunnerConfig) -> Role {
        if self.spawned {
            return Role::CollectiveWorker;
        }
        if self.rank == 0 {
            return Role::Controller;
        }
        let should_spawn = config.spawn_workers || config.nprocs_per_worker > 1;
        if should_spawn {
            Role::CollectiveBroker
        } else {
            Role::Worker
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(spawn_workers: bool, nprocs_per_worker: usize) -> RunnerConfig {
        RunnerConfig {
            spawn_workers,
            nprocs_per_worker,
            ..RunnerConfig::default()
        }
    }

    #[test]
    fn rank_zero_is_controller() {
        let info = BootstrapInfo::new(0, 4, false);
        assert_eq!(info.classify(&config(false, 1)), Role::Controller);
    }

    #[test]
    fn spawned_rank_is_collective_worker_even_at_rank_zero() {
        let info = BootstrapInfo::new(0, 4, true);
        assert_eq!(info.classify(&config(false, 1)), Role::CollectiveWorker);
    }

    #[test]
    fn plain_worker_without_spawn() {
        let info = BootstrapInfo::new(1, 4, false);
        assert_eq!(info.classify(&config(false, 1)), Role::Worker);
    }

    #[test]
    fn broker_when_nprocs_per_worker_forces_spawn() {
        let info = BootstrapInfo::new(1, 4, false);
        assert_eq!(info.classify(&config(false, 3)), Role::CollectiveBroker);
    }

    #[test]
    fn broker_when_spawn_workers_forced() {
        let info = BootstrapInfo::new(1, 4, false);
        assert_eq!(info.classify(&config(true, 1)), Role::CollectiveBroker);
    }

    #[test]
    fn single_rank_has_no_workers_available() {
        assert!(!BootstrapInfo::new(0, 1, false).workers_available());
        assert!(BootstrapInfo::new(0, 2, false).workers_available());
    }
}
