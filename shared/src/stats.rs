//! Run statistics: the `info()` observational report.
//!
//! Purely derived from `Controller::stats`/`total_time`/`total_time_est`;
//! mirrors a mean/std-dev/coefficient-of-variation rollup, but as a value
//! the caller can log or render however it likes.

use std::collections::HashMap;

use crate::protocol::{Rank, StatsRecord};

/// Aggregate statistics for a single worker rank.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSummary {
    pub rank: Rank,
    pub n_processed: u64,
    pub total_time: f64,
    pub total_time_est: f64,
}

/// A full run report, as returned by `Controller::info()`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub results_collected: u64,
    pub results_pending: usize,
    pub total_call_time: f64,
    pub mean_call_time: f64,
    pub stddev_call_time: f64,
    pub coeff_var_call_time_over_est: f64,
    pub workers: Vec<WorkerSummary>,
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        0.0
    } else {
        xs.iter().sum::<f64>() / xs.len() as f64
    }
}

fn stddev(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let m = mean(xs);
    let variance = xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / xs.len() as f64;
    variance.sqrt()
}

/// Build a [`RunReport`] from the controller's bookkeeping.
pub fn build_report(
    stats: &[StatsRecord],
    results_pending: usize,
    n_processed: &HashMap<Rank, u64>,
    total_time: &HashMap<Rank, f64>,
    total_time_est: &HashMap<Rank, f64>,
) -> RunReport {
    let call_times: Vec<f64> = stats.iter().map(|s| s.this_time).collect();
    let call_quotients: Vec<f64> = stats.iter().map(|s| s.time_over_est).collect();

    let mut worker_ranks: Vec<Rank> = n_processed.keys().copied().collect();
    worker_ranks.sort_unstable();

    let workers = worker_ranks
        .into_iter()
        .map(|rank| WorkerSummary {
            rank,
            n_processed: *n_processed.get(&rank).unwrap_or(&0),
            total_time: *total_time.get(&rank).unwrap_or(&0.0),
            total_time_est: *total_time_est.get(&rank).unwrap_or(&0.0),
        })
        .collect();

    RunReport {
        results_collected: stats.len() as u64,
        results_pending,
        total_call_time: call_times.iter().sum(),
        mean_call_time: mean(&call_times),
        stddev_call_time: stddev(&call_times),
        coeff_var_call_time_over_est: {
            let m = mean(&call_quotients);
            if m == 0.0 {
                0.0
            } else {
                stddev(&call_quotients) / m
            }
        },
        workers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_report_has_zeroed_stats() {
        let report = build_report(&[], 0, &HashMap::new(), &HashMap::new(), &HashMap::new());
        assert_eq!(report.results_collected, 0);
        assert_eq!(report.total_call_time, 0.0);
        assert_eq!(report.mean_call_time, 0.0);
    }

    #[test]
    fn aggregates_call_times() {
        let stats = vec![
            StatsRecord {
                task_id: 0,
                rank: 1,
                this_time: 1.0,
                time_over_est: 1.0,
                n_processed: 1,
                total_time: 1.0,
            },
            StatsRecord {
                task_id: 1,
                rank: 1,
                this_time: 3.0,
                time_over_est: 3.0,
                n_processed: 2,
                total_time: 4.0,
            },
        ];
        let mut n_processed = HashMap::new();
        n_processed.insert(1, 2);
        let mut total_time = HashMap::new();
        total_time.insert(1, 4.0);
        let mut total_time_est = HashMap::new();
        total_time_est.insert(1, 2.0);

        let report = build_report(&stats, 0, &n_processed, &total_time, &total_time_est);
        assert_eq!(report.results_collected, 2);
        assert_eq!(report.total_call_time, 4.0);
        assert_eq!(report.mean_call_time, 2.0);
        assert_eq!(report.workers.len(), 1);
        assert_eq!(report.workers[0].n_processed, 2);
    }
}
