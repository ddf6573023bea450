//! Aggregate cluster statistics

use std::time::Duration;

/// Read-only operator-facing counters, owned and updated by the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterStatistics {
    /// Jobs accepted by `queue`
    pub queued_jobs: u64,

    /// Dispatches that ran to completion (including failed ones)
    pub completed_jobs: u64,

    /// Dispatches cut off by the job timeout
    pub timed_out_jobs: u64,

    /// Total wall-clock time spent executing jobs
    pub total_job_time: Duration,
}

impl ClusterStatistics {
    /// Average seconds per completed job
    pub fn seconds_per_job(&self) -> f64 {
        if self.completed_jobs == 0 {
            return 0.0;
        }
        self.total_job_time.as_secs_f64() / self.completed_jobs as f64
    }
}
