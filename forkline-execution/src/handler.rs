//! The capability interface implemented by embedding applications

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use forkline_ipc::WorkerId;

/// Work performed inside a worker process.
///
/// One instance is built per worker, inside that worker's process, by the
/// factory handed to the pool, so implementations do not need to be `Send`.
pub trait TaskHandler {
    /// Unit of work submitted by the caller
    type Job: Serialize + DeserializeOwned;

    /// Value produced for each successful job
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Summary produced once per worker at shutdown
    type Report: Serialize + DeserializeOwned + Default + Send + 'static;

    /// Called once when the worker process starts.
    ///
    /// An error here stops this worker before it takes any job.
    fn initialize(&mut self) -> anyhow::Result<()>;

    /// Called once per job
    fn process(&mut self, job: Self::Job) -> anyhow::Result<Self::Output>;

    /// Called once after the End envelope arrives
    fn get_report(&mut self, _stats: &WorkerStats) -> anyhow::Result<Self::Report> {
        Ok(Self::Report::default())
    }

    /// Best-effort cleanup before the process exits
    fn shutdown(&mut self) {}
}

/// Timing statistics a worker collects while it runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub worker_id: WorkerId,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub jobs_processed: u64,
    pub jobs_failed: u64,
    pub batches_received: u64,
    pub busy_time: Duration,
}

impl WorkerStats {
    /// Create a new stats record
    pub fn new(worker_id: WorkerId, pid: u32) -> Self {
        let now = Utc::now();
        Self {
            worker_id,
            pid,
            started_at: now,
            last_activity: now,
            jobs_processed: 0,
            jobs_failed: 0,
            batches_received: 0,
            busy_time: Duration::ZERO,
        }
    }

    /// Record one finished job
    pub fn record_job(&mut self, success: bool, elapsed: Duration) {
        self.jobs_processed += 1;
        if !success {
            self.jobs_failed += 1;
        }
        self.busy_time += elapsed;
        self.last_activity = Utc::now();
    }

    /// Record a Batch envelope being unrolled
    pub fn record_batch(&mut self) {
        self.batches_received += 1;
    }

    /// Time since the worker started
    pub fn uptime(&self) -> Duration {
        (Utc::now() - self.started_at).to_std().unwrap_or_default()
    }
}
