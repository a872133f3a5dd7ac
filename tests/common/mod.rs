//! Handlers and helpers shared by the multi-process tests

#![allow(dead_code)]

use anyhow::bail;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use forkline_execution::{ErrorInfo, ResultHandlers, TaskHandler, WorkerId, WorkerStats};

static FORK_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// Take the process-wide fork lock and make sure logging is set up.
///
/// Forking while another test thread is building a pool would leak that
/// pool's pipe descriptors into our workers.
pub fn serial() -> MutexGuard<'static, ()> {
    let _ = forkline_logging::init_simple_tracing("warn");
    FORK_LOCK.lock()
}

pub const WAIT: Option<Duration> = Some(Duration::from_secs(20));

/// Run `f` with a warn-level subscriber on this thread and return what it logged
pub fn capture_warnings<T>(f: impl FnOnce() -> T) -> (T, String) {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&buffer);
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || LogSink(Arc::clone(&sink)))
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .finish();

    let value = tracing::subscriber::with_default(subscriber, f);
    let logged = String::from_utf8_lossy(&buffer.lock()).into_owned();
    (value, logged)
}

struct LogSink(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Report handed in by every test handler at shutdown
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub pid: u32,
    pub jobs: u64,
    pub failed: u64,
    pub batches: u64,
}

impl From<&WorkerStats> for Summary {
    fn from(stats: &WorkerStats) -> Self {
        Self {
            pid: stats.pid,
            jobs: stats.jobs_processed,
            failed: stats.jobs_failed,
            batches: stats.batches_received,
        }
    }
}

/// What a test handler should get wrong
#[derive(Debug, Clone, Copy, Default)]
pub struct Faults {
    pub fail_init: bool,
    pub fail_jobs: bool,
    pub fail_report: bool,
    pub job_delay: Duration,
}

/// `process(x) = x * x`, with optional failures
pub struct Square {
    faults: Faults,
}

impl Square {
    pub fn build(faults: &Faults) -> Self {
        Self { faults: *faults }
    }
}

impl TaskHandler for Square {
    type Job = u64;
    type Output = u64;
    type Report = Summary;

    fn initialize(&mut self) -> anyhow::Result<()> {
        if self.faults.fail_init {
            bail!("model weights missing");
        }
        Ok(())
    }

    fn process(&mut self, job: u64) -> anyhow::Result<u64> {
        if !self.faults.job_delay.is_zero() {
            std::thread::sleep(self.faults.job_delay);
        }
        if self.faults.fail_jobs {
            return Err(anyhow::anyhow!("value {} rejected", job).context("squaring job"));
        }
        Ok(job * job)
    }

    fn get_report(&mut self, stats: &WorkerStats) -> anyhow::Result<Summary> {
        if self.faults.fail_report {
            bail!("summary store unavailable");
        }
        Ok(Summary::from(stats))
    }
}

/// Echoes each job together with the pid that processed it
pub struct Tagger;

impl TaskHandler for Tagger {
    type Job = u64;
    type Output = (u32, u64);
    type Report = Summary;

    fn initialize(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn process(&mut self, job: u64) -> anyhow::Result<(u32, u64)> {
        Ok((std::process::id(), job))
    }

    fn get_report(&mut self, stats: &WorkerStats) -> anyhow::Result<Summary> {
        Ok(Summary::from(stats))
    }
}

/// Answers every job with a 1 MiB string
pub struct Bulky;

impl TaskHandler for Bulky {
    type Job = u64;
    type Output = String;
    type Report = Summary;

    fn initialize(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn process(&mut self, _job: u64) -> anyhow::Result<String> {
        Ok("x".repeat(1 << 20))
    }
}

/// Everything the drain thread handed to the callbacks
pub struct Collected<R> {
    pub successes: Arc<Mutex<Vec<(WorkerId, R)>>>,
    pub errors: Arc<Mutex<Vec<(WorkerId, ErrorInfo)>>>,
}

impl<R: Send + 'static> Collected<R> {
    pub fn new() -> Self {
        Self {
            successes: Arc::new(Mutex::new(Vec::new())),
            errors: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn handlers(&self) -> ResultHandlers<R> {
        let successes = Arc::clone(&self.successes);
        let errors = Arc::clone(&self.errors);
        ResultHandlers::new()
            .on_success(move |worker_id, value| successes.lock().push((worker_id, value)))
            .on_error(move |worker_id, error| errors.lock().push((worker_id, error)))
    }

    pub fn success_count(&self) -> usize {
        self.successes.lock().len()
    }

    pub fn error_count(&self) -> usize {
        self.errors.lock().len()
    }
}
