//! Pool coordinator: forks workers, dispatches jobs, drains results
//!
//! One task queue fans jobs out to every worker; one result queue carries
//! job outcomes and shutdown reports back to a drain thread in the
//! coordinator. The drain thread invokes the caller's callbacks and counts
//! down the active submission.

use nix::libc;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use std::fmt;
use std::os::fd::{AsRawFd, RawFd};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use forkline_config::{PoolConfig, Validatable};
use forkline_ipc::{
    channel, Codec, ErrorInfo, JsonCodec, Outcome, QueueReader, QueueWriter, ResultEnvelope,
    TaskEnvelope, WorkerId,
};

use crate::async_result::{AsyncResult, Completion};
use crate::error::PoolError;
use crate::handler::TaskHandler;
use crate::report::ReportAggregator;
use crate::worker::{run_worker, WorkerProcess, WorkerProcessStatus};

/// Submissions larger than this many chunks get a chunk size above one
const AUTO_CHUNKS: usize = 50;

/// Coordinator-side pipe ends of every live pool.
///
/// Workers forked later close these, so a pool's result pipe reaches EOF
/// once its own workers and coordinator let go of it.
static COORDINATOR_FDS: Mutex<Vec<RawFd>> = parking_lot::const_mutex(Vec::new());

fn register_fds(fds: &[RawFd]) {
    COORDINATOR_FDS.lock().extend_from_slice(fds);
}

fn unregister_fds(fds: &[RawFd]) {
    COORDINATOR_FDS.lock().retain(|fd| !fds.contains(fd));
}

/// Runs in a freshly forked worker
fn close_inherited_fds() {
    // Another thread may have held the lock at fork time
    if let Some(fds) = COORDINATOR_FDS.try_lock() {
        for &fd in fds.iter() {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

pub type SuccessCallback<R> = Arc<dyn Fn(WorkerId, R) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(WorkerId, ErrorInfo) + Send + Sync>;

/// Reports returned by [`Pool::close`], indexed by worker id
pub type Reports<P> = Vec<Option<Outcome<P>>>;

/// Callbacks run on the drain thread for every job outcome
pub struct ResultHandlers<R> {
    on_success: Option<SuccessCallback<R>>,
    on_error: Option<ErrorCallback>,
}

impl<R> ResultHandlers<R> {
    /// No callbacks; outcomes are counted and dropped
    pub fn new() -> Self {
        Self {
            on_success: None,
            on_error: None,
        }
    }

    pub fn on_success(mut self, callback: impl Fn(WorkerId, R) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl Fn(WorkerId, ErrorInfo) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    fn invoke(&self, worker_id: WorkerId, outcome: Outcome<R>) {
        match outcome {
            Ok(value) => {
                if let Some(callback) = &self.on_success {
                    callback(worker_id, value);
                }
            }
            Err(error) => {
                if let Some(callback) = &self.on_error {
                    callback(worker_id, error);
                }
            }
        }
    }
}

impl<R> Default for ResultHandlers<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Clone for ResultHandlers<R> {
    fn clone(&self) -> Self {
        Self {
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
        }
    }
}

impl<R> fmt::Debug for ResultHandlers<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultHandlers")
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// State shared between the coordinator and its drain thread
pub(crate) struct DrainShared<R, P> {
    worker_count: usize,
    handlers: RwLock<ResultHandlers<R>>,
    active: Mutex<Option<Arc<Completion>>>,
    reports: ReportAggregator<P>,
}

impl<R, P> DrainShared<R, P> {
    pub(crate) fn new(worker_count: usize) -> Self {
        Self {
            worker_count,
            handlers: RwLock::new(ResultHandlers::new()),
            active: Mutex::new(None),
            reports: ReportAggregator::new(worker_count),
        }
    }

    fn outstanding(&self) -> Option<uuid::Uuid> {
        self.active.lock().as_ref().map(|completion| completion.id())
    }

    /// Run the callback for one job outcome and count it against the active submission
    pub(crate) fn on_job(&self, worker_id: WorkerId, outcome: Outcome<R>) {
        if worker_id as usize >= self.worker_count {
            warn!(
                worker_id,
                worker_count = self.worker_count,
                "Discarding result with out-of-range worker id"
            );
            return;
        }

        let success = outcome.is_ok();
        let handlers = self.handlers.read().clone();
        if catch_unwind(AssertUnwindSafe(|| handlers.invoke(worker_id, outcome))).is_err() {
            error!(worker_id, success, "Result callback panicked");
        }

        let finished = {
            let mut active = self.active.lock();
            let last = active
                .as_ref()
                .is_some_and(|completion| completion.on_job_done(success));
            if last {
                active.take()
            } else {
                None
            }
        };

        // Slot is already free when waiters wake, so they may submit again
        if let Some(completion) = finished {
            debug!(submission_id = %completion.id(), "Submission complete");
            completion.signal();
        }
    }
}

fn drain_results<R, P, C>(results: QueueReader<ResultEnvelope<R, P>, C>, shared: Arc<DrainShared<R, P>>)
where
    R: DeserializeOwned,
    P: DeserializeOwned,
    C: Codec,
{
    loop {
        let envelope = match results.get() {
            Ok(envelope) => envelope,
            Err(e) if e.is_frame_error() => {
                warn!(error = %e, "Discarding undecodable result envelope");
                continue;
            }
            Err(e) if e.is_closed() => {
                debug!("Result channel closed");
                break;
            }
            Err(e) => {
                error!(error = %e, "Result channel failed");
                break;
            }
        };

        match envelope {
            ResultEnvelope::Job { worker_id, outcome } => shared.on_job(worker_id, outcome),
            ResultEnvelope::End { worker_id, report } => {
                debug!(worker_id, success = report.is_ok(), "Received worker report");
                shared.reports.record(worker_id, report);
            }
            ResultEnvelope::InitFailed { worker_id, error } => {
                warn!(worker_id, error = %error, "Worker failed to initialize");
            }
            ResultEnvelope::Stop => {
                debug!("Drain thread stopping");
                break;
            }
        }
    }
}

/// A fixed set of forked worker processes sharing one task queue
pub struct Pool<H: TaskHandler, C: Codec = JsonCodec> {
    config: PoolConfig,
    workers: Vec<WorkerProcess>,
    tasks: QueueWriter<TaskEnvelope<H::Job>, C>,
    results: Option<QueueWriter<ResultEnvelope<H::Output, H::Report>, C>>,
    result_fds: [RawFd; 2],
    shared: Arc<DrainShared<H::Output, H::Report>>,
    drain: Option<JoinHandle<()>>,
    closed: bool,
}

impl<H: TaskHandler> Pool<H, JsonCodec> {
    /// Fork `config.worker_count` workers, each running a handler built by
    /// `factory(&init_args)` inside its own process.
    pub fn new<F, A>(factory: F, init_args: A, config: PoolConfig) -> Result<Self, PoolError>
    where
        F: Fn(&A) -> H,
    {
        Self::with_codec(factory, init_args, config, JsonCodec)
    }
}

impl<H: TaskHandler, C: Codec> Pool<H, C> {
    /// Same as [`Pool::new`] with a custom wire codec
    pub fn with_codec<F, A>(factory: F, init_args: A, config: PoolConfig, codec: C) -> Result<Self, PoolError>
    where
        F: Fn(&A) -> H,
    {
        config.validate()?;

        let (tasks, task_reader) = channel::<TaskEnvelope<H::Job>, C>(codec.clone())?;
        let (results, result_reader) = channel::<ResultEnvelope<H::Output, H::Report>, C>(codec)?;

        let mut workers: Vec<WorkerProcess> = Vec::with_capacity(config.worker_count);
        for index in 0..config.worker_count {
            let worker_id = index as WorkerId;
            let spawned = WorkerProcess::spawn(worker_id, || {
                close_inherited_fds();
                run_worker::<H, C, _>(
                    worker_id,
                    || factory(&init_args),
                    &task_reader,
                    &results,
                    config.wrap_exceptions,
                )
            });

            match spawned {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    error!(worker_id, error = %e, "Failed to spawn worker");
                    workers.iter_mut().for_each(|worker| {
                        worker.kill();
                    });
                    return Err(e);
                }
            }
        }

        // Only workers read tasks from here on
        drop(task_reader);

        let result_fds = [results.as_raw_fd(), result_reader.as_raw_fd()];
        let shared = Arc::new(DrainShared::new(config.worker_count));
        let drain = thread::Builder::new()
            .name("forkline-drain".to_string())
            .spawn({
                let shared = Arc::clone(&shared);
                move || drain_results(result_reader, shared)
            });

        let drain = match drain {
            Ok(handle) => handle,
            Err(e) => {
                workers.iter_mut().for_each(|worker| {
                    worker.kill();
                });
                return Err(PoolError::DrainThread(e));
            }
        };

        register_fds(&[tasks.as_raw_fd(), result_fds[0], result_fds[1]]);

        let pids: Vec<u32> = workers.iter().map(WorkerProcess::pid).collect();
        info!(workers = config.worker_count, pids = ?pids, "Worker pool started");

        Ok(Self {
            config,
            workers,
            tasks,
            results: Some(results),
            result_fds,
            shared,
            drain: Some(drain),
            closed: false,
        })
    }

    /// Replace the callbacks used for every following job outcome
    pub fn set_handler(&self, handlers: ResultHandlers<H::Output>) {
        *self.shared.handlers.write() = handlers;
    }

    /// Send `jobs` to the workers and return their completion future.
    ///
    /// `handlers`, when given, replace the installed callbacks before any
    /// job is sent. `chunk_size` overrides the configured batch size.
    pub fn submit<I>(
        &mut self,
        jobs: I,
        handlers: Option<ResultHandlers<H::Output>>,
        chunk_size: Option<usize>,
    ) -> Result<AsyncResult, PoolError>
    where
        I: IntoIterator<Item = H::Job>,
    {
        if self.closed {
            return Err(PoolError::PoolClosed);
        }
        if let Some(id) = self.shared.outstanding() {
            return Err(PoolError::OutstandingSubmission(id));
        }
        if let Some(worker_id) = self
            .workers
            .iter_mut()
            .find_map(|worker| (!worker.is_alive()).then_some(worker.id))
        {
            return Err(PoolError::DeadWorker { worker_id });
        }

        let jobs: Vec<H::Job> = jobs.into_iter().collect();
        if jobs.is_empty() {
            return Ok(AsyncResult::ready());
        }

        if let Some(handlers) = handlers {
            self.set_handler(handlers);
        }

        let job_count = jobs.len();
        let chunk_size = chunk_size
            .or(self.config.batch_size)
            .unwrap_or(job_count / AUTO_CHUNKS)
            .max(1);

        let result = AsyncResult::new(job_count);
        *self.shared.active.lock() = Some(result.completion());
        debug!(submission_id = %result.id(), jobs = job_count, chunk_size, "Submitting jobs");

        if let Err(e) = self.dispatch(jobs, chunk_size) {
            self.shared.active.lock().take();
            return Err(e.into());
        }

        Ok(result)
    }

    fn dispatch(&self, jobs: Vec<H::Job>, chunk_size: usize) -> Result<(), forkline_ipc::IpcError> {
        if chunk_size == 1 {
            return jobs
                .into_iter()
                .try_for_each(|job| self.tasks.put(&TaskEnvelope::Job(job)));
        }

        let mut jobs = jobs.into_iter();
        loop {
            let batch: Vec<H::Job> = jobs.by_ref().take(chunk_size).collect();
            if batch.is_empty() {
                return Ok(());
            }
            self.tasks.put(&TaskEnvelope::Batch(batch))?;
        }
    }

    /// Shut every worker down and collect one report slot per worker.
    ///
    /// A slot is `None` when its worker never reported within
    /// `report_timeout`, for instance because it failed to initialize.
    pub fn close(&mut self) -> Result<Reports<H::Report>, PoolError> {
        if self.closed {
            return Err(PoolError::PoolClosed);
        }
        if let Some(id) = self.shared.outstanding() {
            return Err(PoolError::OutstandingSubmission(id));
        }

        for _ in 0..self.workers.len() {
            if let Err(e) = self.tasks.put(&TaskEnvelope::End) {
                debug!(error = %e, "Task channel closed while sending End");
                break;
            }
        }

        let mut clean_exit = true;
        for worker in &mut self.workers {
            let status = worker.join();
            debug!(worker_id = worker.id, status = ?status, "Worker exited");
            clean_exit &= matches!(status, WorkerProcessStatus::Exited(_));
        }

        if !self.shared.reports.wait(self.config.report_timeout) {
            if let Some(worker_id) = self.shared.reports.first_missing() {
                warn!(
                    worker_id,
                    missing = ?self.shared.reports.missing(),
                    "Timed out waiting for worker report"
                );
            }
        }

        // A worker killed mid-write leaves the result queue locked
        self.stop_drain(clean_exit);
        self.closed = true;

        let reports = self.shared.reports.take();
        info!(
            workers = self.workers.len(),
            reports = reports.iter().filter(|r| r.is_some()).count(),
            "Worker pool closed"
        );
        Ok(reports)
    }

    /// Emergency stop: kill every worker and discard pending results and reports
    pub fn terminate(&mut self) {
        if self.closed {
            return;
        }

        for worker in &mut self.workers {
            let status = worker.kill();
            debug!(worker_id = worker.id, status = ?status, "Worker killed");
        }

        if let Some(completion) = self.shared.active.lock().take() {
            debug!(submission_id = %completion.id(), "Aborting outstanding submission");
            completion.abort();
        }

        // Killed workers may hold the write lock or have left a torn frame,
        // so the drain thread is stopped by EOF rather than a Stop marker
        self.stop_drain(false);
        self.closed = true;
        warn!(workers = self.workers.len(), "Worker pool terminated");
    }

    /// Stop the drain thread, with a Stop marker or by closing the pipe
    fn stop_drain(&mut self, send_stop: bool) {
        unregister_fds(&self.result_fds);

        if let Some(results) = self.results.take() {
            if send_stop {
                if let Err(e) = results.put(&ResultEnvelope::Stop) {
                    debug!(error = %e, "Drain thread already gone");
                }
            }
        }

        if let Some(handle) = self.drain.take() {
            if handle.join().is_err() {
                error!("Drain thread panicked");
            }
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn worker_pids(&self) -> Vec<u32> {
        self.workers.iter().map(WorkerProcess::pid).collect()
    }

    /// Number of workers whose process is still running
    pub fn alive_workers(&mut self) -> usize {
        let mut alive = 0;
        for worker in &mut self.workers {
            if worker.is_alive() {
                alive += 1;
            }
        }
        alive
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

impl<H: TaskHandler, C: Codec> Drop for Pool<H, C> {
    fn drop(&mut self) {
        if !self.closed {
            self.terminate();
        }
        unregister_fds(&[self.tasks.as_raw_fd()]);
    }
}

impl<H: TaskHandler, C: Codec> fmt::Debug for Pool<H, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.config)
            .field("workers", &self.workers)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}
