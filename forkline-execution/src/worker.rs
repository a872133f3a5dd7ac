//! Worker processes: the loop each one runs, and the coordinator's handle to it

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;
use tracing::{debug, info_span, warn};

use forkline_ipc::{
    Codec, ErrorInfo, ErrorKind, IpcError, Outcome, QueueReader, QueueWriter, ResultEnvelope,
    TaskEnvelope, WorkerId,
};

use crate::error::PoolError;
use crate::handler::{TaskHandler, WorkerStats};

/// Exit code after an orderly End
pub const EXIT_OK: i32 = 0;
/// Exit code when the handler could not be built or initialized
pub const EXIT_INIT_FAILED: i32 = 3;
/// Exit code when a channel closed or failed before End arrived
pub const EXIT_CHANNEL_LOST: i32 = 4;
/// Exit code when the worker body panicked outside any handler call
pub const EXIT_PANICKED: i32 = 101;

pub(crate) type TaskReader<H, C> = QueueReader<TaskEnvelope<<H as TaskHandler>::Job>, C>;
pub(crate) type ResultWriter<H, C> =
    QueueWriter<ResultEnvelope<<H as TaskHandler>::Output, <H as TaskHandler>::Report>, C>;

/// Lifecycle of the loop inside a worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Initializing,
    Running,
    Draining,
    Terminated,
}

/// Build a handler and run the worker loop until End or channel loss.
///
/// Returns the process exit code.
pub(crate) fn run_worker<H, C, F>(
    worker_id: WorkerId,
    build: F,
    tasks: &TaskReader<H, C>,
    results: &ResultWriter<H, C>,
    wrap_exceptions: bool,
) -> i32
where
    H: TaskHandler,
    C: Codec,
    F: FnOnce() -> H,
{
    let span = info_span!("worker", worker_id);
    let _enter = span.enter();

    match catch_unwind(AssertUnwindSafe(build)) {
        Ok(handler) => WorkerLoop::new(worker_id, handler, tasks, results, wrap_exceptions).run(),
        Err(panic) => {
            let error = ErrorInfo::from_panic(panic).with_worker(worker_id);
            report_init_failure::<H, C>(worker_id, error, results);
            EXIT_INIT_FAILED
        }
    }
}

fn report_init_failure<H: TaskHandler, C: Codec>(
    worker_id: WorkerId,
    mut error: ErrorInfo,
    results: &ResultWriter<H, C>,
) {
    error.kind = ErrorKind::Initialization;
    warn!(error = %error, "Worker failed to initialize");
    if let Err(e) = results.put(&ResultEnvelope::InitFailed { worker_id, error }) {
        debug!(error = %e, "Could not deliver initialization failure");
    }
}

/// Bridges the task and result channels to one handler instance
pub(crate) struct WorkerLoop<'a, H: TaskHandler, C: Codec> {
    worker_id: WorkerId,
    handler: H,
    tasks: &'a TaskReader<H, C>,
    results: &'a ResultWriter<H, C>,
    wrap_exceptions: bool,
    stats: WorkerStats,
    state: WorkerState,
}

impl<'a, H: TaskHandler, C: Codec> WorkerLoop<'a, H, C> {
    pub(crate) fn new(
        worker_id: WorkerId,
        handler: H,
        tasks: &'a TaskReader<H, C>,
        results: &'a ResultWriter<H, C>,
        wrap_exceptions: bool,
    ) -> Self {
        Self {
            worker_id,
            handler,
            tasks,
            results,
            wrap_exceptions,
            stats: WorkerStats::new(worker_id, std::process::id()),
            state: WorkerState::Initializing,
        }
    }

    /// Run the state machine to `Terminated` and return the exit code
    pub(crate) fn run(mut self) -> i32 {
        let code = match self.initialize() {
            Ok(()) => {
                self.transition(WorkerState::Running);
                self.serve()
            }
            Err(error) => {
                report_init_failure::<H, C>(self.worker_id, error, self.results);
                EXIT_INIT_FAILED
            }
        };

        self.transition(WorkerState::Terminated);
        if catch_unwind(AssertUnwindSafe(|| self.handler.shutdown())).is_err() {
            warn!("Handler panicked during shutdown");
        }
        code
    }

    fn transition(&mut self, next: WorkerState) {
        debug!(from = ?self.state, to = ?next, "Worker state change");
        self.state = next;
    }

    fn initialize(&mut self) -> Result<(), ErrorInfo> {
        match catch_unwind(AssertUnwindSafe(|| self.handler.initialize())) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(self.capture(ErrorKind::Initialization, &err)),
            Err(panic) => Err(ErrorInfo::from_panic(panic).with_worker(self.worker_id)),
        }
    }

    fn serve(&mut self) -> i32 {
        loop {
            let envelope = match self.tasks.get() {
                Ok(envelope) => envelope,
                Err(e) if e.is_frame_error() => {
                    warn!(error = %e, "Discarding undecodable task envelope");
                    continue;
                }
                Err(e) => {
                    debug!(error = %e, "Task channel lost before End");
                    return EXIT_CHANNEL_LOST;
                }
            };

            let sent = match envelope {
                TaskEnvelope::Job(job) => self.run_job(job),
                TaskEnvelope::Batch(jobs) => {
                    self.stats.record_batch();
                    jobs.into_iter().try_for_each(|job| self.run_job(job))
                }
                TaskEnvelope::End => {
                    self.transition(WorkerState::Draining);
                    return match self.send_report() {
                        Ok(()) => EXIT_OK,
                        Err(e) => {
                            debug!(error = %e, "Could not deliver report");
                            EXIT_CHANNEL_LOST
                        }
                    };
                }
            };

            if let Err(e) = sent {
                debug!(error = %e, "Result channel lost");
                return EXIT_CHANNEL_LOST;
            }
        }
    }

    fn run_job(&mut self, job: H::Job) -> Result<(), IpcError> {
        let started = Instant::now();
        let outcome = match catch_unwind(AssertUnwindSafe(|| self.handler.process(job))) {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => Err(self.capture(ErrorKind::Processing, &err)),
            Err(panic) => Err(ErrorInfo::from_panic(panic).with_worker(self.worker_id)),
        };
        self.stats.record_job(outcome.is_ok(), started.elapsed());

        let worker_id = self.worker_id;
        self.send(outcome, ErrorKind::Processing, |outcome| ResultEnvelope::Job {
            worker_id,
            outcome,
        })
    }

    fn send_report(&mut self) -> Result<(), IpcError> {
        let stats = self.stats.clone();
        let report = match catch_unwind(AssertUnwindSafe(|| self.handler.get_report(&stats))) {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(err)) => Err(self.capture(ErrorKind::Report, &err)),
            Err(panic) => Err(ErrorInfo::from_panic(panic).with_worker(self.worker_id)),
        };

        let worker_id = self.worker_id;
        self.send(report, ErrorKind::Report, |report| ResultEnvelope::End { worker_id, report })
    }

    /// Put an envelope, replacing a value that fails to encode with the encode error
    fn send<T>(
        &self,
        outcome: Outcome<T>,
        kind: ErrorKind,
        wrap: impl Fn(Outcome<T>) -> ResultEnvelope<H::Output, H::Report>,
    ) -> Result<(), IpcError> {
        match self.results.put(&wrap(outcome)) {
            Err(e) if e.is_frame_error() => {
                let error = ErrorInfo::new(kind, format!("failed to encode result: {}", e))
                    .with_worker(self.worker_id);
                self.results.put(&wrap(Err(error)))
            }
            other => other,
        }
    }

    fn capture(&self, kind: ErrorKind, err: &anyhow::Error) -> ErrorInfo {
        ErrorInfo::from_anyhow(kind, err, self.wrap_exceptions).with_worker(self.worker_id)
    }
}

/// How a worker process ended, as seen by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerProcessStatus {
    Running,
    Exited(i32),
    Signaled(Signal),
    /// Reaped elsewhere; the exit status is unknown
    Lost,
}

/// Coordinator-side handle to one forked worker
#[derive(Debug)]
pub struct WorkerProcess {
    pub id: WorkerId,
    pid: Pid,
    pub started_at: DateTime<Utc>,
    status: WorkerProcessStatus,
}

impl WorkerProcess {
    /// Fork a child that runs `child_main` and exits with its return value.
    ///
    /// The child never returns into the caller's stack and never runs the
    /// parent's destructors. On Linux it is killed when the coordinator dies.
    pub fn spawn<F>(id: WorkerId, child_main: F) -> Result<Self, PoolError>
    where
        F: FnOnce() -> i32,
    {
        let parent = nix::unistd::getpid();

        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                debug!(worker_id = id, pid = child.as_raw(), "Forked worker process");
                Ok(Self {
                    id,
                    pid: child,
                    started_at: Utc::now(),
                    status: WorkerProcessStatus::Running,
                })
            }
            Ok(ForkResult::Child) => {
                #[cfg(target_os = "linux")]
                {
                    let _ = nix::sys::prctl::set_pdeathsig(Signal::SIGKILL);
                    if nix::unistd::getppid() != parent {
                        unsafe { libc::_exit(EXIT_CHANNEL_LOST) }
                    }
                }
                #[cfg(not(target_os = "linux"))]
                let _ = parent;

                let code = catch_unwind(AssertUnwindSafe(child_main)).unwrap_or(EXIT_PANICKED);
                unsafe { libc::_exit(code) }
            }
            Err(errno) => Err(PoolError::SetupError {
                worker_id: id,
                message: errno.to_string(),
            }),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Last observed status, without polling the process
    pub fn status(&self) -> WorkerProcessStatus {
        self.status
    }

    /// Poll the process without blocking
    pub fn is_alive(&mut self) -> bool {
        if self.status != WorkerProcessStatus::Running {
            return false;
        }

        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => true,
            Ok(status) => {
                self.record(status);
                self.status == WorkerProcessStatus::Running
            }
            Err(Errno::ECHILD) => {
                self.status = WorkerProcessStatus::Lost;
                false
            }
            Err(e) => {
                warn!(worker_id = self.id, error = %e, "Could not poll worker process");
                true
            }
        }
    }

    /// Block until the process exits
    pub fn join(&mut self) -> WorkerProcessStatus {
        while self.status == WorkerProcessStatus::Running {
            match waitpid(self.pid, None) {
                Ok(status) => self.record(status),
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    debug!(worker_id = self.id, error = %e, "Worker already reaped");
                    self.status = WorkerProcessStatus::Lost;
                }
            }
        }
        self.status
    }

    /// Emergency stop: SIGKILL, then reap
    pub fn kill(&mut self) -> WorkerProcessStatus {
        if self.status == WorkerProcessStatus::Running {
            if let Err(e) = signal::kill(self.pid, Signal::SIGKILL) {
                debug!(worker_id = self.id, error = %e, "Failed to signal worker");
            }
        }
        self.join()
    }

    fn record(&mut self, status: WaitStatus) {
        match status {
            WaitStatus::Exited(_, code) => self.status = WorkerProcessStatus::Exited(code),
            WaitStatus::Signaled(_, sig, _) => self.status = WorkerProcessStatus::Signaled(sig),
            _ => {}
        }
    }
}
