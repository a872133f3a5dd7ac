//! Message types exchanged between the coordinator and worker processes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;

/// Protocol version written into every frame header
pub const IPC_PROTOCOL_VERSION: u32 = 1;

/// Ordinal worker id in `[0, worker_count)`
pub type WorkerId = u32;

/// Result of one job or one report: the value, or the failure turned into data
pub type Outcome<T> = Result<T, ErrorInfo>;

/// Messages sent from the coordinator to worker processes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEnvelope<J> {
    /// A single job
    Job(J),

    /// Consecutive jobs bundled into one frame
    Batch(Vec<J>),

    /// Stop the loop and emit a final report
    End,
}

impl<J> TaskEnvelope<J> {
    /// Number of jobs carried by this envelope
    pub fn job_count(&self) -> usize {
        match self {
            TaskEnvelope::Job(_) => 1,
            TaskEnvelope::Batch(jobs) => jobs.len(),
            TaskEnvelope::End => 0,
        }
    }
}

/// Messages sent from worker processes to the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultEnvelope<R, P> {
    /// Outcome of one job
    Job {
        worker_id: WorkerId,
        outcome: Outcome<R>,
    },

    /// Final report of a worker that received its End envelope
    End {
        worker_id: WorkerId,
        report: Outcome<P>,
    },

    /// The worker could not initialize its handler and has exited
    InitFailed { worker_id: WorkerId, error: ErrorInfo },

    /// Written by the coordinator to stop its own drain loop
    Stop,
}

impl<R, P> ResultEnvelope<R, P> {
    /// Worker that produced this envelope, if any
    pub fn worker_id(&self) -> Option<WorkerId> {
        match self {
            ResultEnvelope::Job { worker_id, .. }
            | ResultEnvelope::End { worker_id, .. }
            | ResultEnvelope::InitFailed { worker_id, .. } => Some(*worker_id),
            ResultEnvelope::Stop => None,
        }
    }

    /// Whether the envelope carries a value rather than an error
    pub fn is_success(&self) -> bool {
        match self {
            ResultEnvelope::Job { outcome, .. } => outcome.is_ok(),
            ResultEnvelope::End { report, .. } => report.is_ok(),
            ResultEnvelope::InitFailed { .. } => false,
            ResultEnvelope::Stop => true,
        }
    }
}

/// Where in the worker lifecycle a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// `process()` returned an error
    Processing,
    /// A handler method panicked
    Panic,
    /// `initialize()` failed
    Initialization,
    /// `get_report()` failed
    Report,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Processing => "processing",
            ErrorKind::Panic => "panic",
            ErrorKind::Initialization => "initialization",
            ErrorKind::Report => "report",
        };
        f.write_str(name)
    }
}

/// A handler failure carried across the process boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,
    pub occurred_at: DateTime<Utc>,
}

impl ErrorInfo {
    /// Create an error with just a message
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            causes: Vec::new(),
            trace: None,
            worker_id: None,
            occurred_at: Utc::now(),
        }
    }

    /// Capture an `anyhow` error.
    ///
    /// The cause chain is always kept. With `wrap` set the captured backtrace
    /// travels along as the trace, so the caller sees where the error started
    /// inside the worker.
    pub fn from_anyhow(kind: ErrorKind, err: &anyhow::Error, wrap: bool) -> Self {
        let mut info = Self::new(kind, err.to_string());
        info.causes = err.chain().skip(1).map(|cause| cause.to_string()).collect();
        if wrap {
            info.trace = Some(err.backtrace().to_string());
        }
        info
    }

    /// Capture a panic payload from `catch_unwind`
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_string()
        };
        Self::new(ErrorKind::Panic, message)
    }

    /// Attach the id of the worker that observed the failure
    pub fn with_worker(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    /// Attach a trace explicitly
    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.worker_id {
            Some(id) => write!(f, "{} error in worker {}: {}", self.kind, id, self.message)?,
            None => write!(f, "{} error: {}", self.kind, self.message)?,
        }
        for cause in &self.causes {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorInfo {}
