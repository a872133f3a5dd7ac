//! Error types for the worker pool

use forkline_ipc::{IpcError, WorkerId};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised synchronously to callers of the pool.
///
/// Failures inside a job or a worker's report never show up here; they
/// travel back as `ErrorInfo` values through the result channel.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Failed to spawn worker {worker_id}: {message}")]
    SetupError { worker_id: WorkerId, message: String },

    #[error("Failed to start drain thread: {0}")]
    DrainThread(#[source] std::io::Error),

    #[error("Submission {0} is still outstanding")]
    OutstandingSubmission(Uuid),

    #[error("Worker {worker_id} is not alive")]
    DeadWorker { worker_id: WorkerId },

    #[error("Pool is closed")]
    PoolClosed,

    #[error("IPC error: {0}")]
    IpcError(#[from] IpcError),

    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] forkline_config::ConfigError),
}

impl PoolError {
    /// Check if this error is a violation of the pool's usage contract
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            PoolError::OutstandingSubmission(_) | PoolError::DeadWorker { .. } | PoolError::PoolClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_errors() {
        assert!(PoolError::PoolClosed.is_usage_error());
        assert!(PoolError::DeadWorker { worker_id: 1 }.is_usage_error());
        assert!(PoolError::OutstandingSubmission(Uuid::new_v4()).is_usage_error());
        assert!(!PoolError::IpcError(IpcError::ChannelClosed).is_usage_error());
    }

    #[test]
    fn test_error_messages() {
        let err = PoolError::SetupError {
            worker_id: 3,
            message: "EAGAIN".to_string(),
        };
        assert_eq!(err.to_string(), "Failed to spawn worker 3: EAGAIN");
        assert_eq!(
            PoolError::DeadWorker { worker_id: 0 }.to_string(),
            "Worker 0 is not alive"
        );
    }
}
