//! Forkline Execution
//!
//! A fixed pool of forked worker processes fed through one shared task
//! queue. Jobs are dispatched singly or in batches, outcomes come back
//! through a drain thread that runs the caller's callbacks, and every
//! worker hands in a report when the pool closes.

pub mod async_result;
pub mod error;
pub mod handler;
pub mod pool;
pub mod report;
pub mod worker;

// Re-export main types
pub use async_result::AsyncResult;
pub use error::PoolError;
pub use handler::{TaskHandler, WorkerStats};
pub use pool::{ErrorCallback, Pool, Reports, ResultHandlers, SuccessCallback};
pub use report::ReportAggregator;
pub use worker::{WorkerProcess, WorkerProcessStatus, WorkerState};

// Re-export the types callers meet in callbacks and reports
pub use forkline_config::PoolConfig;
pub use forkline_ipc::{Codec, ErrorInfo, ErrorKind, JsonCodec, Outcome, WorkerId};

/// Serializes tests that fork or that wait for a pipe to close
#[cfg(test)]
pub(crate) static FORK_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());
