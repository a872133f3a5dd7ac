//! Inter-process communication for Forkline
//!
//! This crate provides the fast queue used between the pool coordinator and
//! its forked worker processes, together with the message envelopes that
//! travel over it.

pub mod codec;
pub mod error;
pub mod lock;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use codec::{Codec, JsonCodec};
pub use error::IpcError;
pub use lock::{ProcessLock, ProcessLockGuard};
pub use protocol::{
    ErrorInfo, ErrorKind, Outcome, ResultEnvelope, TaskEnvelope, WorkerId, IPC_PROTOCOL_VERSION,
};
pub use transport::{
    channel, FastQueue, QueueReader, QueueWriter, FRAME_HEADER_LEN, INITIAL_BUFFER_CAPACITY,
    MAX_FRAME_LEN,
};
