//! IPC error types

use std::io::ErrorKind;
use thiserror::Error;

/// IPC error types
#[derive(Debug, Error)]
pub enum IpcError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// The peer end of the pipe is gone
    #[error("Channel closed")]
    ChannelClosed,

    /// Protocol version mismatch
    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersionMismatch { expected: u32, actual: u32 },

    /// Frame length exceeds what the queue is willing to allocate
    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    /// Process-shared lock could not be created or acquired
    #[error("Lock error: {0}")]
    LockError(String),
}

impl IpcError {
    /// Check if this error means the other side of the channel went away.
    ///
    /// Loops that observe this treat it as a termination signal rather than
    /// a failure.
    pub fn is_closed(&self) -> bool {
        matches!(self, IpcError::ChannelClosed)
    }

    /// Check if the stream is still aligned on a frame boundary after this error
    pub fn is_frame_error(&self) -> bool {
        matches!(
            self,
            IpcError::SerializationError(_) | IpcError::DeserializationError(_)
        )
    }
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset => {
                IpcError::ChannelClosed
            }
            _ => IpcError::IoError(err.to_string()),
        }
    }
}

impl From<nix::Error> for IpcError {
    fn from(err: nix::Error) -> Self {
        IpcError::from(std::io::Error::from(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_map_to_closed() {
        let broken = std::io::Error::new(ErrorKind::BrokenPipe, "pipe");
        assert!(IpcError::from(broken).is_closed());

        let eof = std::io::Error::new(ErrorKind::UnexpectedEof, "eof");
        assert!(IpcError::from(eof).is_closed());

        let other = std::io::Error::new(ErrorKind::PermissionDenied, "nope");
        assert!(!IpcError::from(other).is_closed());
    }

    #[test]
    fn test_nix_epipe_maps_to_closed() {
        assert!(IpcError::from(nix::Error::EPIPE).is_closed());
        assert!(!IpcError::from(nix::Error::EINVAL).is_closed());
    }

    #[test]
    fn test_frame_errors() {
        assert!(IpcError::DeserializationError("bad".to_string()).is_frame_error());
        assert!(IpcError::SerializationError("bad".to_string()).is_frame_error());
        assert!(!IpcError::ChannelClosed.is_frame_error());
        assert!(!IpcError::ProtocolVersionMismatch { expected: 1, actual: 2 }.is_frame_error());
    }
}
