//! Fast queue: length-prefixed frames over an OS pipe
//!
//! Each half of the queue owns one reusable byte buffer. Writers serialize
//! into their buffer from offset zero and send the exact frame; readers
//! receive into theirs and grow it to twice the incoming frame size when it
//! is too small, so resizes stay logarithmic in the largest message seen.
//!
//! Frame layout: `[u32 protocol version LE][u32 payload length LE][payload]`.

use std::fs::File;
use std::io::{Read, Write};
use std::marker::PhantomData;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use crate::codec::{Codec, JsonCodec};
use crate::error::IpcError;
use crate::lock::ProcessLock;
use crate::protocol::IPC_PROTOCOL_VERSION;

/// Starting size of both the write and the read buffer
pub const INITIAL_BUFFER_CAPACITY: usize = 256;

/// Bytes preceding every payload
pub const FRAME_HEADER_LEN: usize = 8;

/// Largest payload a queue will send or accept
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// Create the two halves of a queue over a fresh pipe
pub fn channel<T, C: Codec>(codec: C) -> Result<(QueueWriter<T, C>, QueueReader<T, C>), IpcError> {
    let (read_fd, write_fd) = nix::unistd::pipe()?;

    let writer = QueueWriter {
        pipe: File::from(write_fd),
        lock: ProcessLock::new()?,
        buf: Mutex::new(Vec::with_capacity(INITIAL_BUFFER_CAPACITY)),
        codec: codec.clone(),
        _marker: PhantomData,
    };

    let reader = QueueReader {
        pipe: File::from(read_fd),
        lock: ProcessLock::new()?,
        buf: Mutex::new(vec![0u8; INITIAL_BUFFER_CAPACITY]),
        resizes: AtomicUsize::new(0),
        codec,
        _marker: PhantomData,
    };

    Ok((writer, reader))
}

/// Sending half of a fast queue
pub struct QueueWriter<T, C = JsonCodec> {
    pipe: File,
    lock: ProcessLock,
    buf: Mutex<Vec<u8>>,
    codec: C,
    _marker: PhantomData<fn(T)>,
}

impl<T: Serialize, C: Codec> QueueWriter<T, C> {
    /// Serialize `value` and send it as one frame.
    ///
    /// Blocks while the pipe is full. Returns [`IpcError::ChannelClosed`]
    /// once no process holds the read end any more.
    pub fn put(&self, value: &T) -> Result<(), IpcError> {
        let mut buf = self.buf.lock();
        buf.clear();
        buf.extend_from_slice(&[0u8; FRAME_HEADER_LEN]);
        self.codec.encode(value, &mut buf)?;

        let len = buf.len() - FRAME_HEADER_LEN;
        if len > MAX_FRAME_LEN {
            return Err(IpcError::FrameTooLarge {
                len,
                max: MAX_FRAME_LEN,
            });
        }
        buf[..4].copy_from_slice(&IPC_PROTOCOL_VERSION.to_le_bytes());
        buf[4..FRAME_HEADER_LEN].copy_from_slice(&(len as u32).to_le_bytes());

        let _guard = self.lock.lock()?;
        (&self.pipe).write_all(&buf)?;
        Ok(())
    }
}

impl<T, C> AsRawFd for QueueWriter<T, C> {
    fn as_raw_fd(&self) -> RawFd {
        self.pipe.as_raw_fd()
    }
}

impl<T, C> QueueWriter<T, C> {
    /// Current capacity of the write buffer
    pub fn write_capacity(&self) -> usize {
        self.buf.lock().capacity()
    }
}

/// Receiving half of a fast queue
pub struct QueueReader<T, C = JsonCodec> {
    pipe: File,
    lock: ProcessLock,
    buf: Mutex<Vec<u8>>,
    resizes: AtomicUsize,
    codec: C,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned, C: Codec> QueueReader<T, C> {
    /// Block until the next frame arrives and decode it.
    ///
    /// Returns [`IpcError::ChannelClosed`] once every write end is closed.
    /// A decode failure consumes exactly one frame, so the next call reads
    /// the following message.
    pub fn get(&self) -> Result<T, IpcError> {
        let mut buf = self.buf.lock();

        let len = {
            let _guard = self.lock.lock()?;

            let mut header = [0u8; FRAME_HEADER_LEN];
            (&self.pipe).read_exact(&mut header)?;

            let version = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            if version != IPC_PROTOCOL_VERSION {
                return Err(IpcError::ProtocolVersionMismatch {
                    expected: IPC_PROTOCOL_VERSION,
                    actual: version,
                });
            }

            let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
            if len > MAX_FRAME_LEN {
                return Err(IpcError::FrameTooLarge {
                    len,
                    max: MAX_FRAME_LEN,
                });
            }

            if buf.len() < len {
                let grown = len.saturating_mul(2);
                trace!(from = buf.len(), to = grown, "Growing fast queue read buffer");
                buf.resize(grown, 0);
                self.resizes.fetch_add(1, Ordering::Relaxed);
            }

            (&self.pipe).read_exact(&mut buf[..len])?;
            len
        };

        self.codec.decode(&buf[..len])
    }
}

impl<T, C> AsRawFd for QueueReader<T, C> {
    fn as_raw_fd(&self) -> RawFd {
        self.pipe.as_raw_fd()
    }
}

impl<T, C> QueueReader<T, C> {
    /// Current size of the read buffer
    pub fn read_capacity(&self) -> usize {
        self.buf.lock().len()
    }

    /// How many times the read buffer has been grown
    pub fn read_resizes(&self) -> usize {
        self.resizes.load(Ordering::Relaxed)
    }
}

/// Both halves of a queue held by one owner
pub struct FastQueue<T, C = JsonCodec> {
    writer: QueueWriter<T, C>,
    reader: QueueReader<T, C>,
}

impl<T> FastQueue<T, JsonCodec> {
    /// Create a queue using the JSON codec
    pub fn new() -> Result<Self, IpcError> {
        Self::with_codec(JsonCodec)
    }
}

impl<T, C: Codec> FastQueue<T, C> {
    /// Create a queue using `codec`
    pub fn with_codec(codec: C) -> Result<Self, IpcError> {
        let (writer, reader) = channel(codec)?;
        Ok(Self { writer, reader })
    }

    /// Separate the sending and receiving halves
    pub fn split(self) -> (QueueWriter<T, C>, QueueReader<T, C>) {
        (self.writer, self.reader)
    }

    pub fn writer(&self) -> &QueueWriter<T, C> {
        &self.writer
    }

    pub fn reader(&self) -> &QueueReader<T, C> {
        &self.reader
    }
}

impl<T: Serialize, C: Codec> FastQueue<T, C> {
    pub fn put(&self, value: &T) -> Result<(), IpcError> {
        self.writer.put(value)
    }
}

impl<T: DeserializeOwned, C: Codec> FastQueue<T, C> {
    pub fn get(&self) -> Result<T, IpcError> {
        self.reader.get()
    }
}
