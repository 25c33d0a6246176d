//! Readable stream capability and its decorators.
//!
//! Every stream in the engine implements [`ByteStream`]: sequential `read`,
//! optional `seek`, and an explicit async `close` that reports a [`Completion`].
//! Decorators wrap an inner stream they own and forward what they don't change:
//!
//! - [`BackupStream`]: tees a read-once source into a seekable backup sink
//! - [`StreamCloner`]: mirrors reads into a sink, serving backward seeks from it
//! - [`StreamWatcher`]: reports seeks, reads and close to an observer
//!
//! [`FileStream`] and [`MemoryStream`] are the plain sources.

mod backup;
mod cloner;
mod file;
mod watcher;

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite};

pub use backup::{BLOCK_SIZE, BackupStream};
pub use cloner::StreamCloner;
pub use file::FileStream;
pub use watcher::{StreamObserver, StreamWatcher};

/// Outcome of closing a stream. Exactly one is produced per stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Succeeded {
        bytes: u64,
    },
    Failed {
        bytes: u64,
        expected: Option<u64>,
        cancelled: bool,
    },
}

impl Completion {
    /// Decide the outcome from what was persisted.
    ///
    /// A known expected length must match exactly. Without one, the stream must
    /// have reached its end. Cancellation always fails.
    pub fn evaluate(bytes: u64, expected: Option<u64>, reached_end: bool, cancelled: bool) -> Self {
        let complete = match expected {
            Some(len) => bytes == len,
            None => reached_end,
        };
        if complete && !cancelled {
            Self::Succeeded { bytes }
        } else {
            Self::Failed {
                bytes,
                expected,
                cancelled,
            }
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    pub fn bytes(&self) -> u64 {
        match self {
            Self::Succeeded { bytes } | Self::Failed { bytes, .. } => *bytes,
        }
    }
}

#[async_trait]
pub trait ByteStream: Send {
    /// Read into `buf`, returning 0 at end of stream.
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Total length when the source knows it.
    fn len(&self) -> Option<u64>;

    /// Current absolute position.
    fn position(&self) -> u64;

    fn can_seek(&self) -> bool {
        false
    }

    /// Move to an absolute position and return it.
    async fn seek(&mut self, _pos: u64) -> io::Result<u64> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "stream does not support seeking",
        ))
    }

    /// Release the stream. Calling it again returns the first outcome.
    async fn close(&mut self) -> io::Result<Completion>;
}

#[async_trait]
impl<T: ByteStream + ?Sized> ByteStream for Box<T> {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf).await
    }

    fn len(&self) -> Option<u64> {
        (**self).len()
    }

    fn position(&self) -> u64 {
        (**self).position()
    }

    fn can_seek(&self) -> bool {
        (**self).can_seek()
    }

    async fn seek(&mut self, pos: u64) -> io::Result<u64> {
        (**self).seek(pos).await
    }

    async fn close(&mut self) -> io::Result<Completion> {
        (**self).close().await
    }
}

#[async_trait]
impl<T: ByteStream + ?Sized> ByteStream for &mut T {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf).await
    }

    fn len(&self) -> Option<u64> {
        (**self).len()
    }

    fn position(&self) -> u64 {
        (**self).position()
    }

    fn can_seek(&self) -> bool {
        (**self).can_seek()
    }

    async fn seek(&mut self, pos: u64) -> io::Result<u64> {
        (**self).seek(pos).await
    }

    async fn close(&mut self) -> io::Result<Completion> {
        (**self).close().await
    }
}

/// Backing store for the tee decorators.
pub trait SeekableSink: AsyncRead + AsyncWrite + AsyncSeek + Unpin + Send {}

impl<T> SeekableSink for T where T: AsyncRead + AsyncWrite + AsyncSeek + Unpin + Send {}

#[derive(Debug)]
struct StreamCancelled;

impl fmt::Display for StreamCancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("stream canceled")
    }
}

impl std::error::Error for StreamCancelled {}

/// The error a stream returns when its cancellation token fires mid-read.
pub fn cancelled_error() -> io::Error {
    io::Error::other(StreamCancelled)
}

pub fn is_cancellation(err: &io::Error) -> bool {
    err.get_ref()
        .is_some_and(|inner| inner.is::<StreamCancelled>())
}

/// Read until `buf` is full or the stream ends.
pub(crate) async fn read_full<S: ByteStream + ?Sized>(
    stream: &mut S,
    buf: &mut [u8],
) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// In-memory stream over a shared buffer.
///
/// Counts calls to `read` so callers can check whether a decorator went back
/// to the source.
pub struct MemoryStream {
    data: Arc<Vec<u8>>,
    position: u64,
    seekable: bool,
    reads: Arc<AtomicUsize>,
    /// Reads at or past this offset fail, like a dropped connection.
    fail_at: Option<u64>,
    closed: Option<Completion>,
}

impl MemoryStream {
    pub fn new(data: impl Into<Arc<Vec<u8>>>) -> Self {
        Self {
            data: data.into(),
            position: 0,
            seekable: true,
            reads: Arc::new(AtomicUsize::new(0)),
            fail_at: None,
            closed: None,
        }
    }

    /// A forward-only stream, like most remote downloads.
    pub fn read_once(data: impl Into<Arc<Vec<u8>>>) -> Self {
        Self {
            seekable: false,
            ..Self::new(data)
        }
    }

    pub fn with_read_counter(mut self, reads: Arc<AtomicUsize>) -> Self {
        self.reads = reads;
        self
    }

    /// Fail every read once `offset` bytes were served.
    pub fn failing_at(mut self, offset: u64) -> Self {
        self.fail_at = Some(offset);
        self
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ByteStream for MemoryStream {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let mut end = self.data.len();
        if let Some(at) = self.fail_at {
            if self.position >= at {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "connection reset by peer",
                ));
            }
            end = end.min(at as usize);
        }
        let start = (self.position as usize).min(end);
        let n = buf.len().min(end - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.position += n as u64;
        Ok(n)
    }

    fn len(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn can_seek(&self) -> bool {
        self.seekable
    }

    async fn seek(&mut self, pos: u64) -> io::Result<u64> {
        if !self.seekable {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "stream does not support seeking",
            ));
        }
        self.position = pos.min(self.data.len() as u64);
        Ok(self.position)
    }

    async fn close(&mut self) -> io::Result<Completion> {
        let completion = *self.closed.get_or_insert_with(|| {
            Completion::evaluate(self.position, Some(self.data.len() as u64), true, false)
        });
        Ok(completion)
    }
}
