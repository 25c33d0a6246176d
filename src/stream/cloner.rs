use std::io::{self, SeekFrom};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::{BLOCK_SIZE, ByteStream, Completion, SeekableSink, cancelled_error};

/// Mirrors every byte read from `inner` into `sink`.
///
/// The sink always holds a contiguous prefix of the inner stream. Backward
/// seeks are served from the sink; forward seeks first drain the skipped range
/// from the inner stream into the sink.
pub struct StreamCloner<I, S> {
    inner: I,
    sink: S,
    position: u64,
    mirrored: u64,
    inner_done: bool,
    cancel: CancellationToken,
    closed: Option<Completion>,
}

impl<I: ByteStream, S: SeekableSink> StreamCloner<I, S> {
    pub fn new(inner: I, sink: S, cancel: CancellationToken) -> Self {
        Self {
            inner,
            sink,
            position: 0,
            mirrored: 0,
            inner_done: false,
            cancel,
            closed: None,
        }
    }

    /// Bytes persisted to the sink so far.
    pub fn mirrored(&self) -> u64 {
        self.mirrored
    }

    pub fn into_parts(self) -> (I, S) {
        (self.inner, self.sink)
    }

    async fn read_inner(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = tokio::select! {
            _ = self.cancel.cancelled() => return Err(cancelled_error()),
            res = self.inner.read(buf) => res?,
        };
        if n == 0 {
            self.inner_done = true;
            return Ok(0);
        }
        self.sink.seek(SeekFrom::Start(self.mirrored)).await?;
        self.sink.write_all(&buf[..n]).await?;
        self.mirrored += n as u64;
        Ok(n)
    }
}

#[async_trait]
impl<I: ByteStream, S: SeekableSink> ByteStream for StreamCloner<I, S> {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.cancel.is_cancelled() {
            return Err(cancelled_error());
        }

        if self.position < self.mirrored {
            let want = buf.len().min((self.mirrored - self.position) as usize);
            self.sink.seek(SeekFrom::Start(self.position)).await?;
            let n = self.sink.read(&mut buf[..want]).await?;
            self.position += n as u64;
            return Ok(n);
        }

        if self.inner_done {
            return Ok(0);
        }
        let n = self.read_inner(buf).await?;
        self.position += n as u64;
        Ok(n)
    }

    fn len(&self) -> Option<u64> {
        self.inner.len()
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn can_seek(&self) -> bool {
        true
    }

    async fn seek(&mut self, pos: u64) -> io::Result<u64> {
        if pos > self.mirrored {
            let mut scratch = vec![0u8; BLOCK_SIZE];
            while self.mirrored < pos && !self.inner_done {
                let want = scratch.len().min((pos - self.mirrored) as usize);
                self.read_inner(&mut scratch[..want]).await?;
            }
        }
        // Seeking past the end lands on the end.
        self.position = pos.min(self.mirrored);
        Ok(self.position)
    }

    async fn close(&mut self) -> io::Result<Completion> {
        if let Some(done) = self.closed {
            return Ok(done);
        }
        self.sink.flush().await?;
        self.inner.close().await?;

        let completion = Completion::evaluate(
            self.mirrored,
            self.inner.len(),
            self.inner_done,
            self.cancel.is_cancelled(),
        );
        self.closed = Some(completion);
        Ok(completion)
    }
}
