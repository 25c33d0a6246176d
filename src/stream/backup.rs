use std::io::{self, SeekFrom};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ByteStream, Completion, SeekableSink, cancelled_error, read_full};

/// Size of each pull from the source into the backup sink.
pub const BLOCK_SIZE: usize = 64 * 1024;

struct BackupState<S> {
    source: Box<dyn ByteStream>,
    sink: S,
    /// Bytes persisted to the sink. Always a contiguous prefix of the source.
    buffered: u64,
    source_done: bool,
}

impl<S: SeekableSink> BackupState<S> {
    /// Pull the next block from the source and append it to the sink.
    async fn pull_block(&mut self) -> io::Result<Vec<u8>> {
        let mut block = vec![0u8; BLOCK_SIZE];
        let n = read_full(&mut self.source, &mut block).await?;
        block.truncate(n);

        if n < BLOCK_SIZE {
            self.source_done = true;
        }
        if n > 0 {
            self.sink.seek(SeekFrom::Start(self.buffered)).await?;
            self.sink.write_all(&block).await?;
            self.buffered += n as u64;
        }
        Ok(block)
    }
}

/// Tees a possibly forward-only source into a seekable backup sink.
///
/// Reads are served from the sink when the position is already buffered,
/// otherwise a block is pulled from the source and persisted first. The stream
/// can be rewound to the start, which lets a failed write be retried without
/// contacting the source again. `close` reports whether the sink holds the
/// whole source.
pub struct BackupStream<S> {
    state: Arc<Mutex<BackupState<S>>>,
    position: u64,
    source_len: Option<u64>,
    cancel: CancellationToken,
    prefetch_stop: CancellationToken,
    closed: Option<Completion>,
}

impl<S: SeekableSink + 'static> BackupStream<S> {
    pub fn new(source: Box<dyn ByteStream>, sink: S, cancel: CancellationToken) -> Self {
        let source_len = source.len();
        let prefetch_stop = cancel.child_token();
        Self {
            state: Arc::new(Mutex::new(BackupState {
                source,
                sink,
                buffered: 0,
                source_done: false,
            })),
            position: 0,
            source_len,
            cancel,
            prefetch_stop,
            closed: None,
        }
    }

    /// Bytes currently persisted in the backup sink.
    pub async fn buffered(&self) -> u64 {
        self.state.lock().await.buffered
    }

    /// Buffer the whole source in the background.
    ///
    /// The task takes the lock one block at a time, so readers interleave with
    /// it. It stops at end of source, on cancellation, or when the stream closes.
    pub fn spawn_prefetch(&self) -> JoinHandle<io::Result<u64>> {
        let state = Arc::clone(&self.state);
        let stop = self.prefetch_stop.clone();

        tokio::spawn(async move {
            loop {
                let mut guard = state.lock().await;
                if guard.source_done {
                    break;
                }
                tokio::select! {
                    _ = stop.cancelled() => break,
                    res = guard.pull_block() => { res?; }
                }
                drop(guard);
                tokio::task::yield_now().await;
            }
            let buffered = state.lock().await.buffered;
            debug!(buffered, "Backup prefetch finished");
            Ok::<u64, io::Error>(buffered)
        })
    }

    /// Take back the sink once the stream is closed and no prefetch task holds it.
    pub fn into_sink(self) -> Option<S> {
        self.prefetch_stop.cancel();
        Arc::try_unwrap(self.state)
            .ok()
            .map(|state| state.into_inner().sink)
    }
}

#[async_trait]
impl<S: SeekableSink + 'static> ByteStream for BackupStream<S> {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.cancel.is_cancelled() {
            return Err(cancelled_error());
        }

        let mut state = self.state.lock().await;

        if self.position < state.buffered {
            let available = (state.buffered - self.position) as usize;
            let want = buf.len().min(available);
            state.sink.seek(SeekFrom::Start(self.position)).await?;
            let n = state.sink.read(&mut buf[..want]).await?;
            self.position += n as u64;
            return Ok(n);
        }

        if state.source_done {
            return Ok(0);
        }

        let block = tokio::select! {
            _ = self.cancel.cancelled() => return Err(cancelled_error()),
            res = state.pull_block() => res?,
        };
        let n = buf.len().min(block.len());
        buf[..n].copy_from_slice(&block[..n]);
        self.position += n as u64;
        Ok(n)
    }

    fn len(&self) -> Option<u64> {
        self.source_len
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn can_seek(&self) -> bool {
        true
    }

    /// Only rewinding to the start is supported.
    async fn seek(&mut self, pos: u64) -> io::Result<u64> {
        if pos != 0 {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "backup stream can only seek to the beginning",
            ));
        }
        self.position = 0;
        Ok(0)
    }

    async fn close(&mut self) -> io::Result<Completion> {
        if let Some(done) = self.closed {
            return Ok(done);
        }
        self.prefetch_stop.cancel();

        let mut state = self.state.lock().await;
        state.sink.flush().await?;
        if let Err(e) = state.source.close().await {
            debug!(error = %e, "Closing backup source failed");
        }

        let completion = Completion::evaluate(
            state.buffered,
            self.source_len,
            state.source_done,
            self.cancel.is_cancelled(),
        );
        debug!(
            persisted = state.buffered,
            expected = ?self.source_len,
            full_backup = completion.succeeded(),
            "Backup stream closed"
        );
        self.closed = Some(completion);
        Ok(completion)
    }
}
