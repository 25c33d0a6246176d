use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::{ByteStream, Completion, cancelled_error};

/// Callbacks fired by [`StreamWatcher`]. All default to no-ops.
pub trait StreamObserver: Send + Sync {
    fn on_seek(&self, _position: u64) {}

    /// `position` is the absolute position after the read.
    fn on_read(&self, _position: u64, _data: &[u8], _count: usize) {}

    fn before_close(&self) {}

    fn after_close(&self, _completion: &Completion) {}
}

/// Pass-through decorator reporting stream activity to an observer.
///
/// Reads race the cancellation token. The completion receiver returned by
/// [`StreamWatcher::new`] resolves exactly once: on close, or with a failure
/// if the watcher is dropped unclosed.
pub struct StreamWatcher<I> {
    inner: I,
    observer: Arc<dyn StreamObserver>,
    cancel: CancellationToken,
    done_tx: Option<oneshot::Sender<Completion>>,
    closed: Option<Completion>,
}

impl<I: ByteStream> StreamWatcher<I> {
    pub fn new(
        inner: I,
        observer: Arc<dyn StreamObserver>,
        cancel: CancellationToken,
    ) -> (Self, oneshot::Receiver<Completion>) {
        let (done_tx, done_rx) = oneshot::channel();
        let watcher = Self {
            inner,
            observer,
            cancel,
            done_tx: Some(done_tx),
            closed: None,
        };
        (watcher, done_rx)
    }

    /// A watcher for callers that read the outcome from `close` and need no
    /// completion signal.
    pub fn unsignalled(
        inner: I,
        observer: Arc<dyn StreamObserver>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner,
            observer,
            cancel,
            done_tx: None,
            closed: None,
        }
    }

    pub fn get_ref(&self) -> &I {
        &self.inner
    }

    fn signal(&mut self, completion: Completion) {
        if let Some(tx) = self.done_tx.take() {
            let _ = tx.send(completion);
        }
    }

    fn failure(&self) -> Completion {
        Completion::Failed {
            bytes: self.inner.position(),
            expected: self.inner.len(),
            cancelled: self.cancel.is_cancelled(),
        }
    }
}

#[async_trait]
impl<I: ByteStream> ByteStream for StreamWatcher<I> {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(cancelled_error()),
            res = self.inner.read(buf) => res?,
        };
        self.observer.on_read(self.inner.position(), &buf[..n], n);
        Ok(n)
    }

    fn len(&self) -> Option<u64> {
        self.inner.len()
    }

    fn position(&self) -> u64 {
        self.inner.position()
    }

    fn can_seek(&self) -> bool {
        self.inner.can_seek()
    }

    async fn seek(&mut self, pos: u64) -> io::Result<u64> {
        let landed = self.inner.seek(pos).await?;
        self.observer.on_seek(landed);
        Ok(landed)
    }

    async fn close(&mut self) -> io::Result<Completion> {
        if let Some(done) = self.closed {
            return Ok(done);
        }
        self.observer.before_close();

        let completion = match self.inner.close().await {
            Ok(c) if self.cancel.is_cancelled() => Completion::Failed {
                bytes: c.bytes(),
                expected: self.inner.len(),
                cancelled: true,
            },
            Ok(c) => c,
            Err(e) => {
                let failed = self.failure();
                self.signal(failed);
                self.observer.after_close(&failed);
                return Err(e);
            }
        };

        self.closed = Some(completion);
        self.signal(completion);
        self.observer.after_close(&completion);
        Ok(completion)
    }
}

impl<I> Drop for StreamWatcher<I> {
    fn drop(&mut self) {
        if let Some(tx) = self.done_tx.take() {
            let _ = tx.send(Completion::Failed {
                bytes: 0,
                expected: None,
                cancelled: self.cancel.is_cancelled(),
            });
        }
    }
}
