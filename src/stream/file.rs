use std::io::{self, SeekFrom};
use std::path::Path;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::{ByteStream, Completion};

/// Seekable stream over a local file.
pub struct FileStream {
    file: File,
    len: u64,
    position: u64,
    closed: Option<Completion>,
}

impl FileStream {
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path).await?;
        let len = file.metadata().await?.len();
        Ok(Self::from_file(file, len))
    }

    pub fn from_file(file: File, len: u64) -> Self {
        Self {
            file,
            len,
            position: 0,
            closed: None,
        }
    }
}

#[async_trait]
impl ByteStream for FileStream {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.file.read(buf).await?;
        self.position += n as u64;
        Ok(n)
    }

    fn len(&self) -> Option<u64> {
        Some(self.len)
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn can_seek(&self) -> bool {
        true
    }

    async fn seek(&mut self, pos: u64) -> io::Result<u64> {
        self.position = self.file.seek(SeekFrom::Start(pos)).await?;
        Ok(self.position)
    }

    async fn close(&mut self) -> io::Result<Completion> {
        if let Some(done) = self.closed {
            return Ok(done);
        }
        let completion =
            Completion::evaluate(self.position, Some(self.len), self.position >= self.len, false);
        self.closed = Some(completion);
        Ok(completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_and_rewinds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let mut stream = FileStream::open(&path).await.unwrap();
        assert_eq!(stream.len(), Some(11));

        let mut buf = [0u8; 5];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 5);
        assert_eq!(&buf, b"hello");

        stream.seek(0).await.unwrap();
        let mut all = vec![0u8; 32];
        let n = crate::stream::read_full(&mut stream, &mut all).await.unwrap();
        assert_eq!(&all[..n], b"hello world");
        assert!(stream.close().await.unwrap().succeeded());
    }

    #[tokio::test]
    async fn closing_early_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        tokio::fs::write(&path, b"abcdef").await.unwrap();

        let mut stream = FileStream::open(&path).await.unwrap();
        let mut buf = [0u8; 2];
        stream.read(&mut buf).await.unwrap();
        let completion = stream.close().await.unwrap();
        assert!(!completion.succeeded());
        assert_eq!(completion.bytes(), 2);
    }
}
