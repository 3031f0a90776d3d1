//! Byte sink over an async writer.

use std::future::Future;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::StreamError;

/// Destination for outbound bytes.
///
/// Writers ask for a region, fill part of it, then commit the filled prefix.
/// Committed bytes are sent on [`flush`](Self::flush).
pub trait ByteSink: Send {
    /// Get a writable region of at least `size_hint` bytes.
    ///
    /// The region starts at the first uncommitted byte. Bytes written but not
    /// committed are preserved across calls, so a caller may ask for the same
    /// region again and find its earlier writes in place.
    fn get_buffer(&mut self, size_hint: usize) -> &mut [u8];

    /// Commit the first `n` bytes of the current region.
    fn commit(&mut self, n: usize) -> Result<(), StreamError>;

    /// Write all committed bytes to the transport.
    fn flush(&mut self) -> impl Future<Output = Result<(), StreamError>> + Send;
}

/// [`ByteSink`] accumulating into a [`BytesMut`] in front of an [`AsyncWrite`].
#[derive(Debug)]
pub struct BufferSink<W> {
    inner: W,
    buf: BytesMut,
    committed: usize,
}

impl<W> BufferSink<W> {
    /// Create a sink in front of a writer.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: BytesMut::new(),
            committed: 0,
        }
    }

    /// Bytes committed but not yet flushed.
    #[must_use]
    pub fn committed(&self) -> &[u8] {
        &self.buf[..self.committed]
    }

    /// Get a reference to the underlying writer.
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Get a mutable reference to the underlying writer.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Consume the sink, returning the underlying writer.
    ///
    /// Unflushed bytes are lost.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W> ByteSink for BufferSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn get_buffer(&mut self, size_hint: usize) -> &mut [u8] {
        let needed = self.committed + size_hint;
        if self.buf.len() < needed {
            self.buf.resize(needed, 0);
        }
        &mut self.buf[self.committed..]
    }

    fn commit(&mut self, n: usize) -> Result<(), StreamError> {
        if self.committed + n > self.buf.len() {
            return Err(StreamError::InvalidArgument(format!(
                "cannot commit {n} bytes, {} requested",
                self.buf.len() - self.committed
            )));
        }
        self.committed += n;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), StreamError> {
        if self.committed > 0 {
            self.inner.write_all(&self.buf[..self.committed]).await?;
            self.buf.advance(self.committed);
            self.committed = 0;
        }
        self.inner.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commit_and_flush() {
        let mut sink = BufferSink::new(Vec::new());

        sink.get_buffer(4)[..3].copy_from_slice(b"abc");
        sink.commit(3).unwrap();
        sink.get_buffer(2)[..2].copy_from_slice(b"de");
        assert_eq!(sink.committed(), b"abc");

        sink.flush().await.unwrap();
        assert_eq!(sink.get_ref(), b"abc");
        assert!(sink.committed().is_empty());
    }

    #[tokio::test]
    async fn test_uncommitted_bytes_survive() {
        let mut sink = BufferSink::new(Vec::new());

        sink.get_buffer(4).copy_from_slice(b"wxyz");
        let region = sink.get_buffer(8);
        assert_eq!(&region[..4], b"wxyz");
        sink.commit(4).unwrap();

        sink.get_buffer(2)[..2].copy_from_slice(b"12");
        sink.flush().await.unwrap();
        assert_eq!(sink.get_ref(), b"wxyz");
        assert_eq!(&sink.get_buffer(2)[..2], b"12");
    }

    #[test]
    fn test_commit_beyond_region_fails() {
        let mut sink = BufferSink::new(Vec::new());
        sink.get_buffer(4);
        assert!(matches!(
            sink.commit(5),
            Err(StreamError::InvalidArgument(_))
        ));
    }
}
