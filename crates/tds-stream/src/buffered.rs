//! Buffered byte source over an async reader.
//!
//! [`ByteSource`] is the pull interface every inbound layer is written
//! against: ask for at least `n` contiguous bytes, look at them, then commit
//! how many were consumed. [`BufferedReader`] implements it over any
//! [`AsyncRead`] with a fixed-capacity buffer and two cursors.

use std::future::Future;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::StreamError;
use crate::options::DEFAULT_READ_BUFFER_SIZE;

/// A source of contiguous, already-received bytes.
///
/// The window returned by [`buffer`](Self::buffer) always starts at the first
/// unconsumed byte. Its contents stay valid until the next call to
/// [`fill`](Self::fill) or [`advance`](Self::advance).
pub trait ByteSource: Send {
    /// Wait until at least `min` bytes are buffered.
    ///
    /// Fails with [`StreamError::EndOfStream`] if the underlying stream closes
    /// first, and with [`StreamError::InvalidArgument`] if `min` exceeds
    /// [`capacity`](Self::capacity).
    fn fill(&mut self, min: usize) -> impl Future<Output = Result<(), StreamError>> + Send;

    /// The buffered, unconsumed bytes.
    fn buffer(&self) -> &[u8];

    /// Mutable view of the buffered, unconsumed bytes.
    fn buffer_mut(&mut self) -> &mut [u8];

    /// Commit consumption of `n` bytes from the front of the window.
    fn advance(&mut self, n: usize) -> Result<(), StreamError>;

    /// Largest window this source can ever provide.
    fn capacity(&self) -> usize;

    /// Wait until at least `n` bytes are buffered and return the window.
    fn read_at_least(&mut self, n: usize) -> impl Future<Output = Result<&[u8], StreamError>> + Send {
        async move {
            self.fill(n).await?;
            Ok(self.buffer())
        }
    }
}

/// [`ByteSource`] over an [`AsyncRead`].
///
/// Unread bytes are only moved to the front of the buffer when a request
/// would otherwise not fit behind them, so steady read patterns copy nothing.
#[derive(Debug)]
pub struct BufferedReader<R> {
    inner: R,
    buf: Box<[u8]>,
    /// Start of unconsumed data.
    pos: usize,
    /// End of received data.
    filled: usize,
}

impl<R> BufferedReader<R> {
    /// Create a reader with the default 64 KiB capacity.
    pub fn new(inner: R) -> Self {
        Self::with_capacity(DEFAULT_READ_BUFFER_SIZE, inner)
    }

    /// Create a reader with a specific capacity.
    pub fn with_capacity(capacity: usize, inner: R) -> Self {
        Self {
            inner,
            buf: vec![0; capacity].into_boxed_slice(),
            pos: 0,
            filled: 0,
        }
    }

    /// Number of buffered, unconsumed bytes.
    #[must_use]
    pub fn available(&self) -> usize {
        self.filled - self.pos
    }

    /// Get a reference to the underlying reader.
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Get a mutable reference to the underlying reader.
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Consume the buffered reader, returning the underlying reader.
    ///
    /// Buffered but unconsumed bytes are lost.
    pub fn into_inner(self) -> R {
        self.inner
    }

    fn compact(&mut self) {
        self.buf.copy_within(self.pos..self.filled, 0);
        self.filled -= self.pos;
        self.pos = 0;
    }
}

impl<R> ByteSource for BufferedReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn fill(&mut self, min: usize) -> Result<(), StreamError> {
        if min > self.buf.len() {
            return Err(StreamError::InvalidArgument(format!(
                "requested {min} bytes from a buffer of {}",
                self.buf.len()
            )));
        }

        while self.available() < min {
            if self.pos + min > self.buf.len() {
                self.compact();
            }
            let n = self.inner.read(&mut self.buf[self.filled..]).await?;
            if n == 0 {
                return Err(StreamError::EndOfStream {
                    needed: min,
                    available: self.available(),
                });
            }
            self.filled += n;
        }
        Ok(())
    }

    fn buffer(&self) -> &[u8] {
        &self.buf[self.pos..self.filled]
    }

    fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.pos..self.filled]
    }

    fn advance(&mut self, n: usize) -> Result<(), StreamError> {
        if n > self.available() {
            return Err(StreamError::InvalidArgument(format!(
                "cannot advance {n} bytes, {} available",
                self.available()
            )));
        }
        self.pos += n;
        if self.pos == self.filled {
            self.pos = 0;
            self.filled = 0;
        }
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }
}
