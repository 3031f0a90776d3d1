//! A physical connection and the ordering of its responses.
//!
//! Every request written to a connection takes a [`ReadTurn`]: a receiver for
//! the inbound token reader, and a sender to pass it on once this request's
//! response has been read to its final DONE. The receivers form a chain in
//! write order, so responses are consumed exactly in the order their requests
//! went out even when many tasks share the connection.
//!
//! A turn dropped without passing the reader on ends the chain. Every later
//! turn then fails with [`PoolError::ConnectionBroken`] and the connection is
//! marked broken.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use tds_stream::{TdsReader, TdsWriter};
use tds_wire::{PacketStatus, PacketType};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::oneshot;

use crate::config::PoolConfig;
use crate::error::PoolError;

/// Byte stream a pool can manage.
pub trait Transport: AsyncRead + AsyncWrite + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + 'static> Transport for T {}

/// Inbound side of a connection, handed from one response to the next.
pub(crate) type Inbound<T> = Box<TdsReader<ReadHalf<T>>>;

/// A logged-in connection managed by the pool.
pub struct TdsConnection<T: Transport> {
    id: u64,
    writer: tokio::sync::Mutex<TdsWriter<WriteHalf<T>>>,
    /// Receives the reader once every earlier response has been consumed.
    tail: parking_lot::Mutex<oneshot::Receiver<Inbound<T>>>,
    /// Packet size to apply before the next request.
    packet_size: AtomicUsize,
    broken: AtomicBool,
    requests: AtomicU64,
    created_at: Instant,
}

impl<T: Transport> TdsConnection<T> {
    pub(crate) fn new(id: u64, transport: T, config: &PoolConfig) -> Result<Self, PoolError> {
        let (reader, writer) =
            tds_stream::split(transport, config.reader_options(), config.writer_options())?;
        let (first, tail) = oneshot::channel();
        // The receiver is held below, so this cannot fail.
        let _ = first.send(Box::new(reader));

        tracing::debug!(connection_id = id, "connection created");

        Ok(Self {
            id,
            writer: tokio::sync::Mutex::new(writer),
            tail: parking_lot::Mutex::new(tail),
            packet_size: AtomicUsize::new(config.packet_size),
            broken: AtomicBool::new(false),
            requests: AtomicU64::new(0),
            created_at: Instant::now(),
        })
    }

    /// Connection identifier, unique within its pool.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the connection failed and must not be reused.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Packet size used for the next request.
    #[must_use]
    pub fn packet_size(&self) -> usize {
        self.packet_size.load(Ordering::Acquire)
    }

    /// Requests written so far.
    #[must_use]
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// When the connection was opened.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub(crate) fn mark_broken(&self) {
        if !self.broken.swap(true, Ordering::AcqRel) {
            tracing::warn!(connection_id = self.id, "connection marked broken");
        }
    }

    /// Record a packet size announced by the server.
    pub(crate) fn renegotiate_packet_size(&self, size: usize) {
        match tds_stream::options::validate_packet_size(size) {
            Ok(()) => {
                self.packet_size.store(size, Ordering::Release);
                tracing::debug!(
                    connection_id = self.id,
                    packet_size = size,
                    "packet size changed"
                );
            }
            Err(e) => {
                tracing::warn!(
                    connection_id = self.id,
                    error = %e,
                    "ignoring packet size change"
                );
            }
        }
    }

    /// Frame and flush one request, queueing its read turn behind every
    /// request written before it.
    pub(crate) async fn send(
        self: &Arc<Self>,
        packet_type: PacketType,
        status: PacketStatus,
        payload: &[u8],
    ) -> Result<ReadTurn<T>, PoolError> {
        if self.is_broken() {
            return Err(PoolError::ConnectionBroken);
        }
        let mut writer = self.writer.lock().await;
        if self.is_broken() {
            return Err(PoolError::ConnectionBroken);
        }

        let (handoff, next) = oneshot::channel();
        let wait = std::mem::replace(&mut *self.tail.lock(), next);
        let turn = ReadTurn {
            connection: Arc::clone(self),
            wait: Some(wait),
            handoff: Some(handoff),
        };

        // A partially written request leaves the stream unusable, including
        // when this future is dropped mid-flush.
        let mut guard = BreakOnDrop {
            connection: self,
            armed: true,
        };
        let size = self.packet_size();
        if size != writer.packet_size() {
            writer.set_packet_size(size)?;
        }
        writer.write_message(packet_type, status, payload)?;
        writer.flush().await?;
        guard.armed = false;

        let requests = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(
            connection_id = self.id,
            packet_type = ?packet_type,
            bytes = payload.len(),
            requests,
            "request written"
        );
        Ok(turn)
    }
}

impl<T: Transport> std::fmt::Debug for TdsConnection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TdsConnection")
            .field("id", &self.id)
            .field("broken", &self.is_broken())
            .field("packet_size", &self.packet_size())
            .field("requests", &self.requests())
            .finish_non_exhaustive()
    }
}

struct BreakOnDrop<'a, T: Transport> {
    connection: &'a TdsConnection<T>,
    armed: bool,
}

impl<T: Transport> Drop for BreakOnDrop<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.connection.mark_broken();
        }
    }
}

/// The right to read one response from a connection.
pub(crate) struct ReadTurn<T: Transport> {
    connection: Arc<TdsConnection<T>>,
    wait: Option<oneshot::Receiver<Inbound<T>>>,
    handoff: Option<oneshot::Sender<Inbound<T>>>,
}

impl<T: Transport> ReadTurn<T> {
    /// Wait until every earlier response has been consumed.
    ///
    /// Cancel safe: a reader that arrives after cancellation stays queued in
    /// the turn until it is dropped.
    pub(crate) async fn acquire(&mut self) -> Result<Inbound<T>, PoolError> {
        let wait = self
            .wait
            .as_mut()
            .ok_or_else(|| PoolError::InvalidSlot("read turn already taken".into()))?;
        let result = wait.await;
        self.wait = None;
        result.map_err(|_| {
            self.connection.mark_broken();
            PoolError::ConnectionBroken
        })
    }

    /// Pass the reader to the next request in line.
    pub(crate) fn release(mut self, reader: Inbound<T>) {
        if let Some(handoff) = self.handoff.take() {
            if handoff.send(reader).is_err() {
                // The next request gave up its turn.
                self.connection.mark_broken();
            }
        }
    }
}

impl<T: Transport> Drop for ReadTurn<T> {
    fn drop(&mut self) {
        if self.handoff.is_some() {
            self.connection.mark_broken();
        }
    }
}
