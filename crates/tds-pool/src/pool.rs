//! The data source: connections, slots and command writing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, OnceCell};

use crate::command::{Command, CommandExecution};
use crate::config::PoolConfig;
use crate::connection::{TdsConnection, Transport};
use crate::error::PoolError;
use crate::factory::ConnectionFactory;
use crate::response::CommandContext;
use crate::slot::{OperationSlot, SlotState};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// A pool of connections handing out operation slots.
///
/// Connections are opened lazily: the first acquisition opens
/// `min_connections` of them, later acquisitions open more up to
/// `max_connections` when nothing suitable is free.
///
/// Cloning is cheap and every clone shares the same pool.
pub struct DataSource<F: ConnectionFactory> {
    inner: Arc<Inner<F>>,
}

struct Inner<F: ConnectionFactory> {
    factory: F,
    config: PoolConfig,
    init: OnceCell<()>,
    shared: Arc<Shared<F::Transport>>,
}

impl<F: ConnectionFactory> Clone for DataSource<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for DataSource<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSource")
            .field("id", &self.inner.shared.id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> DataSource<F> {
    /// Create a data source. No connection is opened until first use.
    pub fn new(factory: F, config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        let shared = Arc::new(Shared {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            max_connections: config.max_connections,
            max_pipeline_depth: config.max_pipeline_depth,
            state: Mutex::new(PoolState::default()),
            notify: Notify::new(),
        });
        Ok(Self {
            inner: Arc::new(Inner {
                factory,
                config,
                init: OnceCell::new(),
                shared,
            }),
        })
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Acquire a slot.
    ///
    /// With `exclusive` the slot owns a whole connection. Otherwise it shares
    /// a connection with other multiplexed slots, up to `max_pipeline_depth`
    /// of them. Waits at most `timeout`, or the configured
    /// `connection_timeout` when `None`.
    pub async fn get_slot(
        &self,
        exclusive: bool,
        timeout: Option<Duration>,
    ) -> Result<OperationSlot<F::Transport>, PoolError> {
        let timeout = timeout.unwrap_or(self.inner.config.connection_timeout);
        match tokio::time::timeout(timeout, self.acquire(exclusive)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(
                    pool_id = self.inner.shared.id,
                    exclusive,
                    "slot acquisition timed out"
                );
                Err(PoolError::AcquisitionTimeout(timeout))
            }
        }
    }

    /// Write a command through a slot.
    ///
    /// The execution state is created before the request is written. The
    /// returned context reads the response.
    pub async fn write_command<'a, C>(
        &self,
        slot: &'a mut OperationSlot<F::Transport>,
        command: &C,
    ) -> Result<CommandContext<'a, F::Transport>, PoolError>
    where
        C: Command + ?Sized,
    {
        if slot.pool_id() != self.inner.shared.id {
            return Err(PoolError::InvalidSlot(
                "slot was issued by another data source".into(),
            ));
        }

        let values = command.values();
        let status = values.flags.packet_status()?;
        let (packet_type, payload) = values.encode()?;
        let timeout = values.timeout.unwrap_or(self.inner.config.command_timeout);

        slot.begin()?;
        let execution = command.begin_execution(&values);
        match slot.connection.send(packet_type, status, &payload).await {
            Ok(turn) => Ok(CommandContext::new(slot, execution, turn, timeout)),
            Err(e) => {
                slot.state = SlotState::Faulted;
                Err(e)
            }
        }
    }

    /// Run a command on a multiplexed slot and read its whole response.
    pub async fn execute<C>(&self, command: &C) -> Result<CommandExecution, PoolError>
    where
        C: Command + ?Sized,
    {
        let mut slot = self.get_slot(false, None).await?;
        let context = self.write_command(&mut slot, command).await?;
        context.response().await?.drain().await
    }

    /// Snapshot of the pool's connections.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.shared.state.lock();
        let mut status = PoolStatus {
            idle: 0,
            exclusive: 0,
            shared: 0,
            total: 0,
            max: self.inner.config.max_connections,
        };
        for entry in &state.entries {
            status.total += 1;
            match entry.usage {
                Usage::Idle => status.idle += 1,
                Usage::Exclusive => status.exclusive += 1,
                Usage::Shared(_) => status.shared += 1,
            }
        }
        status
    }

    /// Close the pool.
    ///
    /// Idle connections are dropped at once, busy ones when their last slot
    /// is released. Later acquisitions fail with [`PoolError::PoolClosed`].
    pub fn close(&self) {
        let idle: Vec<_> = {
            let mut state = self.inner.shared.state.lock();
            state.closed = true;
            let (idle, busy) = std::mem::take(&mut state.entries)
                .into_iter()
                .partition(|entry| entry.usage == Usage::Idle);
            state.entries = busy;
            idle
        };
        tracing::info!(
            pool_id = self.inner.shared.id,
            closed_connections = idle.len(),
            "connection pool closed"
        );
        drop(idle);
        self.inner.shared.notify.notify_waiters();
    }

    /// Check if the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.shared.state.lock().closed
    }

    async fn acquire(&self, exclusive: bool) -> Result<OperationSlot<F::Transport>, PoolError> {
        self.initialize().await?;

        let shared = &self.inner.shared;
        let usage = if exclusive {
            Usage::Exclusive
        } else {
            Usage::Shared(1)
        };
        loop {
            // Registered before the state is inspected so a release in
            // between is not missed.
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match shared.claim(exclusive)? {
                Claim::Ready(connection) => {
                    return Ok(OperationSlot::new(connection, Arc::clone(shared), exclusive));
                }
                Claim::Create(reservation) => {
                    let connection = self.open(reservation, usage).await?;
                    return Ok(OperationSlot::new(connection, Arc::clone(shared), exclusive));
                }
                Claim::Wait => notified.await,
            }
        }
    }

    /// Open the minimum number of connections once.
    async fn initialize(&self) -> Result<(), PoolError> {
        if self.inner.init.initialized() {
            return Ok(());
        }
        self.inner
            .init
            .get_or_try_init(|| async {
                let min = self.inner.config.min_connections;
                while let Some(reservation) = self.inner.shared.reserve(min)? {
                    self.open(reservation, Usage::Idle).await?;
                }
                tracing::debug!(
                    pool_id = self.inner.shared.id,
                    min_connections = min,
                    "pool initialized"
                );
                Ok::<(), PoolError>(())
            })
            .await
            .map(|_| ())
    }

    async fn open(
        &self,
        reservation: Reservation<F::Transport>,
        usage: Usage,
    ) -> Result<Arc<TdsConnection<F::Transport>>, PoolError> {
        let transport = self.inner.factory.connect().await.map_err(|e| {
            tracing::warn!(
                pool_id = self.inner.shared.id,
                error = %e,
                "failed to open connection"
            );
            PoolError::ConnectionCreation(e)
        })?;
        let connection = Arc::new(TdsConnection::new(
            reservation.connection_id,
            transport,
            &self.inner.config,
        )?);
        reservation.register(Arc::clone(&connection), usage)?;
        Ok(connection)
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Connections without a slot.
    pub idle: u32,
    /// Connections held by an exclusive slot.
    pub exclusive: u32,
    /// Connections carrying multiplexed slots.
    pub shared: u32,
    /// Total number of connections.
    pub total: u32,
    /// Maximum allowed connections.
    pub max: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Usage {
    Idle,
    Exclusive,
    /// Multiplexed slots currently issued.
    Shared(u32),
}

struct Entry<T: Transport> {
    connection: Arc<TdsConnection<T>>,
    usage: Usage,
}

struct PoolState<T: Transport> {
    entries: Vec<Entry<T>>,
    /// Connections being opened.
    creating: u32,
    next_connection_id: u64,
    closed: bool,
}

impl<T: Transport> Default for PoolState<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            creating: 0,
            next_connection_id: 1,
            closed: false,
        }
    }
}

/// Pool state shared with the slots it issued.
pub(crate) struct Shared<T: Transport> {
    pub(crate) id: u64,
    max_connections: u32,
    max_pipeline_depth: u32,
    state: Mutex<PoolState<T>>,
    notify: Notify,
}

enum Claim<T: Transport> {
    Ready(Arc<TdsConnection<T>>),
    Create(Reservation<T>),
    Wait,
}

impl<T: Transport> Shared<T> {
    fn claim(self: &Arc<Self>, exclusive: bool) -> Result<Claim<T>, PoolError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PoolError::PoolClosed);
        }
        self.evict_idle_broken(&mut state);

        if !exclusive {
            let depth = self.max_pipeline_depth;
            let least_loaded = state
                .entries
                .iter_mut()
                .filter(|entry| !entry.connection.is_broken())
                .filter_map(|entry| {
                    let Usage::Shared(n) = entry.usage else {
                        return None;
                    };
                    (n < depth).then_some((n, entry))
                })
                .min_by_key(|(n, _)| *n);
            if let Some((n, entry)) = least_loaded {
                entry.usage = Usage::Shared(n + 1);
                return Ok(Claim::Ready(Arc::clone(&entry.connection)));
            }
        }

        if let Some(entry) = state.entries.iter_mut().find(|entry| entry.usage == Usage::Idle) {
            entry.usage = if exclusive {
                Usage::Exclusive
            } else {
                Usage::Shared(1)
            };
            return Ok(Claim::Ready(Arc::clone(&entry.connection)));
        }

        Ok(match self.reserve_locked(&mut state, self.max_connections) {
            Some(reservation) => Claim::Create(reservation),
            None => Claim::Wait,
        })
    }

    /// Reserve a connection to open while the pool is below `limit`.
    fn reserve(self: &Arc<Self>, limit: u32) -> Result<Option<Reservation<T>>, PoolError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PoolError::PoolClosed);
        }
        Ok(self.reserve_locked(&mut state, limit))
    }

    fn reserve_locked(self: &Arc<Self>, state: &mut PoolState<T>, limit: u32) -> Option<Reservation<T>> {
        let count = u32::try_from(state.entries.len()).unwrap_or(u32::MAX);
        if count.saturating_add(state.creating) >= limit {
            return None;
        }
        state.creating += 1;
        let connection_id = state.next_connection_id;
        state.next_connection_id += 1;
        Some(Reservation {
            pool: Arc::clone(self),
            connection_id,
            registered: false,
        })
    }

    fn evict_idle_broken(&self, state: &mut PoolState<T>) {
        state.entries.retain(|entry| {
            let evict = entry.usage == Usage::Idle && entry.connection.is_broken();
            if evict {
                tracing::warn!(
                    pool_id = self.id,
                    connection_id = entry.connection.id(),
                    "evicting broken connection"
                );
            }
            !evict
        });
    }

    /// Return one slot's share of a connection.
    pub(crate) fn release(&self, connection_id: u64) {
        let evicted = {
            let mut state = self.state.lock();
            let closed = state.closed;
            let Some(index) = state
                .entries
                .iter()
                .position(|entry| entry.connection.id() == connection_id)
            else {
                return;
            };
            let entry = &mut state.entries[index];
            entry.usage = match entry.usage {
                Usage::Shared(n) if n > 1 => Usage::Shared(n - 1),
                _ => Usage::Idle,
            };
            let evict =
                entry.usage == Usage::Idle && (closed || entry.connection.is_broken());
            evict.then(|| state.entries.swap_remove(index))
        };

        if let Some(entry) = evicted {
            if entry.connection.is_broken() {
                tracing::warn!(
                    pool_id = self.id,
                    connection_id,
                    "evicting broken connection"
                );
            } else {
                tracing::debug!(pool_id = self.id, connection_id, "closing connection");
            }
        }
        self.notify.notify_waiters();
    }
}

/// A connection counted against the pool limit while it is being opened.
struct Reservation<T: Transport> {
    pool: Arc<Shared<T>>,
    connection_id: u64,
    registered: bool,
}

impl<T: Transport> Reservation<T> {
    fn register(mut self, connection: Arc<TdsConnection<T>>, usage: Usage) -> Result<(), PoolError> {
        self.registered = true;
        let mut state = self.pool.state.lock();
        state.creating = state.creating.saturating_sub(1);
        if state.closed {
            return Err(PoolError::PoolClosed);
        }
        state.entries.push(Entry { connection, usage });
        Ok(())
    }
}

impl<T: Transport> Drop for Reservation<T> {
    fn drop(&mut self) {
        if !self.registered {
            let mut state = self.pool.state.lock();
            state.creating = state.creating.saturating_sub(1);
        }
        self.pool.notify.notify_waiters();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tds_testing::{MockResponse, MockTdsServer};
    use tokio::io::DuplexStream;

    struct Mock(MockTdsServer);

    #[async_trait::async_trait]
    impl ConnectionFactory for Mock {
        type Transport = DuplexStream;

        async fn connect(&self) -> std::io::Result<DuplexStream> {
            Ok(self.0.connect())
        }
    }

    fn data_source(config: PoolConfig) -> DataSource<Mock> {
        let server = MockTdsServer::builder()
            .with_default_response(MockResponse::affected(1))
            .build();
        DataSource::new(Mock(server), config).unwrap()
    }

    #[test]
    fn test_new_validates_config() {
        let server = MockTdsServer::builder().build();
        let err = tokio_test::assert_err!(DataSource::new(
            Mock(server),
            PoolConfig::new().max_connections(0)
        ));
        assert!(matches!(err, PoolError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_lazy_initialization() {
        let pool = data_source(PoolConfig::new().min_connections(2).max_connections(4));
        assert_eq!(pool.status().total, 0);

        let slot = pool.get_slot(true, None).await.unwrap();
        let status = pool.status();
        assert_eq!(status.total, 2);
        assert_eq!(status.exclusive, 1);
        assert_eq!(status.idle, 1);
        assert_eq!(status.max, 4);

        drop(slot);
        assert_eq!(pool.status().idle, 2);
    }

    #[tokio::test]
    async fn test_multiplexed_slots_share_connection() {
        let pool = data_source(PoolConfig::new().min_connections(1).max_pipeline_depth(3));

        let a = pool.get_slot(false, None).await.unwrap();
        let b = pool.get_slot(false, None).await.unwrap();
        let c = pool.get_slot(false, None).await.unwrap();
        assert_eq!(a.connection().id(), b.connection().id());
        assert_eq!(b.connection().id(), c.connection().id());
        assert_eq!(pool.status().shared, 1);

        // Depth reached: the next slot goes to a new connection.
        let d = pool.get_slot(false, None).await.unwrap();
        assert_ne!(d.connection().id(), a.connection().id());
        assert_eq!(pool.status().total, 2);
    }

    #[tokio::test]
    async fn test_exclusive_waits_then_times_out() {
        let pool = data_source(PoolConfig::new().min_connections(0).max_connections(1));

        let held = pool.get_slot(true, None).await.unwrap();
        assert!(held.is_exclusive());
        let err = pool
            .get_slot(true, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::AcquisitionTimeout(_)));

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get_slot(true, Some(Duration::from_secs(5))).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        let slot = waiter.await.unwrap().unwrap();
        assert_eq!(slot.state(), SlotState::Pending);
    }

    #[tokio::test]
    async fn test_close_rejects_acquisition() {
        let pool = data_source(PoolConfig::default());
        let slot = pool.get_slot(false, None).await.unwrap();

        pool.close();
        assert!(pool.is_closed());
        assert!(matches!(
            pool.get_slot(false, None).await,
            Err(PoolError::PoolClosed)
        ));
        assert_eq!(pool.status().total, 1);

        drop(slot);
        assert_eq!(pool.status().total, 0);
    }

    #[tokio::test]
    async fn test_slot_from_other_pool_is_rejected() {
        let first = data_source(PoolConfig::default());
        let second = data_source(PoolConfig::default());

        let mut slot = first.get_slot(false, None).await.unwrap();
        let err = second.write_command(&mut slot, "SELECT 1").await.unwrap_err();
        assert!(matches!(err, PoolError::InvalidSlot(_)));
        assert_eq!(slot.state(), SlotState::Pending);
    }

    #[tokio::test]
    async fn test_failed_connect_releases_reservation() {
        struct Refuse;

        #[async_trait::async_trait]
        impl ConnectionFactory for Refuse {
            type Transport = DuplexStream;

            async fn connect(&self) -> std::io::Result<DuplexStream> {
                Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "refused",
                ))
            }
        }

        let pool = DataSource::new(Refuse, PoolConfig::new().min_connections(0).max_connections(1))
            .unwrap();
        for _ in 0..3 {
            assert!(matches!(
                pool.get_slot(true, None).await,
                Err(PoolError::ConnectionCreation(_))
            ));
        }
        assert_eq!(pool.status().total, 0);
    }
}
