//! Operation slots.

use std::sync::Arc;

use crate::connection::{TdsConnection, Transport};
use crate::error::PoolError;
use crate::pool::Shared;

/// Progress of the command written through a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// No command written yet.
    Pending,
    /// A command was written and its response is not fully read.
    Active,
    /// The response was read to its final DONE.
    Completed,
    /// Writing or reading failed; the connection is broken.
    Faulted,
}

/// Permission to run commands on one pooled connection.
///
/// An exclusive slot owns its connection until dropped and may run any number
/// of commands one after another. A multiplexed slot is one position in the
/// connection's request queue and runs exactly one command. Dropping the slot
/// returns its share of the connection to the pool.
pub struct OperationSlot<T: Transport> {
    pub(crate) connection: Arc<TdsConnection<T>>,
    pool: Arc<Shared<T>>,
    exclusive: bool,
    pub(crate) state: SlotState,
}

impl<T: Transport> OperationSlot<T> {
    pub(crate) fn new(connection: Arc<TdsConnection<T>>, pool: Arc<Shared<T>>, exclusive: bool) -> Self {
        tracing::debug!(
            pool_id = pool.id,
            connection_id = connection.id(),
            exclusive,
            "slot issued"
        );
        Self {
            connection,
            pool,
            exclusive,
            state: SlotState::Pending,
        }
    }

    /// Whether the slot owns its connection.
    #[must_use]
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SlotState {
        self.state
    }

    /// The connection behind the slot.
    #[must_use]
    pub fn connection(&self) -> &TdsConnection<T> {
        &self.connection
    }

    pub(crate) fn pool_id(&self) -> u64 {
        self.pool.id
    }

    /// Check that another command may be written and mark the slot active.
    pub(crate) fn begin(&mut self) -> Result<(), PoolError> {
        if self.state == SlotState::Faulted || self.connection.is_broken() {
            self.state = SlotState::Faulted;
            return Err(PoolError::ConnectionBroken);
        }
        match self.state {
            SlotState::Active => Err(PoolError::InvalidSlot(
                "the previous command's response has not been read".into(),
            )),
            SlotState::Completed if !self.exclusive => Err(PoolError::InvalidSlot(
                "a multiplexed slot runs a single command".into(),
            )),
            _ => {
                self.state = SlotState::Active;
                Ok(())
            }
        }
    }
}

impl<T: Transport> std::fmt::Debug for OperationSlot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationSlot")
            .field("pool_id", &self.pool.id)
            .field("connection", &self.connection)
            .field("exclusive", &self.exclusive)
            .field("state", &self.state)
            .finish()
    }
}

impl<T: Transport> Drop for OperationSlot<T> {
    fn drop(&mut self) {
        tracing::debug!(
            pool_id = self.pool.id,
            connection_id = self.connection.id(),
            state = ?self.state,
            "slot released"
        );
        self.pool.release(self.connection.id());
    }
}
