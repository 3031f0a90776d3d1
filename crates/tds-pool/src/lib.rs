//! # tds-pool
//!
//! Connection pooling and command multiplexing for TDS connections.
//!
//! A [`DataSource`] owns a set of logged-in connections opened through a
//! [`ConnectionFactory`] and hands out [`OperationSlot`]s:
//!
//! - an exclusive slot owns one connection until it is dropped;
//! - a multiplexed slot is one position in a connection's request queue.
//!
//! TDS responses carry no request id, so responses on a shared connection are
//! read strictly in the order the requests were written. Each response reader
//! passes the connection's inbound stream to the next one once it has read
//! its final DONE.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tds_pool::{CommandValues, DataSource, PoolConfig};
//! use tds_wire::RpcParam;
//!
//! let pool = DataSource::new(factory, PoolConfig::new().max_connections(4))?;
//!
//! let mut slot = pool.get_slot(false, None).await?;
//! let command = CommandValues::new("SELECT name FROM users WHERE id = @p1")
//!     .param(RpcParam::int("@p1", 42));
//! let mut response = pool.write_command(&mut slot, &command).await?.response().await?;
//! while let Some(mut rows) = response.next_result_set().await? {
//!     while rows.move_to_next_row().await? {
//!         let name: Option<String> = rows.get(None).await?;
//!     }
//! }
//! let execution = response.drain().await?;
//! ```
//!
//! ## Cancellation
//!
//! Dropping a response before its final DONE, or a command whose response
//! was never requested, leaves unread bytes on the connection. The
//! connection is then marked broken: commands queued behind it fail with
//! [`PoolError::ConnectionBroken`] and the pool evicts it once its last slot
//! is released. A response whose rows were read up to the final DONE is
//! complete and can be dropped without draining.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod factory;
pub mod pool;
pub mod response;
pub mod slot;

pub use command::{Command, CommandExecution, CommandValues, ExecutionFlags};
pub use config::PoolConfig;
pub use connection::{TdsConnection, Transport};
pub use error::PoolError;
pub use factory::ConnectionFactory;
pub use pool::{DataSource, PoolStatus};
pub use response::{CommandContext, ResponseReader, RowReader};
pub use slot::{OperationSlot, SlotState};
