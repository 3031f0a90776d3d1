//! Pool configuration.

use std::time::Duration;

use tds_stream::{ReaderOptions, WriterOptions};
use tds_wire::{DEFAULT_PACKET_SIZE, Validation};

use crate::error::PoolError;

/// Configuration for a [`DataSource`](crate::DataSource).
///
/// This struct is marked `#[non_exhaustive]` to allow adding new fields
/// in future minor versions without breaking changes. Use the builder
/// pattern methods or [`Default::default()`] to construct instances.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Connections opened when the pool is first used.
    pub min_connections: u32,

    /// Maximum number of connections allowed.
    pub max_connections: u32,

    /// Time to wait for a slot when the caller passes no deadline.
    pub connection_timeout: Duration,

    /// Time to wait for the first response token of a command that sets no
    /// timeout of its own, counted from the command's turn to read.
    pub command_timeout: Duration,

    /// Multiplexed commands in flight on one connection.
    pub max_pipeline_depth: u32,

    /// Initial packet size of new connections.
    pub packet_size: usize,

    /// Read buffer capacity of each connection.
    pub read_buffer_size: usize,

    /// How strictly inbound packets and tokens are checked.
    pub validation: Validation,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            connection_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(30),
            max_pipeline_depth: 16,
            packet_size: DEFAULT_PACKET_SIZE,
            read_buffer_size: tds_stream::DEFAULT_READ_BUFFER_SIZE,
            validation: Validation::Lenient,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the minimum number of connections.
    #[must_use]
    pub fn min_connections(mut self, count: u32) -> Self {
        self.min_connections = count;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.max_connections = count;
        self
    }

    /// Set the slot acquisition timeout.
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the default command timeout.
    #[must_use]
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the multiplexing depth per connection.
    #[must_use]
    pub fn max_pipeline_depth(mut self, depth: u32) -> Self {
        self.max_pipeline_depth = depth;
        self
    }

    /// Set the initial packet size.
    #[must_use]
    pub fn packet_size(mut self, size: usize) -> Self {
        self.packet_size = size;
        self
    }

    /// Set the read buffer capacity.
    #[must_use]
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Set the validation mode.
    #[must_use]
    pub fn validation(mut self, validation: Validation) -> Self {
        self.validation = validation;
        self
    }

    pub(crate) fn reader_options(&self) -> ReaderOptions {
        ReaderOptions::new()
            .buffer_size(self.read_buffer_size)
            .validation(self.validation)
    }

    pub(crate) fn writer_options(&self) -> WriterOptions {
        WriterOptions::new().packet_size(self.packet_size)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_connections == 0 {
            return Err(PoolError::Configuration(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(PoolError::Configuration(
                "min_connections cannot be greater than max_connections".into(),
            ));
        }
        if self.max_pipeline_depth == 0 {
            return Err(PoolError::Configuration(
                "max_pipeline_depth must be greater than 0".into(),
            ));
        }
        self.reader_options()
            .validate()
            .and_then(|()| self.writer_options().validate())
            .map_err(|e| PoolError::Configuration(e.to_string()))
    }
}
