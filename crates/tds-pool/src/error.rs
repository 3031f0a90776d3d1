//! Pool error types.

use std::time::Duration;

use tds_stream::StreamError;
use tds_wire::ServerMessage;
use thiserror::Error;

/// Errors that can occur during pool operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// Failed to acquire a slot within the timeout.
    #[error("slot acquisition timeout after {0:?}")]
    AcquisitionTimeout(Duration),

    /// Pool is closed.
    #[error("pool is closed")]
    PoolClosed,

    /// Connection creation failed.
    #[error("failed to create connection: {0}")]
    ConnectionCreation(#[source] std::io::Error),

    /// Pool configuration error.
    #[error("pool configuration error: {0}")]
    Configuration(String),

    /// The slot cannot be used for this operation.
    #[error("invalid slot: {0}")]
    InvalidSlot(String),

    /// The command could not be encoded.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// The connection failed earlier and can no longer be used.
    #[error("connection is broken")]
    ConnectionBroken,

    /// No response arrived within the command timeout.
    #[error("command timeout after {0:?}")]
    CommandTimeout(Duration),

    /// The server reported an error for the command.
    #[error("server error {}: {}", .0.number, .0.message)]
    Server(ServerMessage),

    /// Reading or writing the stream failed.
    #[error(transparent)]
    Stream(#[from] StreamError),
}

impl PoolError {
    /// Whether the connection that produced this error can no longer be used.
    #[must_use]
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            Self::ConnectionBroken | Self::CommandTimeout(_) => true,
            Self::Stream(e) => e.is_fatal(),
            _ => false,
        }
    }

    /// Whether retrying the operation on another slot may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::AcquisitionTimeout(_)
            | Self::ConnectionCreation(_)
            | Self::ConnectionBroken
            | Self::CommandTimeout(_) => true,
            Self::Stream(e) => e.is_fatal(),
            _ => false,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tds_wire::ProtocolError;

    #[test]
    fn test_error_classification() {
        assert!(PoolError::ConnectionBroken.is_connection_fatal());
        assert!(PoolError::CommandTimeout(Duration::from_secs(1)).is_connection_fatal());
        assert!(!PoolError::PoolClosed.is_connection_fatal());
        assert!(!PoolError::PoolClosed.is_transient());
        assert!(PoolError::AcquisitionTimeout(Duration::from_secs(1)).is_transient());

        let fatal = PoolError::from(StreamError::from(ProtocolError::InvalidTokenType(0x42)));
        assert!(fatal.is_connection_fatal());

        let misuse = PoolError::from(StreamError::InvalidOperation("no current row".into()));
        assert!(!misuse.is_connection_fatal());
    }

    #[test]
    fn test_server_error_display() {
        let err = PoolError::Server(ServerMessage {
            number: 208,
            state: 1,
            class: 16,
            message: "Invalid object name 'nope'.".into(),
            server: "mock".into(),
            procedure: String::new(),
            line: 1,
        });
        assert_eq!(err.to_string(), "server error 208: Invalid object name 'nope'.");
    }
}
