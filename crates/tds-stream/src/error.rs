//! Stream-level error types.

use tds_wire::{ProtocolError, TokenType, TypeId};
use thiserror::Error;

/// Errors raised while framing, reading tokens or reading rows.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StreamError {
    /// The byte stream violates the protocol.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The transport failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The transport closed before the requested bytes arrived.
    #[error("unexpected end of stream: needed {needed} bytes, {available} available")]
    EndOfStream {
        /// Bytes requested.
        needed: usize,
        /// Bytes buffered when the stream closed.
        available: usize,
    },

    /// A token that is not allowed at this point of the stream.
    #[error("unexpected {found:?} token, expected {expected}")]
    UnexpectedToken {
        /// What the reader was waiting for.
        expected: &'static str,
        /// What arrived.
        found: TokenType,
    },

    /// An argument is out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The object is not in a state that allows the call.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The call is not supported in the current position.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The column cannot be converted to the requested type.
    #[error("cannot convert {from:?} column to {to}")]
    UnsupportedConversion {
        /// Column type.
        from: TypeId,
        /// Requested Rust type.
        to: &'static str,
    },

    /// A NULL was read into a type that cannot represent it.
    #[error("unexpected NULL converting to {to}")]
    UnexpectedNull {
        /// Requested Rust type.
        to: &'static str,
    },

    /// A value does not fit into the read buffer.
    #[error("value of {len} bytes exceeds the read buffer capacity of {capacity}")]
    ValueTooLarge {
        /// Value length.
        len: usize,
        /// Largest value the buffer can hold.
        capacity: usize,
    },
}

impl StreamError {
    /// Whether the stream position can no longer be trusted.
    ///
    /// A fatal error leaves the connection desynchronized; it has to be closed.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Protocol(e) => e.is_fatal(),
            Self::Io(_) | Self::EndOfStream { .. } | Self::UnexpectedToken { .. } => true,
            Self::InvalidArgument(_)
            | Self::InvalidState(_)
            | Self::InvalidOperation(_)
            | Self::UnsupportedConversion { .. }
            | Self::UnexpectedNull { .. }
            | Self::ValueTooLarge { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tds_wire::LengthKind;

    #[test]
    fn test_fatal_classification() {
        assert!(StreamError::from(ProtocolError::InvalidTokenType(0x42)).is_fatal());
        assert!(!StreamError::from(ProtocolError::UnsupportedLengthKind(LengthKind::VariableInt)).is_fatal());
        assert!(StreamError::EndOfStream { needed: 8, available: 3 }.is_fatal());
        assert!(!StreamError::InvalidOperation("backward".into()).is_fatal());
        assert!(
            !StreamError::UnsupportedConversion {
                from: TypeId::Money,
                to: "i32"
            }
            .is_fatal()
        );
    }
}
