//! Protocol-level error types.

use thiserror::Error;

use crate::packet::PacketType;
use crate::types::LengthKind;

/// Errors raised while interpreting TDS bytes.
///
/// Running out of input is not an error; decoders report it through
/// [`Progress::NeedMoreData`](crate::Progress::NeedMoreData).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// Unknown packet type byte.
    #[error("invalid packet type: 0x{0:02X}")]
    InvalidPacketType(u8),

    /// A known packet type that is not valid in this direction.
    #[error("unexpected packet type: {0:?}")]
    UnexpectedPacketType(PacketType),

    /// Unknown or contradictory packet status flags.
    #[error("invalid packet status: 0x{0:02X}")]
    InvalidPacketStatus(u8),

    /// Packet length outside of the legal range.
    #[error("invalid packet length {length}: must be between {min} and {max}")]
    InvalidPacketLength {
        /// Length found in the header.
        length: u16,
        /// Smallest legal length (the header itself).
        min: usize,
        /// Largest legal length.
        max: usize,
    },

    /// Unknown token type tag in the response stream.
    #[error("invalid token type: 0x{0:02X}")]
    InvalidTokenType(u8),

    /// DONE status carries bits this implementation does not know.
    #[error("invalid DONE status: 0x{0:04X}")]
    InvalidDoneStatus(u16),

    /// A token body is inconsistent with its own length or layout.
    #[error("malformed {token} token: {reason}")]
    MalformedToken {
        /// Token name.
        token: &'static str,
        /// What was wrong.
        reason: String,
    },

    /// Invalid UTF-16 text.
    #[error("string encoding error: {0}")]
    StringEncoding(String),

    /// A value does not fit the field that carries it.
    #[error("value too large for {field}: {len}")]
    ValueTooLarge {
        /// Field being encoded.
        field: &'static str,
        /// Offending length.
        len: usize,
    },

    /// Data type code that is unknown or not handled.
    #[error("unsupported data type: 0x{0:02X}")]
    UnsupportedType(u8),

    /// Length encoding that is not handled for the requested operation.
    #[error("unsupported length kind: {0:?}")]
    UnsupportedLengthKind(LengthKind),
}

impl ProtocolError {
    /// Whether the byte stream can no longer be trusted after this error.
    ///
    /// Unsupported types and length kinds are capability gaps scoped to a
    /// single column or value; everything else means the framing is lost and
    /// the connection has to be torn down.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::UnsupportedType(_) | Self::UnsupportedLengthKind(_) | Self::ValueTooLarge { .. }
        )
    }

    pub(crate) fn malformed(token: &'static str, reason: impl Into<String>) -> Self {
        Self::MalformedToken {
            token,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ProtocolError::InvalidTokenType(0x42).is_fatal());
        assert!(ProtocolError::InvalidPacketStatus(0x03).is_fatal());
        assert!(!ProtocolError::UnsupportedType(0x23).is_fatal());
        assert!(!ProtocolError::UnsupportedLengthKind(LengthKind::VariableInt).is_fatal());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            ProtocolError::InvalidTokenType(0x42).to_string(),
            "invalid token type: 0x42"
        );
        assert_eq!(
            ProtocolError::malformed("ENVCHANGE", "trailing bytes").to_string(),
            "malformed ENVCHANGE token: trailing bytes"
        );
    }
}
