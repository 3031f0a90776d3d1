//! TDS packet header definitions.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// TDS packet header size in bytes.
pub const PACKET_HEADER_SIZE: usize = 8;

/// Maximum TDS packet size (the header length field is a signed 16-bit value).
pub const MAX_PACKET_SIZE: usize = 32767;

/// Minimum packet size a client may negotiate.
pub const MIN_PACKET_SIZE: usize = 512;

/// Default TDS packet size.
pub const DEFAULT_PACKET_SIZE: usize = 4096;

/// How much the decoders trust the server.
///
/// `Strict` checks flag combinations and reserved bits that a well-behaved
/// server never sends. `Lenient` skips those checks and only rejects input
/// that makes further framing impossible.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Validation {
    /// Trust the server; only structural checks.
    #[default]
    Lenient,
    /// Reject unknown bits and invalid flag combinations.
    Strict,
}

impl Validation {
    /// Whether strict checks are enabled.
    #[must_use]
    pub const fn is_strict(self) -> bool {
        matches!(self, Self::Strict)
    }
}

/// TDS packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// SQL batch request.
    SqlBatch = 0x01,
    /// Pre-TDS7 login packet.
    PreTds7Login = 0x02,
    /// Remote procedure call.
    Rpc = 0x03,
    /// Tabular response.
    TabularResult = 0x04,
    /// Attention signal.
    Attention = 0x06,
    /// Bulk load data.
    BulkLoad = 0x07,
    /// Federated authentication token.
    FedAuthToken = 0x08,
    /// Transaction manager request.
    TransactionManager = 0x0E,
    /// TDS7+ login packet.
    Tds7Login = 0x10,
    /// SSPI authentication.
    Sspi = 0x11,
    /// Pre-login packet.
    PreLogin = 0x12,
}

impl PacketType {
    /// Create a packet type from a raw byte value.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x01 => Ok(Self::SqlBatch),
            0x02 => Ok(Self::PreTds7Login),
            0x03 => Ok(Self::Rpc),
            0x04 => Ok(Self::TabularResult),
            0x06 => Ok(Self::Attention),
            0x07 => Ok(Self::BulkLoad),
            0x08 => Ok(Self::FedAuthToken),
            0x0E => Ok(Self::TransactionManager),
            0x10 => Ok(Self::Tds7Login),
            0x11 => Ok(Self::Sspi),
            0x12 => Ok(Self::PreLogin),
            _ => Err(ProtocolError::InvalidPacketType(value)),
        }
    }
}

bitflags! {
    /// TDS packet status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PacketStatus: u8 {
        /// Normal packet, more packets to follow.
        const NORMAL = 0x00;
        /// End of message (last packet).
        const END_OF_MESSAGE = 0x01;
        /// Ignore this event (used for attention acknowledgment).
        const IGNORE_EVENT = 0x02;
        /// Reset connection before executing the request.
        const RESET_CONNECTION = 0x08;
        /// Reset connection but keep transaction state.
        const RESET_CONNECTION_KEEP_TRANSACTION = 0x10;
    }
}

impl PacketStatus {
    /// Flags that only belong on the first packet of a message.
    pub const RESET_FLAGS: Self =
        Self::RESET_CONNECTION.union(Self::RESET_CONNECTION_KEEP_TRANSACTION);

    /// Check the combination rules between flags.
    ///
    /// The two reset flags are mutually exclusive and ignore-event is only
    /// meaningful together with end-of-message.
    pub fn validate(self) -> Result<(), ProtocolError> {
        if self.contains(Self::RESET_FLAGS) {
            return Err(ProtocolError::InvalidPacketStatus(self.bits()));
        }
        if self.contains(Self::IGNORE_EVENT) && !self.contains(Self::END_OF_MESSAGE) {
            return Err(ProtocolError::InvalidPacketStatus(self.bits()));
        }
        Ok(())
    }
}

/// TDS packet header.
///
/// Every TDS packet begins with an 8-byte header that describes
/// the packet type, status, and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Type of packet.
    pub packet_type: PacketType,
    /// Status flags.
    pub status: PacketStatus,
    /// Total packet length including header.
    pub length: u16,
    /// Server process ID (SPID).
    pub spid: u16,
    /// Packet sequence number (wraps at 255).
    pub packet_id: u8,
    /// Window (unused, should be 0).
    pub window: u8,
}

impl PacketHeader {
    /// Create a new packet header.
    #[must_use]
    pub const fn new(packet_type: PacketType, status: PacketStatus, length: u16) -> Self {
        Self {
            packet_type,
            status,
            length,
            spid: 0,
            packet_id: 0,
            window: 0,
        }
    }

    /// Parse a header from the front of `src` without consuming anything.
    ///
    /// Returns `Ok(None)` when fewer than [`PACKET_HEADER_SIZE`] bytes are
    /// available. The length field is always checked because framing cannot
    /// continue without it; status rules are only checked under
    /// [`Validation::Strict`].
    pub fn try_parse(src: &[u8], validation: Validation) -> Result<Option<Self>, ProtocolError> {
        if src.len() < PACKET_HEADER_SIZE {
            return Ok(None);
        }
        let mut src = &src[..PACKET_HEADER_SIZE];

        let packet_type = PacketType::from_u8(src.get_u8())?;
        let status_byte = src.get_u8();
        let status = if validation.is_strict() {
            let status = PacketStatus::from_bits(status_byte)
                .ok_or(ProtocolError::InvalidPacketStatus(status_byte))?;
            status.validate()?;
            status
        } else {
            PacketStatus::from_bits_retain(status_byte)
        };
        let length = src.get_u16();
        let spid = src.get_u16();
        let packet_id = src.get_u8();
        let window = src.get_u8();

        if usize::from(length) < PACKET_HEADER_SIZE || usize::from(length) > MAX_PACKET_SIZE {
            return Err(ProtocolError::InvalidPacketLength {
                length,
                min: PACKET_HEADER_SIZE,
                max: MAX_PACKET_SIZE,
            });
        }

        Ok(Some(Self {
            packet_type,
            status,
            length,
            spid,
            packet_id,
            window,
        }))
    }

    /// Encode the packet header into exactly [`PACKET_HEADER_SIZE`] bytes.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.packet_type as u8);
        dst.put_u8(self.status.bits());
        dst.put_u16(self.length);
        dst.put_u16(self.spid);
        dst.put_u8(self.packet_id);
        dst.put_u8(self.window);
    }

    /// Encode the packet header to a new `Bytes` buffer.
    #[must_use]
    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Get the payload length (total length minus header).
    #[must_use]
    pub const fn payload_length(&self) -> usize {
        self.length.saturating_sub(PACKET_HEADER_SIZE as u16) as usize
    }

    /// Check if this is the last packet in a message.
    #[must_use]
    pub const fn is_end_of_message(&self) -> bool {
        self.status.contains(PacketStatus::END_OF_MESSAGE)
    }

    /// Set the packet ID (sequence number).
    #[must_use]
    pub const fn with_packet_id(mut self, id: u8) -> Self {
        self.packet_id = id;
        self
    }

    /// Set the SPID.
    #[must_use]
    pub const fn with_spid(mut self, spid: u16) -> Self {
        self.spid = spid;
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn any_packet_type() -> impl Strategy<Value = PacketType> {
        prop::sample::select(vec![
            PacketType::SqlBatch,
            PacketType::PreTds7Login,
            PacketType::Rpc,
            PacketType::TabularResult,
            PacketType::Attention,
            PacketType::BulkLoad,
            PacketType::FedAuthToken,
            PacketType::TransactionManager,
            PacketType::Tds7Login,
            PacketType::Sspi,
            PacketType::PreLogin,
        ])
    }

    fn any_valid_status() -> impl Strategy<Value = PacketStatus> {
        prop::sample::select(vec![
            PacketStatus::NORMAL,
            PacketStatus::END_OF_MESSAGE,
            PacketStatus::END_OF_MESSAGE | PacketStatus::IGNORE_EVENT,
            PacketStatus::RESET_CONNECTION,
            PacketStatus::RESET_CONNECTION_KEEP_TRANSACTION,
            PacketStatus::END_OF_MESSAGE | PacketStatus::RESET_CONNECTION,
            PacketStatus::END_OF_MESSAGE | PacketStatus::RESET_CONNECTION_KEEP_TRANSACTION,
        ])
    }

    proptest! {
        #[test]
        fn test_header_roundtrip_any(
            packet_type in any_packet_type(),
            status in any_valid_status(),
            length in (PACKET_HEADER_SIZE as u16)..=(MAX_PACKET_SIZE as u16),
            spid in any::<u16>(),
            packet_id in any::<u8>(),
            window in any::<u8>(),
        ) {
            let header = PacketHeader {
                packet_type,
                status,
                length,
                spid,
                packet_id,
                window,
            };
            let bytes = header.encode_to_bytes();
            prop_assert_eq!(bytes.len(), PACKET_HEADER_SIZE);
            prop_assert_eq!(PacketHeader::try_parse(&bytes, Validation::Strict).unwrap(), Some(header));
            prop_assert_eq!(PacketHeader::try_parse(&bytes, Validation::Lenient).unwrap(), Some(header));
            for cut in 0..PACKET_HEADER_SIZE {
                prop_assert_eq!(PacketHeader::try_parse(&bytes[..cut], Validation::Strict).unwrap(), None);
            }
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let header = PacketHeader {
            packet_type: PacketType::SqlBatch,
            status: PacketStatus::END_OF_MESSAGE,
            length: 100,
            spid: 54,
            packet_id: 1,
            window: 0,
        };

        let bytes = header.encode_to_bytes();
        assert_eq!(bytes.len(), PACKET_HEADER_SIZE);
        assert_eq!(&bytes[..], &[0x01, 0x01, 0x00, 0x64, 0x00, 0x36, 0x01, 0x00]);

        let decoded = PacketHeader::try_parse(&bytes, Validation::Strict).unwrap();
        assert_eq!(decoded, Some(header));
    }

    #[test]
    fn test_try_parse_needs_full_header() {
        let bytes = PacketHeader::new(PacketType::TabularResult, PacketStatus::NORMAL, 8)
            .encode_to_bytes();
        for len in 0..PACKET_HEADER_SIZE {
            assert_eq!(
                PacketHeader::try_parse(&bytes[..len], Validation::Strict).unwrap(),
                None
            );
        }
    }

    #[test]
    fn test_try_parse_rejects_short_length() {
        let bytes = [0x04, 0x01, 0x00, 0x07, 0x00, 0x00, 0x01, 0x00];
        assert!(matches!(
            PacketHeader::try_parse(&bytes, Validation::Lenient),
            Err(ProtocolError::InvalidPacketLength { length: 7, .. })
        ));
    }

    #[test]
    fn test_try_parse_rejects_oversized_length() {
        let bytes = [0x04, 0x01, 0x80, 0x00, 0x00, 0x00, 0x01, 0x00];
        assert!(PacketHeader::try_parse(&bytes, Validation::Lenient).is_err());
    }

    #[test]
    fn test_strict_status_rules() {
        // Both reset flags.
        let both_resets = [0x01, 0x19, 0x00, 0x08, 0x00, 0x00, 0x01, 0x00];
        assert_eq!(
            PacketHeader::try_parse(&both_resets, Validation::Strict),
            Err(ProtocolError::InvalidPacketStatus(0x19))
        );
        assert!(PacketHeader::try_parse(&both_resets, Validation::Lenient).is_ok());

        // Ignore-event without end-of-message.
        let ignore = [0x01, 0x02, 0x00, 0x08, 0x00, 0x00, 0x01, 0x00];
        assert!(PacketHeader::try_parse(&ignore, Validation::Strict).is_err());

        // Unknown status bit.
        let unknown = [0x04, 0x41, 0x00, 0x08, 0x00, 0x00, 0x01, 0x00];
        assert!(PacketHeader::try_parse(&unknown, Validation::Strict).is_err());
        let lenient = PacketHeader::try_parse(&unknown, Validation::Lenient)
            .unwrap()
            .unwrap();
        assert!(lenient.is_end_of_message());
    }

    #[test]
    fn test_payload_length() {
        let header = PacketHeader::new(PacketType::SqlBatch, PacketStatus::END_OF_MESSAGE, 100);
        assert_eq!(header.payload_length(), 92);
    }

    #[test]
    fn test_packet_type_from_u8() {
        assert_eq!(PacketType::from_u8(0x01).unwrap(), PacketType::SqlBatch);
        assert_eq!(PacketType::from_u8(0x12).unwrap(), PacketType::PreLogin);
        assert!(PacketType::from_u8(0xFF).is_err());
    }
}
