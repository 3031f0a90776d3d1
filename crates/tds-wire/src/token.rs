//! TDS token stream definitions.
//!
//! The server answers every request with a stream of tokens. Each token starts
//! with a one-byte tag ([`TokenType`]) followed by a body whose layout depends
//! on the tag. This module decodes bodies; reading the tag and retrying when a
//! body is incomplete is left to the caller, see [`Token::decode_body`].
//!
//! Row tokens are markers only: their payload is a sequence of column values
//! that can only be interpreted with the current [`ColMetaData`], so it is left
//! in the stream for a row reader to consume column by column.

use std::sync::Arc;

use bitflags::bitflags;
use bytes::{BufMut, Bytes};

use crate::codec::{
    Progress, read_b_varbyte, read_b_varchar, read_bytes, read_i32_le, read_u8, read_u16_le,
    read_u32_be, read_u32_le, read_u64_le, read_us_varchar,
};
use crate::error::ProtocolError;
use crate::packet::Validation;
use crate::types::{ColumnFlags, DataType};

/// Token type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TokenType {
    /// Stored procedure return status.
    ReturnStatus = 0x79,
    /// Column metadata for the following rows.
    ColMetaData = 0x81,
    /// ORDER BY column list.
    Order = 0xA9,
    /// Error message.
    Error = 0xAA,
    /// Informational message.
    Info = 0xAB,
    /// Login acknowledgement.
    LoginAck = 0xAD,
    /// Row of column values.
    Row = 0xD1,
    /// Environment change notification.
    EnvChange = 0xE3,
    /// Statement completion.
    Done = 0xFD,
    /// Stored procedure completion.
    DoneProc = 0xFE,
    /// Completion of a statement inside a stored procedure.
    DoneInProc = 0xFF,
}

impl TokenType {
    /// Create a token type from a raw tag byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x79 => Some(Self::ReturnStatus),
            0x81 => Some(Self::ColMetaData),
            0xA9 => Some(Self::Order),
            0xAA => Some(Self::Error),
            0xAB => Some(Self::Info),
            0xAD => Some(Self::LoginAck),
            0xD1 => Some(Self::Row),
            0xE3 => Some(Self::EnvChange),
            0xFD => Some(Self::Done),
            0xFE => Some(Self::DoneProc),
            0xFF => Some(Self::DoneInProc),
            _ => None,
        }
    }
}

/// A decoded token.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Login acknowledgement.
    LoginAck(LoginAck),
    /// Informational message.
    Info(ServerMessage),
    /// Error message.
    Error(ServerMessage),
    /// Environment change.
    EnvChange(EnvChange),
    /// Column metadata describing the rows that follow.
    ColMetaData(Arc<ColMetaData>),
    /// Start of a row; the column values are still in the stream.
    Row,
    /// Statement completion.
    Done(Done),
    /// Stored procedure completion.
    DoneProc(Done),
    /// Statement completion inside a stored procedure.
    DoneInProc(Done),
    /// Stored procedure return status.
    ReturnStatus(i32),
    /// Column ordinals of the ORDER BY clause.
    Order(Vec<u16>),
}

impl Token {
    /// Decode the body of a token whose tag has already been consumed.
    ///
    /// On success returns the token and the number of body bytes it occupied.
    /// `Progress::NeedMoreData` means `src` ends before the body does; the
    /// caller must retry with the same starting position and more bytes.
    pub fn decode_body(
        token_type: TokenType,
        src: &[u8],
        validation: Validation,
    ) -> Result<Progress<(Self, usize)>, ProtocolError> {
        let mut cursor = src;
        let token = match token_type {
            TokenType::LoginAck => Self::LoginAck(ready!(LoginAck::decode(&mut cursor)?)),
            TokenType::Info => Self::Info(ready!(ServerMessage::decode(&mut cursor, "INFO")?)),
            TokenType::Error => Self::Error(ready!(ServerMessage::decode(&mut cursor, "ERROR")?)),
            TokenType::EnvChange => Self::EnvChange(ready!(EnvChange::decode(&mut cursor)?)),
            TokenType::ColMetaData => Self::ColMetaData(Arc::new(ready!(ColMetaData::decode(
                &mut cursor,
                validation
            )?))),
            TokenType::Row => Self::Row,
            TokenType::Done => Self::Done(ready!(Done::decode(&mut cursor, validation)?)),
            TokenType::DoneProc => Self::DoneProc(ready!(Done::decode(&mut cursor, validation)?)),
            TokenType::DoneInProc => {
                Self::DoneInProc(ready!(Done::decode(&mut cursor, validation)?))
            }
            TokenType::ReturnStatus => Self::ReturnStatus(ready!(read_i32_le(&mut cursor))),
            TokenType::Order => Self::Order(ready!(decode_order(&mut cursor)?)),
        };
        Ok(Progress::Ready((token, src.len() - cursor.len())))
    }

    /// The tag this token was decoded from.
    #[must_use]
    pub fn token_type(&self) -> TokenType {
        match self {
            Self::LoginAck(_) => TokenType::LoginAck,
            Self::Info(_) => TokenType::Info,
            Self::Error(_) => TokenType::Error,
            Self::EnvChange(_) => TokenType::EnvChange,
            Self::ColMetaData(_) => TokenType::ColMetaData,
            Self::Row => TokenType::Row,
            Self::Done(_) => TokenType::Done,
            Self::DoneProc(_) => TokenType::DoneProc,
            Self::DoneInProc(_) => TokenType::DoneInProc,
            Self::ReturnStatus(_) => TokenType::ReturnStatus,
            Self::Order(_) => TokenType::Order,
        }
    }

    /// The completion record of any of the three DONE variants.
    #[must_use]
    pub fn as_done(&self) -> Option<&Done> {
        match self {
            Self::Done(done) | Self::DoneProc(done) | Self::DoneInProc(done) => Some(done),
            _ => None,
        }
    }
}

/// Read a `u16` length prefix and borrow that many bytes.
fn length_prefixed<'a>(src: &mut &'a [u8]) -> Progress<&'a [u8]> {
    match read_u16_le(src) {
        Progress::Ready(len) => read_bytes(src, usize::from(len)),
        Progress::NeedMoreData => Progress::NeedMoreData,
    }
}

/// Parse a complete, length-delimited body. Running short or leaving bytes
/// behind means the declared length lied.
fn parse_body<T>(
    token: &'static str,
    body: &[u8],
    parse: impl FnOnce(&mut &[u8]) -> Result<Progress<T>, ProtocolError>,
) -> Result<T, ProtocolError> {
    let mut cursor = body;
    match parse(&mut cursor)? {
        Progress::Ready(value) if cursor.is_empty() => Ok(value),
        Progress::Ready(_) => Err(ProtocolError::malformed(
            token,
            format!("{} unread bytes after body", cursor.len()),
        )),
        Progress::NeedMoreData => Err(ProtocolError::malformed(
            token,
            "body is shorter than its declared length",
        )),
    }
}

fn decode_order(src: &mut &[u8]) -> Result<Progress<Vec<u16>>, ProtocolError> {
    let body = ready!(length_prefixed(src));
    if body.len() % 2 != 0 {
        return Err(ProtocolError::malformed("ORDER", "odd body length"));
    }
    Ok(Progress::Ready(
        body.chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect(),
    ))
}

/// Login acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginAck {
    /// Interface (1 = SQL).
    pub interface: u8,
    /// TDS version the server agreed to, as sent (big-endian).
    pub tds_version: u32,
    /// Server program name.
    pub prog_name: String,
    /// Server program version (major, minor, build high, build low).
    pub prog_version: u32,
}

impl LoginAck {
    /// Decode a LOGINACK body.
    pub fn decode(src: &mut &[u8]) -> Result<Progress<Self>, ProtocolError> {
        let body = ready!(length_prefixed(src));
        parse_body("LOGINACK", body, |b| {
            let interface = ready!(read_u8(b));
            let tds_version = ready!(read_u32_be(b));
            let prog_name = ready!(read_b_varchar(b)?);
            let prog_version = ready!(read_u32_be(b));
            Ok(Progress::Ready(Self {
                interface,
                tds_version,
                prog_name,
                prog_version,
            }))
        })
        .map(Progress::Ready)
    }
}

/// Body of INFO and ERROR tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMessage {
    /// Message number.
    pub number: i32,
    /// Error state.
    pub state: u8,
    /// Severity class.
    pub class: u8,
    /// Message text.
    pub message: String,
    /// Server name.
    pub server: String,
    /// Procedure name, empty outside procedures.
    pub procedure: String,
    /// Line number within the batch or procedure.
    pub line: i32,
}

impl ServerMessage {
    /// Decode an INFO or ERROR body.
    pub fn decode(src: &mut &[u8], token: &'static str) -> Result<Progress<Self>, ProtocolError> {
        let body = ready!(length_prefixed(src));
        parse_body(token, body, |b| {
            let number = ready!(read_i32_le(b));
            let state = ready!(read_u8(b));
            let class = ready!(read_u8(b));
            let message = ready!(read_us_varchar(b)?);
            let server = ready!(read_b_varchar(b)?);
            let procedure = ready!(read_b_varchar(b)?);
            let line = ready!(read_i32_le(b));
            Ok(Progress::Ready(Self {
                number,
                state,
                class,
                message,
                server,
                procedure,
                line,
            }))
        })
        .map(Progress::Ready)
    }

    /// Severity above 10 means an error rather than an informational message.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.class > 10
    }
}

/// Environment change types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum EnvChangeType {
    /// Current database.
    Database,
    /// Session language.
    Language,
    /// Character set.
    CharacterSet,
    /// Negotiated packet size.
    PacketSize,
    /// Unicode sorting locale id.
    UnicodeSortingLocalId,
    /// Unicode comparison flags.
    UnicodeComparisonFlags,
    /// SQL collation.
    SqlCollation,
    /// Transaction started.
    BeginTransaction,
    /// Transaction committed.
    CommitTransaction,
    /// Transaction rolled back.
    RollbackTransaction,
    /// Enlisted in a distributed transaction.
    EnlistDtcTransaction,
    /// Defected from a distributed transaction.
    DefectTransaction,
    /// Database mirroring partner.
    RealTimeLogShipping,
    /// Transaction promoted.
    PromoteTransaction,
    /// Transaction manager address.
    TransactionManagerAddress,
    /// Transaction ended.
    TransactionEnded,
    /// Reset-connection acknowledgement.
    ResetConnectionAck,
    /// User instance name.
    UserInstanceName,
    /// Routing information.
    Routing,
    /// A type this implementation does not know; its value is kept raw.
    Other(u8),
}

impl EnvChangeType {
    /// Map a wire code to a change type.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Database,
            2 => Self::Language,
            3 => Self::CharacterSet,
            4 => Self::PacketSize,
            5 => Self::UnicodeSortingLocalId,
            6 => Self::UnicodeComparisonFlags,
            7 => Self::SqlCollation,
            8 => Self::BeginTransaction,
            9 => Self::CommitTransaction,
            10 => Self::RollbackTransaction,
            11 => Self::EnlistDtcTransaction,
            12 => Self::DefectTransaction,
            13 => Self::RealTimeLogShipping,
            15 => Self::PromoteTransaction,
            16 => Self::TransactionManagerAddress,
            17 => Self::TransactionEnded,
            18 => Self::ResetConnectionAck,
            19 => Self::UserInstanceName,
            20 => Self::Routing,
            other => Self::Other(other),
        }
    }

    /// The wire code.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Database => 1,
            Self::Language => 2,
            Self::CharacterSet => 3,
            Self::PacketSize => 4,
            Self::UnicodeSortingLocalId => 5,
            Self::UnicodeComparisonFlags => 6,
            Self::SqlCollation => 7,
            Self::BeginTransaction => 8,
            Self::CommitTransaction => 9,
            Self::RollbackTransaction => 10,
            Self::EnlistDtcTransaction => 11,
            Self::DefectTransaction => 12,
            Self::RealTimeLogShipping => 13,
            Self::PromoteTransaction => 15,
            Self::TransactionManagerAddress => 16,
            Self::TransactionEnded => 17,
            Self::ResetConnectionAck => 18,
            Self::UserInstanceName => 19,
            Self::Routing => 20,
            Self::Other(code) => code,
        }
    }

    const fn has_string_values(self) -> bool {
        matches!(
            self,
            Self::Database
                | Self::Language
                | Self::CharacterSet
                | Self::PacketSize
                | Self::UnicodeSortingLocalId
                | Self::UnicodeComparisonFlags
                | Self::RealTimeLogShipping
                | Self::UserInstanceName
        )
    }

    const fn has_binary_values(self) -> bool {
        matches!(
            self,
            Self::SqlCollation
                | Self::BeginTransaction
                | Self::CommitTransaction
                | Self::RollbackTransaction
                | Self::EnlistDtcTransaction
                | Self::DefectTransaction
                | Self::TransactionEnded
                | Self::ResetConnectionAck
        )
    }
}

/// Value carried by an environment change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvChangeValue {
    /// No value.
    None,
    /// Text value (B_VARCHAR on the wire).
    String(String),
    /// Binary value, or the raw body of a change type without a known layout.
    Binary(Bytes),
}

/// Environment change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvChange {
    /// What changed.
    pub change_type: EnvChangeType,
    /// New value.
    pub new_value: EnvChangeValue,
    /// Previous value.
    pub old_value: EnvChangeValue,
}

impl EnvChange {
    /// Decode an ENVCHANGE body.
    pub fn decode(src: &mut &[u8]) -> Result<Progress<Self>, ProtocolError> {
        let body = ready!(length_prefixed(src));
        parse_body("ENVCHANGE", body, |b| {
            let change_type = EnvChangeType::from_u8(ready!(read_u8(b)));
            let (new_value, old_value) = if change_type.has_string_values() {
                let new_value = ready!(read_b_varchar(b)?);
                let old_value = ready!(read_b_varchar(b)?);
                (
                    EnvChangeValue::String(new_value),
                    EnvChangeValue::String(old_value),
                )
            } else if change_type.has_binary_values() {
                let new_value = Bytes::copy_from_slice(ready!(read_b_varbyte(b)));
                let old_value = Bytes::copy_from_slice(ready!(read_b_varbyte(b)));
                (
                    EnvChangeValue::Binary(new_value),
                    EnvChangeValue::Binary(old_value),
                )
            } else {
                let raw = Bytes::copy_from_slice(b);
                *b = &[];
                (EnvChangeValue::Binary(raw), EnvChangeValue::None)
            };
            Ok(Progress::Ready(Self {
                change_type,
                new_value,
                old_value,
            }))
        })
        .map(Progress::Ready)
    }

    /// The packet size announced by a packet size change.
    #[must_use]
    pub fn packet_size(&self) -> Option<usize> {
        match (&self.change_type, &self.new_value) {
            (EnvChangeType::PacketSize, EnvChangeValue::String(value)) => value.parse().ok(),
            _ => None,
        }
    }
}

/// Column metadata for one result set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColMetaData {
    /// Columns in ordinal order.
    pub columns: Vec<ColumnData>,
}

impl ColMetaData {
    /// Column count announcing that no metadata follows.
    pub const NO_METADATA: u16 = 0xFFFF;

    /// Decode a COLMETADATA body.
    ///
    /// The no-metadata sentinel count is followed by its 2-byte marker and
    /// yields zero columns.
    pub fn decode(src: &mut &[u8], validation: Validation) -> Result<Progress<Self>, ProtocolError> {
        let count = ready!(read_u16_le(src));
        if count == Self::NO_METADATA {
            let marker = ready!(read_u16_le(src));
            if validation.is_strict() && marker != Self::NO_METADATA {
                return Err(ProtocolError::malformed(
                    "COLMETADATA",
                    format!("invalid no-metadata marker 0x{marker:04X}"),
                ));
            }
            return Ok(Progress::Ready(Self::default()));
        }

        let mut columns = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            columns.push(ready!(ColumnData::decode(src, validation)?));
        }
        Ok(Progress::Ready(Self { columns }))
    }

    /// Number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether there are no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Metadata of a single column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnData {
    /// User type id.
    pub user_type: u32,
    /// Column flags.
    pub flags: ColumnFlags,
    /// Data type descriptor.
    pub data_type: DataType,
    /// Column name.
    pub name: String,
}

impl ColumnData {
    /// Decode one column definition.
    pub fn decode(src: &mut &[u8], validation: Validation) -> Result<Progress<Self>, ProtocolError> {
        let user_type = ready!(read_u32_le(src));
        let flag_bits = ready!(read_u16_le(src));
        let flags = if validation.is_strict() {
            ColumnFlags::from_bits(flag_bits).ok_or_else(|| {
                ProtocolError::malformed("COLMETADATA", format!("unknown column flags 0x{flag_bits:04X}"))
            })?
        } else {
            ColumnFlags::from_bits_retain(flag_bits)
        };
        let data_type = ready!(DataType::decode(src)?);
        let name = ready!(read_b_varchar(src)?);
        Ok(Progress::Ready(Self {
            user_type,
            flags,
            data_type,
            name,
        }))
    }

    /// Whether the column accepts NULL.
    #[must_use]
    pub fn is_nullable(&self) -> bool {
        self.flags.contains(ColumnFlags::NULLABLE)
    }
}

bitflags! {
    /// DONE token status flags.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct DoneStatus: u16 {
        /// Final completion of the request.
        const FINAL = 0x0000;
        /// More results follow.
        const MORE = 0x0001;
        /// The statement failed.
        const ERROR = 0x0002;
        /// A transaction is in progress.
        const IN_XACT = 0x0004;
        /// The row count is valid.
        const COUNT = 0x0010;
        /// Acknowledges an attention signal.
        const ATTN = 0x0020;
        /// A server error terminated the statement.
        const SRVERROR = 0x0100;
    }
}

/// Completion record carried by DONE, DONEPROC and DONEINPROC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Done {
    /// Status flags.
    pub status: DoneStatus,
    /// Token of the current command.
    pub cur_cmd: u16,
    /// Rows affected or returned; valid when [`DoneStatus::COUNT`] is set.
    pub row_count: u64,
}

impl Done {
    /// Size of the body in bytes.
    pub const SIZE: usize = 12;

    /// Decode a DONE body.
    pub fn decode(src: &mut &[u8], validation: Validation) -> Result<Progress<Self>, ProtocolError> {
        if src.len() < Self::SIZE {
            return Ok(Progress::NeedMoreData);
        }
        let bits = ready!(read_u16_le(src));
        let status = if validation.is_strict() {
            DoneStatus::from_bits(bits).ok_or(ProtocolError::InvalidDoneStatus(bits))?
        } else {
            DoneStatus::from_bits_retain(bits)
        };
        let cur_cmd = ready!(read_u16_le(src));
        let row_count = ready!(read_u64_le(src));
        Ok(Progress::Ready(Self {
            status,
            cur_cmd,
            row_count,
        }))
    }

    /// Encode the body (without the tag).
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u16_le(self.status.bits());
        dst.put_u16_le(self.cur_cmd);
        dst.put_u64_le(self.row_count);
    }

    /// Whether this completes the whole request.
    #[must_use]
    pub fn is_final(&self) -> bool {
        !self.status.contains(DoneStatus::MORE)
    }

    /// Whether the statement reported an error.
    #[must_use]
    pub fn has_error(&self) -> bool {
        self.status.intersects(DoneStatus::ERROR | DoneStatus::SRVERROR)
    }

    /// The row count when the server marked it valid.
    #[must_use]
    pub fn rows_affected(&self) -> Option<u64> {
        self.status
            .contains(DoneStatus::COUNT)
            .then_some(self.row_count)
    }
}
