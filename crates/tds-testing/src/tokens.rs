//! Builders for server-side token streams and packet sequences.
//!
//! These encoders are written independently of the client decoders so that
//! tests compare two implementations of the wire format rather than one
//! implementation against itself.

use bytes::{BufMut, Bytes, BytesMut};
use tds_wire::types::{MAX_TYPE_LENGTH, PLP_NULL, TypeId};
use tds_wire::{
    DoneStatus, EnvChangeType, PACKET_HEADER_SIZE, PacketHeader, PacketStatus, PacketType,
    TokenType,
};

/// Chunk size used when encoding partially-length-prefixed values.
pub const PLP_CHUNK_SIZE: usize = 1024;

/// Default collation: LCID 0x0409, flags 0xD0, sort id 0x34.
const COLLATION: [u8; 5] = [0x09, 0x04, 0xD0, 0x00, 0x34];

/// A value to place in a row.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    /// NULL.
    Null,
    /// `bit`.
    Bool(bool),
    /// `int`.
    Int(i32),
    /// `bigint`.
    BigInt(i64),
    /// `real`.
    Float(f32),
    /// `float`.
    Double(f64),
    /// Character data, sent as UTF-16LE.
    String(String),
    /// Binary data.
    Binary(Vec<u8>),
}

impl ScalarValue {
    fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Null => Vec::new(),
            Self::Bool(v) => vec![u8::from(*v)],
            Self::Int(v) => v.to_le_bytes().to_vec(),
            Self::BigInt(v) => v.to_le_bytes().to_vec(),
            Self::Float(v) => v.to_le_bytes().to_vec(),
            Self::Double(v) => v.to_le_bytes().to_vec(),
            Self::String(s) => s.encode_utf16().flat_map(u16::to_le_bytes).collect(),
            Self::Binary(data) => data.clone(),
        }
    }

    /// The column a value of this kind is reported in by scalar responses.
    pub(crate) fn column(&self) -> MockColumn {
        match self {
            Self::Null | Self::Int(_) => MockColumn::int(""),
            Self::Bool(_) => MockColumn::bit(""),
            Self::BigInt(_) => MockColumn::bigint(""),
            Self::Float(_) => MockColumn::new("", TypeId::FloatN).with_max_length(4),
            Self::Double(_) => MockColumn::float(""),
            Self::String(_) => MockColumn::nvarchar_max(""),
            Self::Binary(_) => MockColumn::varbinary_max(""),
        }
    }
}

/// A column definition for COLMETADATA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockColumn {
    /// Column name.
    pub name: String,
    /// Wire type.
    pub type_id: TypeId,
    /// Declared maximum length in bytes; [`MAX_TYPE_LENGTH`] for `(MAX)`.
    pub max_length: u32,
    /// Nullable flag.
    pub nullable: bool,
}

impl MockColumn {
    /// Column of the given type with its fixed or default size.
    pub fn new(name: impl Into<String>, type_id: TypeId) -> Self {
        Self {
            name: name.into(),
            type_id,
            max_length: type_id.fixed_size().map_or(0, |size| size as u32),
            nullable: true,
        }
    }

    /// Nullable `int` (INTN, 4 bytes).
    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, TypeId::IntN).with_max_length(4)
    }

    /// `int NOT NULL` (fixed INT4).
    pub fn int_not_null(name: impl Into<String>) -> Self {
        Self::new(name, TypeId::Int4).with_nullable(false)
    }

    /// Nullable `bigint`.
    pub fn bigint(name: impl Into<String>) -> Self {
        Self::new(name, TypeId::IntN).with_max_length(8)
    }

    /// Nullable `bit`.
    pub fn bit(name: impl Into<String>) -> Self {
        Self::new(name, TypeId::BitN).with_max_length(1)
    }

    /// Nullable `float`.
    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, TypeId::FloatN).with_max_length(8)
    }

    /// `nvarchar(max_chars)`.
    pub fn nvarchar(name: impl Into<String>, max_chars: u32) -> Self {
        Self::new(name, TypeId::NVarChar).with_max_length(max_chars * 2)
    }

    /// `nvarchar(max)`.
    pub fn nvarchar_max(name: impl Into<String>) -> Self {
        Self::new(name, TypeId::NVarChar).with_max_length(u32::from(MAX_TYPE_LENGTH))
    }

    /// `varbinary(max_len)`.
    pub fn varbinary(name: impl Into<String>, max_len: u32) -> Self {
        Self::new(name, TypeId::BigVarBinary).with_max_length(max_len)
    }

    /// `varbinary(max)`.
    pub fn varbinary_max(name: impl Into<String>) -> Self {
        Self::new(name, TypeId::BigVarBinary).with_max_length(u32::from(MAX_TYPE_LENGTH))
    }

    /// Set the declared length.
    #[must_use]
    pub fn with_max_length(mut self, len: u32) -> Self {
        self.max_length = len;
        self
    }

    /// Set the nullable flag.
    #[must_use]
    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    fn is_plp(&self) -> bool {
        matches!(self.type_id, TypeId::NVarChar | TypeId::BigVarBinary)
            && self.max_length == u32::from(MAX_TYPE_LENGTH)
    }

    fn encode_metadata(&self, dst: &mut BytesMut) {
        dst.put_u32_le(0);
        dst.put_u16_le(u16::from(self.nullable));
        dst.put_u8(self.type_id as u8);
        match self.type_id {
            TypeId::IntN | TypeId::BitN | TypeId::FloatN | TypeId::MoneyN | TypeId::DateTimeN => {
                dst.put_u8(self.max_length as u8);
            }
            TypeId::NVarChar | TypeId::NChar | TypeId::BigVarChar | TypeId::BigChar => {
                dst.put_u16_le(self.max_length as u16);
                dst.put_slice(&COLLATION);
            }
            TypeId::BigVarBinary | TypeId::BigBinary => {
                dst.put_u16_le(self.max_length as u16);
            }
            _ => {}
        }
        put_b_varchar(dst, &self.name);
    }

    fn encode_value(&self, dst: &mut BytesMut, value: &ScalarValue) {
        let bytes = value.to_bytes();
        let is_null = matches!(value, ScalarValue::Null);

        if let Some(size) = self.type_id.fixed_size() {
            // Fixed columns have no NULL representation; pad to width.
            let mut fixed = bytes;
            fixed.resize(size, 0);
            dst.put_slice(&fixed);
            return;
        }

        if self.is_plp() {
            if is_null {
                dst.put_u64_le(PLP_NULL);
                return;
            }
            dst.put_u64_le(bytes.len() as u64);
            for chunk in bytes.chunks(PLP_CHUNK_SIZE) {
                dst.put_u32_le(chunk.len() as u32);
                dst.put_slice(chunk);
            }
            dst.put_u32_le(0);
            return;
        }

        match self.type_id.length_kind() {
            tds_wire::LengthKind::VariableUShort => {
                if is_null {
                    dst.put_u16_le(0xFFFF);
                } else {
                    dst.put_u16_le(bytes.len() as u16);
                    dst.put_slice(&bytes);
                }
            }
            _ => {
                dst.put_u8(bytes.len() as u8);
                dst.put_slice(&bytes);
            }
        }
    }
}

/// Builds a server response token stream.
///
/// Rows are encoded according to the columns of the most recent
/// [`col_metadata`](Self::col_metadata) call.
#[derive(Debug, Clone, Default)]
pub struct TokenStreamBuilder {
    buf: BytesMut,
    columns: Vec<MockColumn>,
}

impl TokenStreamBuilder {
    /// Start an empty stream.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// LOGINACK.
    #[must_use]
    pub fn login_ack(mut self, server_name: &str, tds_version: u32) -> Self {
        let mut body = BytesMut::new();
        body.put_u8(1);
        body.put_u32(tds_version);
        put_b_varchar(&mut body, server_name);
        body.put_u32(0x1000_0000);
        self.put_length_prefixed(TokenType::LoginAck, &body);
        self
    }

    /// String-valued ENVCHANGE.
    #[must_use]
    pub fn env_change(mut self, change_type: EnvChangeType, new_value: &str, old_value: &str) -> Self {
        let mut body = BytesMut::new();
        body.put_u8(change_type.as_u8());
        put_b_varchar(&mut body, new_value);
        put_b_varchar(&mut body, old_value);
        self.put_length_prefixed(TokenType::EnvChange, &body);
        self
    }

    /// Packet size ENVCHANGE.
    #[must_use]
    pub fn packet_size(self, new_size: usize, old_size: usize) -> Self {
        self.env_change(
            EnvChangeType::PacketSize,
            &new_size.to_string(),
            &old_size.to_string(),
        )
    }

    /// INFO message.
    #[must_use]
    pub fn info(mut self, number: i32, message: &str) -> Self {
        let body = server_message(number, 0, message);
        self.put_length_prefixed(TokenType::Info, &body);
        self
    }

    /// ERROR message.
    #[must_use]
    pub fn error(mut self, number: i32, severity: u8, message: &str) -> Self {
        let body = server_message(number, severity, message);
        self.put_length_prefixed(TokenType::Error, &body);
        self
    }

    /// COLMETADATA for the given columns.
    #[must_use]
    pub fn col_metadata(mut self, columns: &[MockColumn]) -> Self {
        self.buf.put_u8(TokenType::ColMetaData as u8);
        self.buf.put_u16_le(columns.len() as u16);
        for column in columns {
            column.encode_metadata(&mut self.buf);
        }
        self.columns = columns.to_vec();
        self
    }

    /// COLMETADATA announcing that no metadata follows.
    #[must_use]
    pub fn no_metadata(mut self) -> Self {
        self.buf.put_u8(TokenType::ColMetaData as u8);
        self.buf.put_u16_le(0xFFFF);
        self.buf.put_u16_le(0xFFFF);
        self.columns.clear();
        self
    }

    /// ROW with one value per column.
    #[must_use]
    pub fn row(mut self, values: &[ScalarValue]) -> Self {
        self.buf.put_u8(TokenType::Row as u8);
        for (column, value) in self.columns.iter().zip(values) {
            column.encode_value(&mut self.buf, value);
        }
        self
    }

    /// DONE.
    #[must_use]
    pub fn done(self, status: DoneStatus, row_count: u64) -> Self {
        self.put_done(TokenType::Done, status, row_count)
    }

    /// DONEPROC.
    #[must_use]
    pub fn done_proc(self, status: DoneStatus, row_count: u64) -> Self {
        self.put_done(TokenType::DoneProc, status, row_count)
    }

    /// DONEINPROC.
    #[must_use]
    pub fn done_in_proc(self, status: DoneStatus, row_count: u64) -> Self {
        self.put_done(TokenType::DoneInProc, status, row_count)
    }

    /// RETURNSTATUS.
    #[must_use]
    pub fn return_status(mut self, value: i32) -> Self {
        self.buf.put_u8(TokenType::ReturnStatus as u8);
        self.buf.put_i32_le(value);
        self
    }

    /// Arbitrary bytes.
    #[must_use]
    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.buf.put_slice(bytes);
        self
    }

    /// Finish the stream.
    #[must_use]
    pub fn build(self) -> Bytes {
        self.buf.freeze()
    }

    fn put_done(mut self, token_type: TokenType, status: DoneStatus, row_count: u64) -> Self {
        self.buf.put_u8(token_type as u8);
        self.buf.put_u16_le(status.bits());
        self.buf.put_u16_le(0xC1);
        self.buf.put_u64_le(row_count);
        self
    }

    fn put_length_prefixed(&mut self, token_type: TokenType, body: &[u8]) {
        self.buf.put_u8(token_type as u8);
        self.buf.put_u16_le(body.len() as u16);
        self.buf.put_slice(body);
    }
}

/// Split a message payload into packets of at most `packet_size` bytes.
///
/// Packet ids start at 1; only the last packet carries end-of-message. An
/// empty payload yields a single header-only packet.
#[must_use]
pub fn packetize(packet_type: PacketType, payload: &[u8], packet_size: usize) -> Bytes {
    let max_payload = packet_size - PACKET_HEADER_SIZE;
    let mut chunks: Vec<&[u8]> = payload.chunks(max_payload).collect();
    if chunks.is_empty() {
        chunks.push(&[]);
    }

    let count = chunks.len();
    let mut out = BytesMut::with_capacity(payload.len() + count * PACKET_HEADER_SIZE);
    for (i, chunk) in chunks.into_iter().enumerate() {
        let status = if i + 1 == count {
            PacketStatus::END_OF_MESSAGE
        } else {
            PacketStatus::NORMAL
        };
        PacketHeader::new(packet_type, status, (PACKET_HEADER_SIZE + chunk.len()) as u16)
            .with_packet_id((i + 1) as u8)
            .encode(&mut out);
        out.put_slice(chunk);
    }
    out.freeze()
}

fn server_message(number: i32, class: u8, message: &str) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_i32_le(number);
    body.put_u8(1);
    body.put_u8(class);
    let units: Vec<u16> = message.encode_utf16().collect();
    body.put_u16_le(units.len() as u16);
    for unit in units {
        body.put_u16_le(unit);
    }
    put_b_varchar(&mut body, "MockServer");
    put_b_varchar(&mut body, "");
    body.put_i32_le(1);
    body
}

fn put_b_varchar(dst: &mut BytesMut, value: &str) {
    let units: Vec<u16> = value.encode_utf16().collect();
    dst.put_u8(units.len() as u8);
    for unit in units {
        dst.put_u16_le(unit);
    }
}
