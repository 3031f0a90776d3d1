//! TDS data type definitions.
//!
//! This module defines the SQL Server data types as they appear in the TDS
//! protocol and the rule ([`LengthKind`]) that determines how many bytes a
//! value of each type occupies in a row.

use bitflags::bitflags;

use crate::codec::{Progress, read_b_varchar, read_bytes, read_u8, read_u16_le, read_u32_le, read_us_varchar};
use crate::error::ProtocolError;

/// Length of the collation descriptor that follows character type lengths.
pub const COLLATION_SIZE: usize = 5;

/// Declared `u16` length that marks a `(MAX)` type.
pub const MAX_TYPE_LENGTH: u16 = 0xFFFF;

/// TDS data type identifiers.
///
/// These correspond to the type bytes sent in column metadata and parameter definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeId {
    // Fixed-length types (no length prefix)
    /// Null type.
    Null = 0x1F,
    /// 8-bit unsigned integer.
    Int1 = 0x30,
    /// Bit (boolean).
    Bit = 0x32,
    /// 16-bit signed integer.
    Int2 = 0x34,
    /// 32-bit signed integer.
    Int4 = 0x38,
    /// 64-bit signed integer.
    Int8 = 0x7F,
    /// 32-bit floating point.
    Float4 = 0x3B,
    /// 64-bit floating point.
    Float8 = 0x3E,
    /// 8-byte money.
    Money = 0x3C,
    /// 4-byte money.
    Money4 = 0x7A,
    /// 8-byte datetime.
    DateTime = 0x3D,
    /// 4-byte small datetime.
    DateTime4 = 0x3A,

    // Variable-length types (with length prefix)
    /// Variable-length GUID.
    Guid = 0x24,
    /// Variable-length integer.
    IntN = 0x26,
    /// Legacy decimal.
    Decimal = 0x37,
    /// Legacy numeric.
    Numeric = 0x3F,
    /// Variable-length bit.
    BitN = 0x68,
    /// Variable-length decimal.
    DecimalN = 0x6A,
    /// Variable-length numeric.
    NumericN = 0x6C,
    /// Variable-length float.
    FloatN = 0x6D,
    /// Variable-length money.
    MoneyN = 0x6E,
    /// Variable-length datetime.
    DateTimeN = 0x6F,

    // Byte-counted types
    /// Fixed-length character.
    Char = 0x2F,
    /// Variable-length character.
    VarChar = 0x27,
    /// Fixed-length binary.
    Binary = 0x2D,
    /// Variable-length binary.
    VarBinary = 0x25,

    // Counted types with 2-byte length
    /// Large variable-length character.
    BigVarChar = 0xA7,
    /// Large variable-length binary.
    BigVarBinary = 0xA5,
    /// Large fixed-length character.
    BigChar = 0xAF,
    /// Large fixed-length binary.
    BigBinary = 0xAD,

    // Unicode types
    /// Fixed-length Unicode character.
    NChar = 0xEF,
    /// Variable-length Unicode character.
    NVarChar = 0xE7,

    // Large object types
    /// Text (deprecated, use varchar(max)).
    Text = 0x23,
    /// Image (deprecated, use varbinary(max)).
    Image = 0x22,
    /// NText (deprecated, use nvarchar(max)).
    NText = 0x63,

    // Date/time types (SQL Server 2008+)
    /// Date (3 bytes).
    Date = 0x28,
    /// Time with variable precision.
    Time = 0x29,
    /// DateTime2 with variable precision.
    DateTime2 = 0x2A,
    /// DateTimeOffset with variable precision.
    DateTimeOffset = 0x2B,

    // Special types
    /// SQL Variant.
    Variant = 0x62,
    /// User-defined type.
    Udt = 0xF0,
    /// XML type.
    Xml = 0xF1,
}

impl TypeId {
    /// Create a type ID from a raw byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x1F => Some(Self::Null),
            0x30 => Some(Self::Int1),
            0x32 => Some(Self::Bit),
            0x34 => Some(Self::Int2),
            0x38 => Some(Self::Int4),
            0x7F => Some(Self::Int8),
            0x3B => Some(Self::Float4),
            0x3E => Some(Self::Float8),
            0x3C => Some(Self::Money),
            0x7A => Some(Self::Money4),
            0x3D => Some(Self::DateTime),
            0x3A => Some(Self::DateTime4),
            0x24 => Some(Self::Guid),
            0x26 => Some(Self::IntN),
            0x37 => Some(Self::Decimal),
            0x3F => Some(Self::Numeric),
            0x68 => Some(Self::BitN),
            0x6A => Some(Self::DecimalN),
            0x6C => Some(Self::NumericN),
            0x6D => Some(Self::FloatN),
            0x6E => Some(Self::MoneyN),
            0x6F => Some(Self::DateTimeN),
            0x2F => Some(Self::Char),
            0x27 => Some(Self::VarChar),
            0x2D => Some(Self::Binary),
            0x25 => Some(Self::VarBinary),
            0xA7 => Some(Self::BigVarChar),
            0xA5 => Some(Self::BigVarBinary),
            0xAF => Some(Self::BigChar),
            0xAD => Some(Self::BigBinary),
            0xEF => Some(Self::NChar),
            0xE7 => Some(Self::NVarChar),
            0x23 => Some(Self::Text),
            0x22 => Some(Self::Image),
            0x63 => Some(Self::NText),
            0x28 => Some(Self::Date),
            0x29 => Some(Self::Time),
            0x2A => Some(Self::DateTime2),
            0x2B => Some(Self::DateTimeOffset),
            0x62 => Some(Self::Variant),
            0xF0 => Some(Self::Udt),
            0xF1 => Some(Self::Xml),
            _ => None,
        }
    }

    /// The length encoding of values of this type, before `(MAX)` declarations
    /// are taken into account.
    #[must_use]
    pub const fn length_kind(&self) -> LengthKind {
        match self {
            Self::Null => LengthKind::Zero,
            Self::Int1
            | Self::Bit
            | Self::Int2
            | Self::Int4
            | Self::Int8
            | Self::Float4
            | Self::Float8
            | Self::Money
            | Self::Money4
            | Self::DateTime
            | Self::DateTime4 => LengthKind::Fixed,
            Self::Guid
            | Self::IntN
            | Self::Decimal
            | Self::Numeric
            | Self::BitN
            | Self::DecimalN
            | Self::NumericN
            | Self::FloatN
            | Self::MoneyN
            | Self::DateTimeN
            | Self::Char
            | Self::VarChar
            | Self::Binary
            | Self::VarBinary
            | Self::Date
            | Self::Time
            | Self::DateTime2
            | Self::DateTimeOffset => LengthKind::VariableByte,
            Self::BigVarChar
            | Self::BigVarBinary
            | Self::BigChar
            | Self::BigBinary
            | Self::NChar
            | Self::NVarChar => LengthKind::VariableUShort,
            Self::Text | Self::Image | Self::NText | Self::Variant => LengthKind::VariableInt,
            Self::Udt | Self::Xml => LengthKind::PartiallyLengthPrefixed,
        }
    }

    /// Check if this is a fixed-length type.
    #[must_use]
    pub const fn is_fixed_length(&self) -> bool {
        matches!(self.length_kind(), LengthKind::Fixed | LengthKind::Zero)
    }

    /// Check if this is a Unicode type.
    #[must_use]
    pub const fn is_unicode(&self) -> bool {
        matches!(self, Self::NChar | Self::NVarChar | Self::NText)
    }

    /// Check if this type carries a collation in its metadata.
    #[must_use]
    pub const fn has_collation(&self) -> bool {
        matches!(
            self,
            Self::BigVarChar | Self::BigChar | Self::NVarChar | Self::NChar
        )
    }

    /// Get the fixed size of this type in bytes, if applicable.
    #[must_use]
    pub const fn fixed_size(&self) -> Option<usize> {
        match self {
            Self::Null => Some(0),
            Self::Int1 => Some(1),
            Self::Bit => Some(1),
            Self::Int2 => Some(2),
            Self::Int4 => Some(4),
            Self::Int8 => Some(8),
            Self::Float4 => Some(4),
            Self::Float8 => Some(8),
            Self::Money => Some(8),
            Self::Money4 => Some(4),
            Self::DateTime => Some(8),
            Self::DateTime4 => Some(4),
            _ => None,
        }
    }
}

/// How the byte length of a column value is determined on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LengthKind {
    /// Size implied by the type; no prefix.
    Fixed,
    /// 1-byte length prefix.
    VariableByte,
    /// 2-byte length prefix, `0xFFFF` is NULL.
    VariableUShort,
    /// 4-byte length prefix.
    VariableInt,
    /// 8-byte total length followed by `u32`-prefixed chunks ending in an
    /// empty chunk; a total of `u64::MAX` is NULL.
    PartiallyLengthPrefixed,
    /// No value bytes at all; always NULL.
    Zero,
}

impl LengthKind {
    /// Size in bytes of the length prefix.
    #[must_use]
    pub const fn prefix_size(&self) -> usize {
        match self {
            Self::Fixed | Self::Zero => 0,
            Self::VariableByte => 1,
            Self::VariableUShort => 2,
            Self::VariableInt => 4,
            Self::PartiallyLengthPrefixed => 8,
        }
    }
}

/// Total length announcing a NULL partially-length-prefixed value.
pub const PLP_NULL: u64 = u64::MAX;

/// Total length announcing a partially-length-prefixed value of unknown size.
pub const PLP_UNKNOWN_LENGTH: u64 = u64::MAX - 1;

/// A column's data type as declared in column metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataType {
    /// Type code.
    pub type_id: TypeId,
    /// Length encoding of values of this column.
    pub length_kind: LengthKind,
    /// Declared maximum length in bytes (the implied size for fixed types).
    pub max_length: u32,
    /// Precision for decimal types.
    pub precision: u8,
    /// Scale for decimal and time types.
    pub scale: u8,
}

impl DataType {
    /// Descriptor for a type that needs no extra metadata.
    #[must_use]
    pub const fn new(type_id: TypeId) -> Self {
        let max_length = match type_id.fixed_size() {
            Some(size) => size as u32,
            None => 0,
        };
        Self {
            type_id,
            length_kind: type_id.length_kind(),
            max_length,
            precision: 0,
            scale: 0,
        }
    }

    /// Descriptor with a declared maximum length.
    #[must_use]
    pub const fn with_max_length(mut self, max_length: u32) -> Self {
        self.max_length = max_length;
        self
    }

    /// Size of a value of a [`LengthKind::Fixed`] type.
    #[must_use]
    pub const fn fixed_size(&self) -> usize {
        match self.type_id.fixed_size() {
            Some(size) => size,
            None => 0,
        }
    }

    /// Whether a length prefix value announces NULL for this type.
    ///
    /// Only meaningful for the byte, ushort and int prefixed kinds.
    #[must_use]
    pub const fn is_null_length(&self, length: u64) -> bool {
        match self.length_kind {
            LengthKind::Zero => true,
            LengthKind::Fixed => false,
            LengthKind::VariableByte => match self.type_id {
                TypeId::Char | TypeId::VarChar | TypeId::Binary | TypeId::VarBinary => {
                    length == 0xFF
                }
                _ => length == 0,
            },
            LengthKind::VariableUShort => length == 0xFFFF,
            LengthKind::VariableInt => match self.type_id {
                TypeId::Variant => length == 0,
                _ => length == 0xFFFF_FFFF,
            },
            LengthKind::PartiallyLengthPrefixed => length == PLP_NULL,
        }
    }

    /// Decode a TYPE_INFO structure: type byte plus its type-specific metadata.
    ///
    /// Character types are followed by a collation which is checked for
    /// presence and skipped. Declared `(MAX)` lengths switch the column to
    /// [`LengthKind::PartiallyLengthPrefixed`].
    pub fn decode(src: &mut &[u8]) -> Result<Progress<Self>, ProtocolError> {
        let code = ready!(read_u8(src));
        let type_id = TypeId::from_u8(code).ok_or(ProtocolError::UnsupportedType(code))?;
        let mut data_type = Self::new(type_id);

        match type_id {
            TypeId::Null
            | TypeId::Int1
            | TypeId::Bit
            | TypeId::Int2
            | TypeId::Int4
            | TypeId::Int8
            | TypeId::Float4
            | TypeId::Float8
            | TypeId::Money
            | TypeId::Money4
            | TypeId::DateTime
            | TypeId::DateTime4 => {}

            TypeId::Date => data_type.max_length = 3,

            TypeId::IntN
            | TypeId::BitN
            | TypeId::FloatN
            | TypeId::MoneyN
            | TypeId::DateTimeN
            | TypeId::Guid
            | TypeId::Char
            | TypeId::VarChar
            | TypeId::Binary
            | TypeId::VarBinary => {
                data_type.max_length = u32::from(ready!(read_u8(src)));
            }

            TypeId::Decimal | TypeId::Numeric | TypeId::DecimalN | TypeId::NumericN => {
                data_type.max_length = u32::from(ready!(read_u8(src)));
                data_type.precision = ready!(read_u8(src));
                data_type.scale = ready!(read_u8(src));
            }

            TypeId::Time | TypeId::DateTime2 | TypeId::DateTimeOffset => {
                data_type.scale = ready!(read_u8(src));
            }

            TypeId::BigVarChar
            | TypeId::BigChar
            | TypeId::NVarChar
            | TypeId::NChar
            | TypeId::BigVarBinary
            | TypeId::BigBinary => {
                let max_length = ready!(read_u16_le(src));
                if type_id.has_collation() {
                    ready!(read_bytes(src, COLLATION_SIZE));
                }
                data_type.max_length = u32::from(max_length);
                if max_length == MAX_TYPE_LENGTH {
                    data_type.length_kind = LengthKind::PartiallyLengthPrefixed;
                }
            }

            TypeId::Variant => {
                data_type.max_length = ready!(read_u32_le(src));
            }

            TypeId::Xml => {
                let has_schema = ready!(read_u8(src));
                if has_schema != 0 {
                    ready!(read_b_varchar(src)?);
                    ready!(read_b_varchar(src)?);
                    ready!(read_us_varchar(src)?);
                }
                data_type.max_length = u32::MAX;
            }

            TypeId::Text | TypeId::NText | TypeId::Image | TypeId::Udt => {
                return Err(ProtocolError::UnsupportedType(code));
            }
        }

        Ok(Progress::Ready(data_type))
    }
}

bitflags! {
    /// Column flags from COLMETADATA.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct ColumnFlags: u16 {
        /// Column is nullable.
        const NULLABLE = 0x0001;
        /// Column uses case-sensitive comparison.
        const CASE_SENSITIVE = 0x0002;
        /// Column is read-write.
        const UPDATEABLE = 0x0004;
        /// Updateability unknown.
        const UPDATEABLE_UNKNOWN = 0x0008;
        /// Column is an identity column.
        const IDENTITY = 0x0010;
        /// Column is computed.
        const COMPUTED = 0x0020;
        /// Column has fixed-length CLR type.
        const FIXED_LEN_CLR_TYPE = 0x0100;
        /// Column is a sparse column set.
        const SPARSE_COLUMN_SET = 0x0200;
        /// Column is encrypted.
        const ENCRYPTED = 0x0400;
        /// Column is hidden.
        const HIDDEN = 0x2000;
        /// Column is a key column.
        const KEY = 0x4000;
        /// Nullability unknown at query time.
        const NULLABLE_UNKNOWN = 0x8000;
    }
}

/// Update mode for a column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Updateable {
    /// Column is read-only.
    #[default]
    ReadOnly,
    /// Column is read-write.
    ReadWrite,
    /// Updateability unknown.
    Unknown,
}

impl ColumnFlags {
    /// Decode the 2-bit updateability field.
    #[must_use]
    pub fn updateable(&self) -> Updateable {
        if self.contains(Self::UPDATEABLE_UNKNOWN) {
            Updateable::Unknown
        } else if self.contains(Self::UPDATEABLE) {
            Updateable::ReadWrite
        } else {
            Updateable::ReadOnly
        }
    }
}
