//! Column value reading and conversion.
//!
//! Values are read straight out of the token stream using the column's
//! [`LengthKind`]. Conversion into Rust types goes through [`FromColumn`];
//! a rejected conversion leaves the value in the stream so the caller can
//! retry with a different type.

use std::any::type_name;

use tds_wire::codec::decode_utf16_lossy;
use tds_wire::types::PLP_NULL;
use tds_wire::{DataType, LengthKind, ProtocolError, TypeId};

use crate::buffered::ByteSource;
use crate::error::StreamError;

/// Conversion from a raw column value.
///
/// `value` is `None` for NULL. Implementations must not accept a column in
/// [`accepts`](Self::accepts) and then reject it for its type alone; that
/// check runs before the value is consumed.
pub trait FromColumn: Sized {
    /// Whether values of this column type can be converted.
    fn accepts(data_type: &DataType) -> bool;

    /// Convert a value of an accepted column.
    fn from_column(data_type: &DataType, value: Option<&[u8]>) -> Result<Self, StreamError>;
}

/// Length of a value as announced by its prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueLength {
    Null,
    Bytes(usize),
    /// Chunked; total length is only a hint.
    Plp,
}

/// Peek the length prefix of the next value without consuming it.
///
/// Returns the prefix size and the announced length.
async fn peek_length<S: ByteSource>(
    source: &mut S,
    data_type: &DataType,
) -> Result<(usize, ValueLength), StreamError> {
    let kind = data_type.length_kind;
    let prefix = kind.prefix_size();
    if prefix > 0 {
        source.fill(prefix).await?;
    }
    let buf = source.buffer();
    let raw = match kind {
        LengthKind::Zero => return Ok((0, ValueLength::Null)),
        LengthKind::Fixed => return Ok((0, ValueLength::Bytes(data_type.fixed_size()))),
        LengthKind::VariableByte => u64::from(buf[0]),
        LengthKind::VariableUShort => u64::from(u16::from_le_bytes([buf[0], buf[1]])),
        LengthKind::VariableInt => u64::from(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])),
        LengthKind::PartiallyLengthPrefixed => {
            let total = u64::from_le_bytes([
                buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
            ]);
            let length = if total == PLP_NULL {
                ValueLength::Null
            } else {
                ValueLength::Plp
            };
            return Ok((prefix, length));
        }
    };

    if data_type.is_null_length(raw) {
        return Ok((prefix, ValueLength::Null));
    }
    let len = usize::try_from(raw).map_err(|_| malformed("value length overflows usize"))?;
    Ok((prefix, ValueLength::Bytes(len)))
}

fn malformed(reason: &str) -> StreamError {
    ProtocolError::MalformedToken {
        token: "ROW",
        reason: reason.to_string(),
    }
    .into()
}

async fn skip_bytes<S: ByteSource>(source: &mut S, mut n: usize) -> Result<(), StreamError> {
    while n > 0 {
        if source.buffer().is_empty() {
            source.fill(1).await?;
        }
        let step = source.buffer().len().min(n);
        source.advance(step)?;
        n -= step;
    }
    Ok(())
}

/// Read the next PLP chunk length, consuming it.
async fn next_chunk<S: ByteSource>(source: &mut S) -> Result<usize, StreamError> {
    let buf = source.read_at_least(4).await?;
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    source.advance(4)?;
    usize::try_from(len).map_err(|_| malformed("PLP chunk length overflows usize"))
}

/// Skip the next value of a column without decoding it.
pub(crate) async fn skip_value<S: ByteSource>(
    source: &mut S,
    data_type: &DataType,
) -> Result<(), StreamError> {
    let (prefix, length) = peek_length(source, data_type).await?;
    source.advance(prefix)?;
    match length {
        ValueLength::Null => Ok(()),
        ValueLength::Bytes(n) => skip_bytes(source, n).await,
        ValueLength::Plp => loop {
            let chunk = next_chunk(source).await?;
            if chunk == 0 {
                return Ok(());
            }
            skip_bytes(source, chunk).await?;
        },
    }
}

/// Read the next value of a column and convert it.
///
/// The column type is checked before anything is consumed. For values that
/// fit the buffer the conversion also runs before consuming, so a failed
/// conversion leaves the stream positioned on the value.
pub(crate) async fn read_value<S: ByteSource, T: FromColumn>(
    source: &mut S,
    data_type: &DataType,
) -> Result<T, StreamError> {
    if !T::accepts(data_type) {
        return Err(StreamError::UnsupportedConversion {
            from: data_type.type_id,
            to: type_name::<T>(),
        });
    }
    if data_type.length_kind == LengthKind::VariableInt {
        return Err(ProtocolError::UnsupportedLengthKind(LengthKind::VariableInt).into());
    }

    let (prefix, length) = peek_length(source, data_type).await?;
    match length {
        ValueLength::Null => {
            let value = T::from_column(data_type, None)?;
            source.advance(prefix)?;
            Ok(value)
        }
        ValueLength::Bytes(n) => {
            let capacity = source.capacity() - prefix;
            if n > capacity {
                return Err(StreamError::ValueTooLarge { len: n, capacity });
            }
            source.fill(prefix + n).await?;
            let value = T::from_column(data_type, Some(&source.buffer()[prefix..prefix + n]))?;
            source.advance(prefix + n)?;
            Ok(value)
        }
        ValueLength::Plp => {
            source.advance(prefix)?;
            let mut data = Vec::new();
            loop {
                let mut chunk = next_chunk(source).await?;
                if chunk == 0 {
                    break;
                }
                data.reserve(chunk);
                while chunk > 0 {
                    let buf = source.read_at_least(1).await?;
                    let step = buf.len().min(chunk);
                    data.extend_from_slice(&buf[..step]);
                    source.advance(step)?;
                    chunk -= step;
                }
            }
            T::from_column(data_type, Some(&data))
        }
    }
}

fn unexpected_null<T>() -> StreamError {
    StreamError::UnexpectedNull {
        to: type_name::<T>(),
    }
}

fn require<T>(value: Option<&[u8]>) -> Result<&[u8], StreamError> {
    value.ok_or_else(unexpected_null::<T>)
}

/// Byte width of integer columns.
fn int_width(data_type: &DataType) -> Option<usize> {
    match data_type.type_id {
        TypeId::Int1 => Some(1),
        TypeId::Int2 => Some(2),
        TypeId::Int4 => Some(4),
        TypeId::Int8 => Some(8),
        TypeId::IntN => Some(data_type.max_length as usize),
        _ => None,
    }
}

/// Decode an integer value by its length. `tinyint` is unsigned.
fn decode_int(bytes: &[u8]) -> Result<i64, StreamError> {
    match *bytes {
        [b] => Ok(i64::from(b)),
        [a, b] => Ok(i64::from(i16::from_le_bytes([a, b]))),
        [a, b, c, d] => Ok(i64::from(i32::from_le_bytes([a, b, c, d]))),
        [a, b, c, d, e, f, g, h] => Ok(i64::from_le_bytes([a, b, c, d, e, f, g, h])),
        _ => Err(malformed("integer value of unexpected length")),
    }
}

macro_rules! impl_from_column_int {
    ($($ty:ty => $accepts:expr),* $(,)?) => {
        $(
            impl FromColumn for $ty {
                fn accepts(data_type: &DataType) -> bool {
                    int_width(data_type).is_some_and($accepts)
                }

                fn from_column(_: &DataType, value: Option<&[u8]>) -> Result<Self, StreamError> {
                    let value = decode_int(require::<Self>(value)?)?;
                    <$ty>::try_from(value).map_err(|_| malformed("integer value wider than its column"))
                }
            }
        )*
    };
}

impl_from_column_int! {
    u8 => |width| width == 1,
    i16 => |width| width <= 2,
    i32 => |width| width <= 4,
    i64 => |width| width <= 8,
}

impl FromColumn for bool {
    fn accepts(data_type: &DataType) -> bool {
        matches!(data_type.type_id, TypeId::Bit | TypeId::BitN)
    }

    fn from_column(_: &DataType, value: Option<&[u8]>) -> Result<Self, StreamError> {
        match require::<Self>(value)? {
            [b] => Ok(*b != 0),
            _ => Err(malformed("bit value of unexpected length")),
        }
    }
}

impl FromColumn for f32 {
    fn accepts(data_type: &DataType) -> bool {
        match data_type.type_id {
            TypeId::Float4 => true,
            TypeId::FloatN => data_type.max_length == 4,
            _ => false,
        }
    }

    fn from_column(_: &DataType, value: Option<&[u8]>) -> Result<Self, StreamError> {
        match *require::<Self>(value)? {
            [a, b, c, d] => Ok(f32::from_le_bytes([a, b, c, d])),
            _ => Err(malformed("real value of unexpected length")),
        }
    }
}

impl FromColumn for f64 {
    fn accepts(data_type: &DataType) -> bool {
        matches!(
            data_type.type_id,
            TypeId::Float4 | TypeId::Float8 | TypeId::FloatN
        )
    }

    fn from_column(_: &DataType, value: Option<&[u8]>) -> Result<Self, StreamError> {
        match *require::<Self>(value)? {
            [a, b, c, d] => Ok(f64::from(f32::from_le_bytes([a, b, c, d]))),
            [a, b, c, d, e, f, g, h] => Ok(f64::from_le_bytes([a, b, c, d, e, f, g, h])),
            _ => Err(malformed("float value of unexpected length")),
        }
    }
}

impl FromColumn for String {
    fn accepts(data_type: &DataType) -> bool {
        matches!(
            data_type.type_id,
            TypeId::NVarChar
                | TypeId::NChar
                | TypeId::Xml
                | TypeId::BigVarChar
                | TypeId::BigChar
                | TypeId::VarChar
                | TypeId::Char
        )
    }

    fn from_column(data_type: &DataType, value: Option<&[u8]>) -> Result<Self, StreamError> {
        let bytes = require::<Self>(value)?;
        match data_type.type_id {
            TypeId::NVarChar | TypeId::NChar | TypeId::Xml => Ok(decode_utf16_lossy(bytes)?),
            // Single-byte text is collation dependent; non-UTF-8 bytes are replaced.
            _ => Ok(String::from_utf8_lossy(bytes).into_owned()),
        }
    }
}

impl FromColumn for Vec<u8> {
    fn accepts(data_type: &DataType) -> bool {
        matches!(
            data_type.type_id,
            TypeId::Binary | TypeId::VarBinary | TypeId::BigBinary | TypeId::BigVarBinary
        )
    }

    fn from_column(_: &DataType, value: Option<&[u8]>) -> Result<Self, StreamError> {
        Ok(require::<Self>(value)?.to_vec())
    }
}

impl<T: FromColumn> FromColumn for Option<T> {
    fn accepts(data_type: &DataType) -> bool {
        T::accepts(data_type)
    }

    fn from_column(data_type: &DataType, value: Option<&[u8]>) -> Result<Self, StreamError> {
        value
            .map(|bytes| T::from_column(data_type, Some(bytes)))
            .transpose()
    }
}
