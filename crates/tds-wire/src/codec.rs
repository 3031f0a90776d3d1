//! Primitive readers and writers shared by the token and payload codecs.
//!
//! Readers take `&mut &[u8]` and advance the slice as they go. When the slice
//! is too short they return [`Progress::NeedMoreData`]; the slice may then have
//! been partially advanced, which is fine because token decoding restarts
//! from the beginning of the token body on every attempt.

use bytes::{Buf, BufMut};

use crate::error::ProtocolError;

/// Outcome of a decoding attempt over possibly incomplete input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Progress<T> {
    /// The value was fully decoded.
    Ready(T),
    /// More bytes are required before the value can be decoded.
    NeedMoreData,
}

impl<T> Progress<T> {
    /// Map the ready value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Progress<U> {
        match self {
            Self::Ready(value) => Progress::Ready(f(value)),
            Self::NeedMoreData => Progress::NeedMoreData,
        }
    }

    /// Whether the value was decoded.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    /// Convert into an `Option`, dropping the need-more-data signal.
    #[must_use]
    pub fn ready(self) -> Option<T> {
        match self {
            Self::Ready(value) => Some(value),
            Self::NeedMoreData => None,
        }
    }
}

/// Read one byte.
pub fn read_u8(src: &mut &[u8]) -> Progress<u8> {
    if src.remaining() < 1 {
        return Progress::NeedMoreData;
    }
    Progress::Ready(src.get_u8())
}

/// Read a little-endian `u16`.
pub fn read_u16_le(src: &mut &[u8]) -> Progress<u16> {
    if src.remaining() < 2 {
        return Progress::NeedMoreData;
    }
    Progress::Ready(src.get_u16_le())
}

/// Read a little-endian `u32`.
pub fn read_u32_le(src: &mut &[u8]) -> Progress<u32> {
    if src.remaining() < 4 {
        return Progress::NeedMoreData;
    }
    Progress::Ready(src.get_u32_le())
}

/// Read a big-endian `u32`.
pub fn read_u32_be(src: &mut &[u8]) -> Progress<u32> {
    if src.remaining() < 4 {
        return Progress::NeedMoreData;
    }
    Progress::Ready(src.get_u32())
}

/// Read a little-endian `i32`.
pub fn read_i32_le(src: &mut &[u8]) -> Progress<i32> {
    if src.remaining() < 4 {
        return Progress::NeedMoreData;
    }
    Progress::Ready(src.get_i32_le())
}

/// Read a little-endian `u64`.
pub fn read_u64_le(src: &mut &[u8]) -> Progress<u64> {
    if src.remaining() < 8 {
        return Progress::NeedMoreData;
    }
    Progress::Ready(src.get_u64_le())
}

/// Borrow the next `len` bytes.
pub fn read_bytes<'a>(src: &mut &'a [u8], len: usize) -> Progress<&'a [u8]> {
    if src.len() < len {
        return Progress::NeedMoreData;
    }
    let (head, tail) = src.split_at(len);
    *src = tail;
    Progress::Ready(head)
}

/// Read a B_VARCHAR: 1-byte length in UTF-16 code units, then UTF-16LE text.
pub fn read_b_varchar(src: &mut &[u8]) -> Result<Progress<String>, ProtocolError> {
    let len = ready!(read_u8(src));
    read_utf16_string(src, usize::from(len))
}

/// Read a US_VARCHAR: 2-byte length in UTF-16 code units, then UTF-16LE text.
pub fn read_us_varchar(src: &mut &[u8]) -> Result<Progress<String>, ProtocolError> {
    let len = ready!(read_u16_le(src));
    read_utf16_string(src, usize::from(len))
}

/// Read a B_VARBYTE: 1-byte length in bytes, then the bytes.
pub fn read_b_varbyte<'a>(src: &mut &'a [u8]) -> Progress<&'a [u8]> {
    match read_u8(src) {
        Progress::Ready(len) => read_bytes(src, usize::from(len)),
        Progress::NeedMoreData => Progress::NeedMoreData,
    }
}

/// Read `char_count` UTF-16 code units.
pub fn read_utf16_string(
    src: &mut &[u8],
    char_count: usize,
) -> Result<Progress<String>, ProtocolError> {
    let bytes = ready!(read_bytes(src, char_count * 2));
    decode_utf16(bytes).map(Progress::Ready)
}

/// Decode UTF-16LE bytes into a `String`.
pub fn decode_utf16(bytes: &[u8]) -> Result<String, ProtocolError> {
    if bytes.len() % 2 != 0 {
        return Err(ProtocolError::StringEncoding(format!(
            "odd UTF-16 byte length {}",
            bytes.len()
        )));
    }
    let units = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
    char::decode_utf16(units)
        .collect::<Result<String, _>>()
        .map_err(|e| ProtocolError::StringEncoding(e.to_string()))
}

/// Decode UTF-16LE column data, replacing unpaired surrogates.
///
/// Column values are UCS-2 and may legally hold lone surrogates; only an odd
/// byte length is an error.
pub fn decode_utf16_lossy(bytes: &[u8]) -> Result<String, ProtocolError> {
    if bytes.len() % 2 != 0 {
        return Err(ProtocolError::StringEncoding(format!(
            "odd UTF-16 byte length {}",
            bytes.len()
        )));
    }
    let units = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
    Ok(char::decode_utf16(units)
        .map(|unit| unit.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect())
}

/// Write a B_VARCHAR.
pub fn write_b_varchar(dst: &mut impl BufMut, s: &str) -> Result<(), ProtocolError> {
    let len = s.encode_utf16().count();
    let len = u8::try_from(len).map_err(|_| ProtocolError::ValueTooLarge {
        field: "B_VARCHAR",
        len,
    })?;
    dst.put_u8(len);
    write_utf16_string(dst, s);
    Ok(())
}

/// Write a US_VARCHAR.
pub fn write_us_varchar(dst: &mut impl BufMut, s: &str) -> Result<(), ProtocolError> {
    let len = s.encode_utf16().count();
    let len = u16::try_from(len).map_err(|_| ProtocolError::ValueTooLarge {
        field: "US_VARCHAR",
        len,
    })?;
    dst.put_u16_le(len);
    write_utf16_string(dst, s);
    Ok(())
}

/// Write a UTF-16LE string without length prefix.
pub fn write_utf16_string(dst: &mut impl BufMut, s: &str) {
    for c in s.encode_utf16() {
        dst.put_u16_le(c);
    }
}

/// Calculate the byte length of a UTF-16 encoded string.
#[must_use]
pub fn utf16_byte_len(s: &str) -> usize {
    s.encode_utf16().count() * 2
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_b_varchar_roundtrip() {
        let original = "Hello, 世界!";
        let mut buf = BytesMut::new();
        write_b_varchar(&mut buf, original).unwrap();

        let mut cursor = &buf[..];
        let decoded = read_b_varchar(&mut cursor).unwrap();
        assert_eq!(decoded, Progress::Ready(original.to_string()));
        assert!(cursor.is_empty());
    }

    #[test]
    fn test_us_varchar_needs_whole_string() {
        let mut buf = BytesMut::new();
        write_us_varchar(&mut buf, "αβγ").unwrap();

        for cut in 0..buf.len() {
            let mut cursor = &buf[..cut];
            assert_eq!(read_us_varchar(&mut cursor).unwrap(), Progress::NeedMoreData);
        }
        let mut cursor = &buf[..];
        assert_eq!(
            read_us_varchar(&mut cursor).unwrap(),
            Progress::Ready("αβγ".to_string())
        );
    }

    #[test]
    fn test_b_varchar_too_long() {
        let long = "x".repeat(256);
        let mut buf = BytesMut::new();
        assert!(matches!(
            write_b_varchar(&mut buf, &long),
            Err(ProtocolError::ValueTooLarge { len: 256, .. })
        ));
    }

    #[test]
    fn test_invalid_utf16() {
        // Lone high surrogate.
        assert!(matches!(
            decode_utf16(&[0x00, 0xD8]),
            Err(ProtocolError::StringEncoding(_))
        ));
        assert!(decode_utf16(&[0x41]).is_err());
    }

    #[test]
    fn test_lossy_utf16_replaces_lone_surrogates() {
        // 'a', lone high surrogate, 'b'
        let bytes = [0x61, 0x00, 0x00, 0xD8, 0x62, 0x00];
        assert_eq!(decode_utf16_lossy(&bytes).unwrap(), "a\u{FFFD}b");
        assert!(decode_utf16_lossy(&[0x41]).is_err());
    }

    #[test]
    fn test_read_bytes_advances() {
        let data = [1u8, 2, 3, 4];
        let mut cursor = &data[..];
        assert_eq!(read_bytes(&mut cursor, 3), Progress::Ready(&data[..3]));
        assert_eq!(read_bytes(&mut cursor, 2), Progress::NeedMoreData);
        assert_eq!(read_u8(&mut cursor), Progress::Ready(4));
    }

    #[test]
    fn test_utf16_byte_len() {
        assert_eq!(utf16_byte_len("Hello"), 10);
        assert_eq!(utf16_byte_len("世界"), 4);
    }
}
