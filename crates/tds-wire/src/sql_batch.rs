//! SQL batch request encoding.
//!
//! A SQL batch payload (packet type 0x01) is the `ALL_HEADERS` section
//! followed by the statement text as UTF-16LE.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{utf16_byte_len, write_utf16_string};

/// Size of `ALL_HEADERS` carrying a single transaction descriptor header.
pub const ALL_HEADERS_SIZE: usize = 22;

const TRANSACTION_DESCRIPTOR_HEADER: u16 = 0x0002;
const TRANSACTION_DESCRIPTOR_HEADER_SIZE: u32 = 18;

/// Write the `ALL_HEADERS` section with a transaction descriptor header.
///
/// The outstanding request count is always 1: each request on a connection
/// is written as one message and its response is read to completion before
/// the next one is interpreted.
pub(crate) fn write_all_headers(dst: &mut impl BufMut, transaction_descriptor: u64) {
    dst.put_u32_le(ALL_HEADERS_SIZE as u32);
    dst.put_u32_le(TRANSACTION_DESCRIPTOR_HEADER_SIZE);
    dst.put_u16_le(TRANSACTION_DESCRIPTOR_HEADER);
    dst.put_u64_le(transaction_descriptor);
    dst.put_u32_le(1);
}

/// Encode a SQL batch in auto-commit mode.
///
/// Returns the message payload without packet headers.
///
/// # Example
///
/// ```
/// use tds_wire::sql_batch::{ALL_HEADERS_SIZE, encode_sql_batch};
///
/// let payload = encode_sql_batch("SELECT 1");
/// assert_eq!(payload.len(), ALL_HEADERS_SIZE + 16);
/// ```
#[must_use]
pub fn encode_sql_batch(sql: &str) -> Bytes {
    encode_sql_batch_with_transaction(sql, 0)
}

/// Encode a SQL batch inside an explicit transaction.
///
/// `transaction_descriptor` is the value the server returned in its
/// begin-transaction environment change, or 0 for auto-commit.
#[must_use]
pub fn encode_sql_batch_with_transaction(sql: &str, transaction_descriptor: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(ALL_HEADERS_SIZE + utf16_byte_len(sql));
    write_all_headers(&mut buf, transaction_descriptor);
    write_utf16_string(&mut buf, sql);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_sql_batch() {
        let payload = encode_sql_batch("SELECT 1");
        assert_eq!(payload.len(), 38);

        assert_eq!(&payload[0..4], &[22, 0, 0, 0]);
        assert_eq!(&payload[4..8], &[18, 0, 0, 0]);
        assert_eq!(&payload[8..10], &[0x02, 0x00]);
        assert_eq!(&payload[10..18], &[0; 8]);
        assert_eq!(&payload[18..22], &[1, 0, 0, 0]);
        assert_eq!(&payload[22..26], &[b'S', 0, b'E', 0]);
    }

    #[test]
    fn test_transaction_descriptor() {
        let payload = encode_sql_batch_with_transaction("COMMIT", 0x0102_0304_0506_0708);
        assert_eq!(&payload[10..18], &[8, 7, 6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn test_empty_batch() {
        assert_eq!(encode_sql_batch("").len(), ALL_HEADERS_SIZE);
    }
}
