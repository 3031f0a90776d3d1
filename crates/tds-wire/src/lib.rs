//! # tds-wire
//!
//! IO-agnostic building blocks of the MS-TDS (Tabular Data Stream) protocol
//! spoken by SQL Server compatible databases.
//!
//! The crate covers the parts of the protocol that can be expressed as pure
//! functions over byte slices:
//!
//! - the fixed 8-byte packet header ([`PacketHeader`])
//! - the data type table and its length encodings ([`TypeId`], [`LengthKind`])
//! - resumable decoding of response token bodies ([`Token`])
//! - SQL batch and RPC request payloads ([`encode_sql_batch`], [`RpcRequest`])
//!
//! ## Resumable decoding
//!
//! Decoders never fail because data is missing. Every decoder returns a
//! [`Progress`] inside a `Result`: `Ok(Progress::Ready(..))` when the value was
//! complete, `Ok(Progress::NeedMoreData)` when the caller should retry with
//! more bytes, and `Err(..)` only for bytes that can never form a valid value.
//! Callers re-run the decoder from the start of the token once more bytes are
//! buffered, so no partial state has to be carried between attempts.
//!
//! ```rust
//! use tds_wire::{Progress, Token, TokenType, Validation};
//!
//! // DONE body: status, current command, row count.
//! let body = [0x10, 0x00, 0xC1, 0x00, 0x03, 0, 0, 0, 0, 0, 0, 0];
//!
//! let partial = Token::decode_body(TokenType::Done, &body[..5], Validation::Lenient).unwrap();
//! assert!(matches!(partial, Progress::NeedMoreData));
//!
//! let Progress::Ready((token, consumed)) =
//!     Token::decode_body(TokenType::Done, &body, Validation::Lenient).unwrap()
//! else {
//!     unreachable!()
//! };
//! assert_eq!(consumed, 12);
//! assert!(matches!(token, Token::Done(done) if done.row_count == 3));
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

/// Unwraps a [`Progress::Ready`] value or returns `Ok(Progress::NeedMoreData)`
/// from the enclosing function.
macro_rules! ready {
    ($e:expr) => {
        match $e {
            $crate::codec::Progress::Ready(value) => value,
            $crate::codec::Progress::NeedMoreData => {
                return Ok($crate::codec::Progress::NeedMoreData);
            }
        }
    };
}

pub mod codec;
pub mod error;
pub mod packet;
pub mod rpc;
pub mod sql_batch;
pub mod token;
pub mod types;

pub use codec::Progress;
pub use error::ProtocolError;
pub use packet::{
    DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, MIN_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader,
    PacketStatus, PacketType, Validation,
};
pub use rpc::{ParamFlags, ProcId, RpcOptions, RpcParam, RpcRequest, TypeInfo};
pub use sql_batch::{encode_sql_batch, encode_sql_batch_with_transaction};
pub use token::{
    ColMetaData, ColumnData, Done, DoneStatus, EnvChange, EnvChangeType, EnvChangeValue, LoginAck,
    ServerMessage, Token, TokenType,
};
pub use types::{ColumnFlags, DataType, LengthKind, TypeId, Updateable};
