//! # tds-stream
//!
//! Async packet framing, reassembly and response reading for TDS.
//!
//! This crate connects the IO-agnostic decoders of `tds-wire` to tokio byte
//! streams:
//!
//! ```text
//! AsyncRead  → BufferedReader → MessageReader → TokenReader → ResultSetReader
//! AsyncWrite ← BufferSink     ← MessageWriter ← request payloads
//! ```
//!
//! - [`BufferedReader`] is a fixed-capacity [`ByteSource`] over the socket.
//! - [`MessageReader`] strips packet headers so the token layer sees one
//!   continuous payload stream.
//! - [`TokenReader`] decodes one token per call, waiting for more bytes when a
//!   token is incomplete.
//! - [`ResultSetReader`] reads row values forward-only, skipping unread
//!   columns by their length encoding.
//! - [`MessageWriter`] splits outbound messages into packets of the
//!   negotiated size directly in the [`ByteSink`] buffer.
//!
//! ## Split IO
//!
//! [`split`] divides a transport into independent read and write sides so a
//! request can be written while an earlier response is still being read.
//!
//! ```rust,ignore
//! use tds_stream::{ReaderOptions, WriterOptions, split};
//!
//! let (mut tokens, mut writer) = split(stream, ReaderOptions::default(), WriterOptions::default())?;
//! writer.write_message(PacketType::SqlBatch, PacketStatus::NORMAL, &encode_sql_batch("SELECT 1"))?;
//! writer.flush().await?;
//! while tokens.move_next().await?.as_done().is_none() {}
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod buffered;
pub mod error;
pub mod options;
pub mod reader;
pub mod result_set;
pub mod sink;
pub mod token_reader;
pub mod value;
pub mod writer;

pub use buffered::{BufferedReader, ByteSource};
pub use error::StreamError;
pub use options::{DEFAULT_READ_BUFFER_SIZE, ReaderOptions, WriterOptions};
pub use reader::MessageReader;
pub use result_set::ResultSetReader;
pub use sink::{BufferSink, ByteSink};
pub use token_reader::TokenReader;
pub use value::FromColumn;
pub use writer::MessageWriter;

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};

/// Token reader over the read side of a transport.
pub type TdsReader<R> = TokenReader<MessageReader<BufferedReader<R>>>;

/// Message writer over the write side of a transport.
pub type TdsWriter<W> = MessageWriter<BufferSink<W>>;

/// Build the inbound stack over a reader.
pub fn token_reader<R>(reader: R, options: ReaderOptions) -> Result<TdsReader<R>, StreamError>
where
    R: AsyncRead + Unpin + Send,
{
    options.validate()?;
    let buffered = BufferedReader::with_capacity(options.buffer_size, reader);
    Ok(TokenReader::new(
        MessageReader::new(buffered, options.validation),
        options.validation,
    ))
}

/// Build the outbound stack over a writer.
pub fn message_writer<W>(writer: W, options: WriterOptions) -> Result<TdsWriter<W>, StreamError>
where
    W: AsyncWrite + Unpin + Send,
{
    MessageWriter::with_options(BufferSink::new(writer), options)
}

/// Split a transport into a token reader and a message writer.
pub fn split<T>(
    transport: T,
    reader_options: ReaderOptions,
    writer_options: WriterOptions,
) -> Result<(TdsReader<ReadHalf<T>>, TdsWriter<WriteHalf<T>>), StreamError>
where
    T: AsyncRead + AsyncWrite + Send,
{
    let (read_half, write_half) = tokio::io::split(transport);
    Ok((
        token_reader(read_half, reader_options)?,
        message_writer(write_half, writer_options)?,
    ))
}
