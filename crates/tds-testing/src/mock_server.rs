//! Scripted in-memory TDS server.
//!
//! The server speaks the request/response part of TDS over
//! [`tokio::io::duplex`] pipes: it reads SQL batch and RPC messages, looks up
//! a scripted response by statement text and writes it back as a tabular
//! result split into packets. Requests on one connection are answered
//! strictly in arrival order, as a real server does.
//!
//! ```rust,ignore
//! use tds_testing::{MockColumn, MockResponse, MockTdsServer, ScalarValue};
//!
//! let server = MockTdsServer::builder()
//!     .with_response(
//!         "SELECT id, name FROM users",
//!         MockResponse::rows(
//!             vec![MockColumn::int("id"), MockColumn::nvarchar("name", 50)],
//!             vec![vec![ScalarValue::Int(1), ScalarValue::String("Alice".into())]],
//!         ),
//!     )
//!     .build();
//!
//! let transport = server.connect();
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tds_wire::types::PLP_NULL;
use tds_wire::{
    DEFAULT_PACKET_SIZE, DoneStatus, PACKET_HEADER_SIZE, PacketHeader, PacketStatus, PacketType,
    Validation,
};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::broadcast;

use crate::tokens::{MockColumn, ScalarValue, TokenStreamBuilder, packetize};

/// Capacity of each direction of the in-memory pipe.
const DUPLEX_CAPACITY: usize = 256 * 1024;

/// Mock server errors.
#[derive(Debug, Error)]
pub enum MockServerError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The client sent something the server cannot interpret.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Result type for mock server operations.
pub type Result<T> = std::result::Result<T, MockServerError>;

/// A scripted response.
#[derive(Clone)]
pub enum MockResponse {
    /// One row with one column.
    Scalar(ScalarValue),

    /// A result set.
    Rows {
        /// Column definitions.
        columns: Vec<MockColumn>,
        /// Row values.
        rows: Vec<Vec<ScalarValue>>,
    },

    /// An ERROR token followed by a DONE with the error flag.
    Error {
        /// Error number.
        number: i32,
        /// Message text.
        message: String,
        /// Severity class.
        severity: u8,
    },

    /// A DONE with a row count.
    RowsAffected(u64),

    /// A pre-built token stream.
    Raw(Bytes),

    /// Another response sent after a delay.
    Delayed(Duration, Box<MockResponse>),

    /// Never answer; later requests on the connection are not answered either.
    Hang,
}

impl fmt::Debug for MockResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(v) => f.debug_tuple("Scalar").field(v).finish(),
            Self::Rows { columns, rows } => f
                .debug_struct("Rows")
                .field("columns", &columns.len())
                .field("rows", &rows.len())
                .finish(),
            Self::Error {
                number, severity, ..
            } => f
                .debug_struct("Error")
                .field("number", number)
                .field("severity", severity)
                .finish(),
            Self::RowsAffected(n) => f.debug_tuple("RowsAffected").field(n).finish(),
            Self::Raw(data) => f.debug_tuple("Raw").field(&data.len()).finish(),
            Self::Delayed(delay, inner) => {
                f.debug_tuple("Delayed").field(delay).field(inner).finish()
            }
            Self::Hang => f.write_str("Hang"),
        }
    }
}

impl MockResponse {
    /// Scalar `int` result.
    pub fn scalar_int(value: i32) -> Self {
        Self::Scalar(ScalarValue::Int(value))
    }

    /// Scalar `nvarchar(max)` result.
    pub fn scalar_string(value: impl Into<String>) -> Self {
        Self::Scalar(ScalarValue::String(value.into()))
    }

    /// Completion without rows.
    pub fn empty() -> Self {
        Self::RowsAffected(0)
    }

    /// Completion reporting `count` affected rows.
    pub fn affected(count: u64) -> Self {
        Self::RowsAffected(count)
    }

    /// Error with severity 16.
    pub fn error(number: i32, message: impl Into<String>) -> Self {
        Self::Error {
            number,
            message: message.into(),
            severity: 16,
        }
    }

    /// Result set.
    pub fn rows(columns: Vec<MockColumn>, rows: Vec<Vec<ScalarValue>>) -> Self {
        Self::Rows { columns, rows }
    }

    /// Send `self` after `delay`.
    #[must_use]
    pub fn delayed(self, delay: Duration) -> Self {
        Self::Delayed(delay, Box::new(self))
    }

    fn encode(&self) -> Option<Bytes> {
        let stream = match self {
            Self::Scalar(value) => TokenStreamBuilder::new()
                .col_metadata(&[value.column()])
                .row(std::slice::from_ref(value))
                .done(DoneStatus::COUNT, 1),
            Self::Rows { columns, rows } => {
                let mut stream = TokenStreamBuilder::new().col_metadata(columns);
                for row in rows {
                    stream = stream.row(row);
                }
                stream.done(DoneStatus::COUNT, rows.len() as u64)
            }
            Self::Error {
                number,
                message,
                severity,
            } => TokenStreamBuilder::new()
                .error(*number, *severity, message)
                .done(DoneStatus::ERROR, 0),
            Self::RowsAffected(count) => TokenStreamBuilder::new().done(DoneStatus::COUNT, *count),
            Self::Raw(data) => return Some(data.clone()),
            Self::Delayed(_, inner) => return inner.encode(),
            Self::Hang => return None,
        };
        Some(stream.build())
    }
}

/// A request as received by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockRequest {
    /// Connection number, starting at 0.
    pub connection: usize,
    /// Message type.
    pub packet_type: PacketType,
    /// Status of the first packet.
    pub status: PacketStatus,
    /// Statement text (the first parameter of an RPC).
    pub sql: String,
}

/// Server configuration.
#[derive(Debug)]
pub struct MockServerConfig {
    responses: HashMap<String, MockResponse>,
    default_response: MockResponse,
    packet_size: usize,
}

/// Builder for [`MockTdsServer`].
#[derive(Debug)]
pub struct MockServerBuilder {
    config: MockServerConfig,
}

impl MockServerBuilder {
    /// Builder with an empty script answering everything with `DONE`.
    pub fn new() -> Self {
        Self {
            config: MockServerConfig {
                responses: HashMap::new(),
                default_response: MockResponse::empty(),
                packet_size: DEFAULT_PACKET_SIZE,
            },
        }
    }

    /// Answer `sql` (compared case-insensitively, trimmed) with `response`.
    #[must_use]
    pub fn with_response(mut self, sql: impl Into<String>, response: MockResponse) -> Self {
        self.config
            .responses
            .insert(normalize(&sql.into()), response);
        self
    }

    /// Response for statements without a scripted answer.
    #[must_use]
    pub fn with_default_response(mut self, response: MockResponse) -> Self {
        self.config.default_response = response;
        self
    }

    /// Size of the packets responses are split into.
    #[must_use]
    pub fn with_packet_size(mut self, packet_size: usize) -> Self {
        self.config.packet_size = packet_size;
        self
    }

    /// Create the server.
    pub fn build(self) -> MockTdsServer {
        let (shutdown_tx, _) = broadcast::channel(1);
        MockTdsServer {
            config: Arc::new(self.config),
            shutdown_tx,
            state: Arc::new(ServerState::default()),
        }
    }
}

impl Default for MockServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct ServerState {
    open: AtomicUsize,
    opened: AtomicUsize,
    requests: Mutex<Vec<MockRequest>>,
}

/// In-memory TDS server handing out duplex transports.
#[derive(Debug)]
pub struct MockTdsServer {
    config: Arc<MockServerConfig>,
    shutdown_tx: broadcast::Sender<()>,
    state: Arc<ServerState>,
}

impl MockTdsServer {
    /// Start configuring a server.
    pub fn builder() -> MockServerBuilder {
        MockServerBuilder::new()
    }

    /// Open a connection and return the client end.
    pub fn connect(&self) -> DuplexStream {
        let (client, server) = tokio::io::duplex(DUPLEX_CAPACITY);
        let connection = self.state.opened.fetch_add(1, Ordering::SeqCst);
        self.state.open.fetch_add(1, Ordering::SeqCst);

        let config = Arc::clone(&self.config);
        let state = Arc::clone(&self.state);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                result = handle_connection(server, connection, &config, &state) => {
                    if let Err(e) = result {
                        tracing::debug!(connection, error = %e, "mock connection failed");
                    }
                }
                _ = shutdown_rx.recv() => {}
            }
            state.open.fetch_sub(1, Ordering::SeqCst);
        });

        client
    }

    /// Connections currently open.
    pub fn connection_count(&self) -> usize {
        self.state.open.load(Ordering::SeqCst)
    }

    /// Connections opened since the server was created.
    pub fn total_connections(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    /// Requests received so far, in arrival order.
    pub fn requests(&self) -> Vec<MockRequest> {
        self.state.requests.lock().clone()
    }

    /// Close all connections.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl Drop for MockTdsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn handle_connection(
    mut stream: DuplexStream,
    connection: usize,
    config: &MockServerConfig,
    state: &ServerState,
) -> Result<()> {
    let mut hung = false;
    loop {
        let message = match read_message(&mut stream).await {
            Ok(message) => message,
            Err(MockServerError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => return Err(e),
        };

        let sql = match message.packet_type {
            PacketType::SqlBatch => decode_sql_batch(&message.payload)?,
            PacketType::Rpc => decode_rpc_statement(&message.payload)?,
            PacketType::Attention => {
                let ack = TokenStreamBuilder::new().done(DoneStatus::ATTN, 0).build();
                write_response(&mut stream, &ack, config.packet_size).await?;
                continue;
            }
            other => {
                return Err(MockServerError::Protocol(format!(
                    "unexpected packet type {other:?}"
                )));
            }
        };

        tracing::trace!(connection, sql = %sql, "mock request");
        state.requests.lock().push(MockRequest {
            connection,
            packet_type: message.packet_type,
            status: message.status,
            sql: sql.clone(),
        });

        if hung {
            continue;
        }
        let response = find_response(&sql, config);
        if let MockResponse::Delayed(delay, _) = response {
            tokio::time::sleep(*delay).await;
        }
        match response.encode() {
            Some(payload) => write_response(&mut stream, &payload, config.packet_size).await?,
            None => hung = true,
        }
    }

    Ok(())
}

struct Message {
    packet_type: PacketType,
    status: PacketStatus,
    payload: Bytes,
}

async fn read_message(stream: &mut DuplexStream) -> Result<Message> {
    let mut payload = BytesMut::new();
    let mut first: Option<PacketHeader> = None;

    loop {
        let mut header_buf = [0u8; PACKET_HEADER_SIZE];
        stream.read_exact(&mut header_buf).await?;
        let header = PacketHeader::try_parse(&header_buf, Validation::Strict)
            .map_err(|e| MockServerError::Protocol(e.to_string()))?
            .ok_or_else(|| MockServerError::Protocol("short packet header".into()))?;

        let start = payload.len();
        payload.resize(start + header.payload_length(), 0);
        stream.read_exact(&mut payload[start..]).await?;

        let first = *first.get_or_insert(header);
        if header.is_end_of_message() {
            return Ok(Message {
                packet_type: first.packet_type,
                status: first.status,
                payload: payload.freeze(),
            });
        }
    }
}

async fn write_response(stream: &mut DuplexStream, payload: &[u8], packet_size: usize) -> Result<()> {
    let packets = packetize(PacketType::TabularResult, payload, packet_size);
    stream.write_all(&packets).await?;
    stream.flush().await?;
    Ok(())
}

fn find_response<'a>(sql: &str, config: &'a MockServerConfig) -> &'a MockResponse {
    config
        .responses
        .get(&normalize(sql))
        .unwrap_or(&config.default_response)
}

fn normalize(sql: &str) -> String {
    sql.trim().to_uppercase()
}

fn take<'a>(src: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
    if src.len() < len {
        return Err(MockServerError::Protocol(format!(
            "truncated request: wanted {len} bytes, {} left",
            src.len()
        )));
    }
    let (head, tail) = src.split_at(len);
    *src = tail;
    Ok(head)
}

fn take_u8(src: &mut &[u8]) -> Result<u8> {
    Ok(take(src, 1)?[0])
}

fn take_u16(src: &mut &[u8]) -> Result<u16> {
    let b = take(src, 2)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

fn take_u32(src: &mut &[u8]) -> Result<u32> {
    let b = take(src, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn take_u64(src: &mut &[u8]) -> Result<u64> {
    let b = take(src, 8)?;
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(b);
    Ok(u64::from_le_bytes(bytes))
}

fn skip_all_headers(src: &mut &[u8]) -> Result<()> {
    let total = take_u32(src)? as usize;
    take(src, total.saturating_sub(4))?;
    Ok(())
}

fn utf16_to_string(bytes: &[u8]) -> Result<String> {
    if bytes.len() % 2 != 0 {
        return Err(MockServerError::Protocol("odd UTF-16 length".into()));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|_| MockServerError::Protocol("invalid UTF-16".into()))
}

/// Extract the statement text of a SQL batch payload.
pub fn decode_sql_batch(payload: &[u8]) -> Result<String> {
    let mut cursor = payload;
    skip_all_headers(&mut cursor)?;
    utf16_to_string(cursor)
}

/// Extract the first (statement) parameter of an RPC payload.
pub fn decode_rpc_statement(payload: &[u8]) -> Result<String> {
    let mut cursor = payload;
    skip_all_headers(&mut cursor)?;

    let name_len = take_u16(&mut cursor)?;
    if name_len == 0xFFFF {
        take_u16(&mut cursor)?;
    } else {
        take(&mut cursor, usize::from(name_len) * 2)?;
    }
    take_u16(&mut cursor)?; // options

    let param_name_len = take_u8(&mut cursor)?;
    take(&mut cursor, usize::from(param_name_len) * 2)?;
    take_u8(&mut cursor)?; // status
    let type_id = take_u8(&mut cursor)?;
    if type_id != 0xE7 {
        return Err(MockServerError::Protocol(format!(
            "statement parameter has type 0x{type_id:02X}"
        )));
    }
    let max_length = take_u16(&mut cursor)?;
    take(&mut cursor, 5)?; // collation

    if max_length != 0xFFFF {
        let len = take_u16(&mut cursor)?;
        return utf16_to_string(take(&mut cursor, usize::from(len))?);
    }

    if take_u64(&mut cursor)? == PLP_NULL {
        return Ok(String::new());
    }
    let mut text = Vec::new();
    loop {
        let chunk = take_u32(&mut cursor)? as usize;
        if chunk == 0 {
            break;
        }
        text.extend_from_slice(take(&mut cursor, chunk)?);
    }
    utf16_to_string(&text)
}
