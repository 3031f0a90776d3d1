//! Commands and their execution state.

use std::time::Duration;

use bitflags::bitflags;
use bytes::Bytes;
use tds_wire::{Done, PacketStatus, PacketType, RpcParam, RpcRequest, ServerMessage};

use crate::error::PoolError;

bitflags! {
    /// Session handling requested for a command.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct ExecutionFlags: u8 {
        /// Reset the session before the command runs.
        const RESET_CONNECTION = 0x01;
        /// Reset the session but keep the open transaction.
        const RESET_CONNECTION_SKIP_TRANSACTION = 0x02;
    }
}

impl ExecutionFlags {
    /// Status of the first packet of the request.
    pub(crate) fn packet_status(self) -> Result<PacketStatus, PoolError> {
        if self.contains(Self::RESET_CONNECTION | Self::RESET_CONNECTION_SKIP_TRANSACTION) {
            return Err(PoolError::InvalidCommand(
                "reset-connection flags are mutually exclusive".into(),
            ));
        }
        let mut status = PacketStatus::NORMAL;
        if self.contains(Self::RESET_CONNECTION) {
            status |= PacketStatus::RESET_CONNECTION;
        }
        if self.contains(Self::RESET_CONNECTION_SKIP_TRANSACTION) {
            status |= PacketStatus::RESET_CONNECTION_KEEP_TRANSACTION;
        }
        Ok(status)
    }
}

/// What a command sends to the server.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub struct CommandValues {
    /// Statement text.
    pub statement: String,
    /// Session handling flags.
    pub flags: ExecutionFlags,
    /// Bound on waiting for the first response token; the pool default when
    /// `None`.
    pub timeout: Option<Duration>,
    /// Parameters; a non-empty list sends the statement through
    /// `sp_executesql`.
    pub parameters: Vec<RpcParam>,
}

impl CommandValues {
    /// A statement without parameters.
    pub fn new(statement: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            flags: ExecutionFlags::empty(),
            timeout: None,
            parameters: Vec::new(),
        }
    }

    /// Add a parameter.
    #[must_use]
    pub fn param(mut self, param: RpcParam) -> Self {
        self.parameters.push(param);
        self
    }

    /// Set the session handling flags.
    #[must_use]
    pub fn flags(mut self, flags: ExecutionFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the command timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Encode the request payload.
    pub(crate) fn encode(&self) -> Result<(PacketType, Bytes), PoolError> {
        if self.parameters.is_empty() {
            return Ok((
                PacketType::SqlBatch,
                tds_wire::encode_sql_batch(&self.statement),
            ));
        }
        let request = RpcRequest::execute_sql(&self.statement, self.parameters.clone());
        let payload = request
            .encode()
            .map_err(|e| PoolError::InvalidCommand(e.to_string()))?;
        Ok((PacketType::Rpc, payload))
    }
}

/// Something that can be written to a slot.
pub trait Command: Send + Sync {
    /// Statement, flags, timeout and parameters to send.
    fn values(&self) -> CommandValues;

    /// Create the state that collects the response.
    ///
    /// Called before any request bytes are written.
    fn begin_execution(&self, values: &CommandValues) -> CommandExecution {
        CommandExecution::new(&values.statement)
    }
}

impl Command for CommandValues {
    fn values(&self) -> CommandValues {
        self.clone()
    }
}

impl Command for str {
    fn values(&self) -> CommandValues {
        CommandValues::new(self)
    }
}

impl Command for String {
    fn values(&self) -> CommandValues {
        CommandValues::new(self.as_str())
    }
}

/// Outcome of a command as its response is read.
#[derive(Debug, Clone, Default)]
pub struct CommandExecution {
    statement: String,
    messages: Vec<ServerMessage>,
    errors: Vec<ServerMessage>,
    rows_affected: Option<u64>,
    result_sets: usize,
    return_status: Option<i32>,
    completed: bool,
}

impl CommandExecution {
    /// Start tracking a command.
    pub fn new(statement: &str) -> Self {
        Self {
            statement: statement.to_owned(),
            ..Self::default()
        }
    }

    /// The statement this execution belongs to.
    #[must_use]
    pub fn statement(&self) -> &str {
        &self.statement
    }

    /// Informational messages, in arrival order.
    #[must_use]
    pub fn messages(&self) -> &[ServerMessage] {
        &self.messages
    }

    /// Errors reported by the server, in arrival order.
    #[must_use]
    pub fn errors(&self) -> &[ServerMessage] {
        &self.errors
    }

    /// Sum of the row counts the server marked valid, if any was.
    #[must_use]
    pub fn rows_affected(&self) -> Option<u64> {
        self.rows_affected
    }

    /// Result sets seen so far.
    #[must_use]
    pub fn result_sets(&self) -> usize {
        self.result_sets
    }

    /// Status returned by a stored procedure.
    #[must_use]
    pub fn return_status(&self) -> Option<i32> {
        self.return_status
    }

    /// Whether the final DONE has been read.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub(crate) fn record_info(&mut self, message: &ServerMessage) {
        self.messages.push(message.clone());
    }

    pub(crate) fn record_error(&mut self, message: &ServerMessage) {
        tracing::debug!(number = message.number, class = message.class, "server error");
        self.errors.push(message.clone());
    }

    pub(crate) fn record_result_set(&mut self) {
        self.result_sets += 1;
    }

    pub(crate) fn record_return_status(&mut self, status: i32) {
        self.return_status = Some(status);
    }

    pub(crate) fn record_done(&mut self, done: &Done, last: bool) {
        if let Some(count) = done.rows_affected() {
            self.rows_affected = Some(self.rows_affected.unwrap_or(0) + count);
        }
        if last {
            self.completed = true;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tds_wire::DoneStatus;

    #[test]
    fn test_flags_to_packet_status() {
        assert_eq!(
            ExecutionFlags::empty().packet_status().unwrap(),
            PacketStatus::NORMAL
        );
        assert_eq!(
            ExecutionFlags::RESET_CONNECTION.packet_status().unwrap(),
            PacketStatus::RESET_CONNECTION
        );
        assert_eq!(
            ExecutionFlags::RESET_CONNECTION_SKIP_TRANSACTION
                .packet_status()
                .unwrap(),
            PacketStatus::RESET_CONNECTION_KEEP_TRANSACTION
        );
        assert!(matches!(
            ExecutionFlags::all().packet_status(),
            Err(PoolError::InvalidCommand(_))
        ));
    }

    #[test]
    fn test_batch_or_rpc_encoding() {
        let (packet_type, payload) = CommandValues::new("SELECT 1").encode().unwrap();
        assert_eq!(packet_type, PacketType::SqlBatch);
        assert_eq!(payload, tds_wire::encode_sql_batch("SELECT 1"));

        let values = CommandValues::new("SELECT @p1").param(RpcParam::int("@p1", 7));
        let (packet_type, _) = values.encode().unwrap();
        assert_eq!(packet_type, PacketType::Rpc);
    }

    #[test]
    fn test_command_impls() {
        assert_eq!("SELECT 1".values().statement, "SELECT 1");
        assert_eq!(String::from("SELECT 2").values().statement, "SELECT 2");

        let values = CommandValues::new("x")
            .flags(ExecutionFlags::RESET_CONNECTION)
            .timeout(Duration::from_secs(3));
        assert_eq!(values.values(), values);
        let execution = values.begin_execution(&values);
        assert_eq!(execution.statement(), "x");
        assert!(!execution.is_completed());
    }

    #[test]
    fn test_execution_accumulates_counts() {
        let mut execution = CommandExecution::new("UPDATE t SET x = 1");
        let counted = |status, row_count| Done {
            status,
            cur_cmd: 0,
            row_count,
        };

        execution.record_done(&counted(DoneStatus::MORE | DoneStatus::COUNT, 3), false);
        execution.record_done(&counted(DoneStatus::MORE, 99), false);
        assert_eq!(execution.rows_affected(), Some(3));
        execution.record_done(&counted(DoneStatus::COUNT, 2), true);
        assert_eq!(execution.rows_affected(), Some(5));
        assert!(execution.is_completed());
    }
}
