//! Reading the response to a written command.

use std::time::Duration;

use tds_stream::{BufferedReader, MessageReader, ResultSetReader};
use tds_wire::Token;
use tokio::io::ReadHalf;

use crate::command::CommandExecution;
use crate::connection::{Inbound, ReadTurn, Transport};
use crate::error::PoolError;
use crate::slot::{OperationSlot, SlotState};

/// Row reader over a pooled connection.
pub type RowReader<'a, T> = ResultSetReader<'a, MessageReader<BufferedReader<ReadHalf<T>>>>;

/// A written command waiting for its response.
///
/// Dropping the context without reading the response marks the connection
/// broken.
pub struct CommandContext<'a, T: Transport> {
    slot: &'a mut OperationSlot<T>,
    execution: CommandExecution,
    turn: ReadTurn<T>,
    timeout: Duration,
}

impl<'a, T: Transport> CommandContext<'a, T> {
    pub(crate) fn new(
        slot: &'a mut OperationSlot<T>,
        execution: CommandExecution,
        turn: ReadTurn<T>,
        timeout: Duration,
    ) -> Self {
        Self {
            slot,
            execution,
            turn,
            timeout,
        }
    }

    /// Execution state of the command.
    #[must_use]
    pub fn execution(&self) -> &CommandExecution {
        &self.execution
    }

    /// Wait for the response.
    ///
    /// Waits until every response queued before this one has been read, then
    /// for the first token of this one. The command timeout starts once this
    /// command's turn to read has come, so a slow reader ahead in the queue
    /// does not expire it. On timeout the connection is marked broken, since
    /// the response may still arrive later.
    pub async fn response(self) -> Result<ResponseReader<'a, T>, PoolError> {
        let Self {
            slot,
            execution,
            mut turn,
            timeout,
        } = self;

        let first = match turn.acquire().await {
            Ok(mut tokens) => {
                let read = tokio::time::timeout(timeout, tokens.move_next())
                    .await
                    .map(|token| token.map(|_| ()));
                read.map(|token| token.map(|()| tokens).map_err(PoolError::from))
            }
            Err(e) => Ok(Err(e)),
        };

        match first {
            Ok(Ok(tokens)) => Ok(ResponseReader {
                slot,
                execution,
                turn: Some(turn),
                tokens: Some(tokens),
                peeked: true,
                in_result_set: false,
            }),
            Ok(Err(e)) => {
                slot.state = SlotState::Faulted;
                slot.connection.mark_broken();
                Err(e)
            }
            Err(_) => {
                tracing::warn!(
                    connection_id = slot.connection.id(),
                    timeout = ?timeout,
                    "command timed out"
                );
                slot.state = SlotState::Faulted;
                slot.connection.mark_broken();
                Err(PoolError::CommandTimeout(timeout))
            }
        }
    }
}

impl<T: Transport> std::fmt::Debug for CommandContext<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandContext")
            .field("slot", &self.slot)
            .field("execution", &self.execution)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Reads one command's response in order.
///
/// The next queued command on the connection can only read its response
/// after this one reached its final DONE. Dropping an unfinished reader marks
/// the connection broken and fails every command queued behind it.
pub struct ResponseReader<'a, T: Transport> {
    slot: &'a mut OperationSlot<T>,
    execution: CommandExecution,
    turn: Option<ReadTurn<T>>,
    tokens: Option<Inbound<T>>,
    /// The current token was read but not returned yet.
    peeked: bool,
    /// A row reader was handed out and its tokens are not observed yet.
    in_result_set: bool,
}

impl<T: Transport> ResponseReader<'_, T> {
    /// Execution state collected so far.
    #[must_use]
    pub fn execution(&self) -> &CommandExecution {
        &self.execution
    }

    /// Whether the final DONE has been read.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.slot.state == SlotState::Completed
    }

    /// Next token of the response, or `None` after the final DONE.
    ///
    /// Row values are skipped; use [`next_result_set`](Self::next_result_set)
    /// to read them.
    pub async fn next_token(&mut self) -> Result<Option<Token>, PoolError> {
        if self.is_finished() {
            return Ok(None);
        }
        let result = self.advance().await;
        if result.is_err() {
            self.fault();
        }
        result
    }

    /// Move to the next result set, skipping the tokens in between.
    ///
    /// Returns `None` once the response is complete. Rows left unread in a
    /// previous result set are skipped.
    pub async fn next_result_set(&mut self) -> Result<Option<RowReader<'_, T>>, PoolError> {
        loop {
            match self.next_token().await? {
                None => return Ok(None),
                Some(Token::ColMetaData(metadata)) if !metadata.is_empty() => break,
                Some(_) => {}
            }
        }
        self.in_result_set = true;
        let tokens = self.tokens.as_mut().ok_or(PoolError::ConnectionBroken)?;
        Ok(Some(ResultSetReader::new(&mut **tokens)?))
    }

    /// Read the rest of the response.
    ///
    /// Fails with [`PoolError::Server`] carrying the first error message if
    /// the server reported any; the connection stays usable in that case.
    pub async fn drain(mut self) -> Result<CommandExecution, PoolError> {
        while self.next_token().await?.is_some() {}
        let execution = std::mem::take(&mut self.execution);
        match execution.errors().first() {
            Some(error) => Err(PoolError::Server(error.clone())),
            None => Ok(execution),
        }
    }

    async fn advance(&mut self) -> Result<Option<Token>, PoolError> {
        self.leave_result_set().await?;
        if self.is_finished() {
            return Ok(None);
        }
        let tokens = self.tokens.as_mut().ok_or(PoolError::ConnectionBroken)?;
        let token = if std::mem::take(&mut self.peeked) {
            tokens
                .current()
                .cloned()
                .ok_or(PoolError::ConnectionBroken)?
        } else {
            tokens.move_next().await?.clone()
        };
        self.observe(&token);
        Ok(Some(token))
    }

    /// Account for the tokens a row reader consumed.
    async fn leave_result_set(&mut self) -> Result<(), PoolError> {
        if !std::mem::take(&mut self.in_result_set) {
            return Ok(());
        }
        let tokens = self.tokens.as_mut().ok_or(PoolError::ConnectionBroken)?;
        let mut token = tokens.current().cloned();
        loop {
            match token {
                Some(ref done) if done.as_done().is_some() => {
                    self.observe(done);
                    return Ok(());
                }
                Some(Token::Row | Token::ColMetaData(_)) | None => {}
                Some(ref other) => self.observe(other),
            }
            let tokens = self.tokens.as_mut().ok_or(PoolError::ConnectionBroken)?;
            token = Some(tokens.move_next().await?.clone());
        }
    }

    fn observe(&mut self, token: &Token) {
        match token {
            Token::Info(message) => self.execution.record_info(message),
            Token::Error(message) => self.execution.record_error(message),
            Token::EnvChange(env) => {
                if let Some(size) = env.packet_size() {
                    self.slot.connection.renegotiate_packet_size(size);
                }
            }
            Token::ColMetaData(metadata) if !metadata.is_empty() => {
                self.execution.record_result_set();
            }
            Token::ReturnStatus(status) => self.execution.record_return_status(*status),
            Token::Done(done) | Token::DoneProc(done) => {
                let last = done.is_final();
                self.execution.record_done(done, last);
                if last {
                    self.finish();
                }
            }
            Token::DoneInProc(done) => self.execution.record_done(done, false),
            _ => {}
        }
    }

    /// Hand the connection's reader to the next queued command.
    fn finish(&mut self) {
        self.slot.state = SlotState::Completed;
        if let (Some(turn), Some(tokens)) = (self.turn.take(), self.tokens.take()) {
            turn.release(tokens);
        }
        tracing::trace!(
            connection_id = self.slot.connection.id(),
            rows_affected = ?self.execution.rows_affected(),
            "response complete"
        );
    }

    /// Observe the DONE a row reader stopped on without reading further.
    ///
    /// A row reader read to the end of the last result set leaves the final
    /// DONE current; observing it hands the turn on.
    fn settle_result_set(&mut self) {
        if !self.in_result_set {
            return;
        }
        let done = self
            .tokens
            .as_ref()
            .filter(|tokens| !tokens.is_failed())
            .and_then(|tokens| tokens.current())
            .filter(|token| token.as_done().is_some())
            .cloned();
        if let Some(done) = done {
            self.in_result_set = false;
            self.observe(&done);
        }
    }

    fn fault(&mut self) {
        self.slot.state = SlotState::Faulted;
        self.slot.connection.mark_broken();
        self.tokens = None;
        self.turn = None;
    }
}

impl<T: Transport> Drop for ResponseReader<'_, T> {
    fn drop(&mut self) {
        self.settle_result_set();
        if self.slot.state == SlotState::Active {
            tracing::debug!(
                connection_id = self.slot.connection.id(),
                "response dropped before completion"
            );
            self.fault();
        }
    }
}

impl<T: Transport> std::fmt::Debug for ResponseReader<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseReader")
            .field("slot", &self.slot)
            .field("execution", &self.execution)
            .field("in_result_set", &self.in_result_set)
            .finish_non_exhaustive()
    }
}
