//! Forward-only row reading.

use std::sync::Arc;

use tds_wire::{ColMetaData, Done, Token};

use crate::buffered::ByteSource;
use crate::error::StreamError;
use crate::token_reader::TokenReader;
use crate::value::{FromColumn, read_value, skip_value};

/// Reads the rows of one result set.
///
/// Columns are forward-only within a row: reading column `k` skips every
/// unread column before it, and asking for a column that was already passed
/// fails with [`StreamError::InvalidOperation`]. Unread columns are skipped
/// when moving to the next row.
///
/// ```rust,ignore
/// let mut rows = ResultSetReader::new(&mut tokens)?;
/// while rows.move_to_next_row().await? {
///     let id: i32 = rows.get(None).await?;
///     let name: Option<String> = rows.get(Some(2)).await?;
/// }
/// ```
#[derive(Debug)]
pub struct ResultSetReader<'a, S> {
    reader: &'a mut TokenReader<S>,
    metadata: Arc<ColMetaData>,
    done: Option<Done>,
    on_row: bool,
}

impl<'a, S: ByteSource> ResultSetReader<'a, S> {
    /// Bind to the most recent column metadata of `reader`.
    ///
    /// If the reader is positioned on a row, that row is current.
    pub fn new(reader: &'a mut TokenReader<S>) -> Result<Self, StreamError> {
        if reader.is_failed() {
            return Err(StreamError::InvalidState("token reader failed earlier"));
        }
        let metadata = reader
            .metadata()
            .cloned()
            .ok_or_else(|| StreamError::InvalidOperation("no column metadata was received".into()))?;
        let on_row = matches!(reader.current(), Some(Token::Row));
        Ok(Self {
            reader,
            metadata,
            done: None,
            on_row,
        })
    }

    /// Column metadata of this result set.
    #[must_use]
    pub fn metadata(&self) -> &ColMetaData {
        &self.metadata
    }

    /// Completion record, once the end of the result set was reached.
    #[must_use]
    pub fn done(&self) -> Option<&Done> {
        self.done.as_ref()
    }

    /// Move to the next row.
    ///
    /// Returns `false` at the DONE token ending the result set. Any other
    /// token is a protocol violation.
    pub async fn move_to_next_row(&mut self) -> Result<bool, StreamError> {
        if self.done.is_some() {
            return Ok(false);
        }
        self.on_row = false;
        let token = self.reader.move_next().await?;
        if let Some(done) = token.as_done() {
            self.done = Some(*done);
            return Ok(false);
        }
        match token {
            Token::Row => {
                self.on_row = true;
                Ok(true)
            }
            other => {
                let found = other.token_type();
                self.reader.failed = true;
                Err(StreamError::UnexpectedToken {
                    expected: "ROW or DONE",
                    found,
                })
            }
        }
    }

    /// Read a column of the current row.
    ///
    /// `None` reads the column after the last one read. A conversion the
    /// column type does not support fails with
    /// [`StreamError::UnsupportedConversion`] and leaves the column unread.
    pub async fn get<T: FromColumn>(&mut self, index: Option<usize>) -> Result<T, StreamError> {
        if self.reader.is_failed() {
            return Err(StreamError::InvalidState("token reader failed earlier"));
        }
        let next = match (self.on_row, self.reader.row_column) {
            (true, Some(next)) => next,
            _ => {
                return Err(StreamError::InvalidOperation(
                    "not positioned on a row".into(),
                ));
            }
        };
        let target = index.unwrap_or(next);
        if target < next {
            return Err(StreamError::InvalidOperation(format!(
                "column {target} was already read; columns are forward-only and the next is {next}"
            )));
        }
        let Some(column) = self.metadata.columns.get(target) else {
            return Err(StreamError::InvalidOperation(format!(
                "column {target} out of range for {} columns",
                self.metadata.len()
            )));
        };

        let data_type = column.data_type;
        let result = self.read_column(next, target, data_type).await;
        if matches!(&result, Err(e) if e.is_fatal()) {
            self.reader.failed = true;
        }
        result
    }

    async fn read_column<T: FromColumn>(
        &mut self,
        next: usize,
        target: usize,
        data_type: tds_wire::DataType,
    ) -> Result<T, StreamError> {
        for index in next..target {
            skip_value(&mut self.reader.source, &self.metadata.columns[index].data_type).await?;
            self.reader.row_column = Some(index + 1);
        }
        let value = read_value(&mut self.reader.source, &data_type).await?;
        self.reader.row_column = Some(target + 1);
        Ok(value)
    }

    /// Skip the remaining rows and return the completion record.
    pub async fn drain(&mut self) -> Result<Done, StreamError> {
        while self.move_to_next_row().await? {}
        self.done
            .ok_or(StreamError::InvalidState("result set ended without DONE"))
    }
}
