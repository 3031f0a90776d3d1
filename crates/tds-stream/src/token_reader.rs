//! Pull-based token reader.
//!
//! [`TokenReader`] decodes one token per [`move_next`](TokenReader::move_next)
//! call from a payload [`ByteSource`], usually a
//! [`MessageReader`](crate::MessageReader). Token bodies are decoded by the
//! resumable decoders in `tds-wire`; when a body is incomplete the reader
//! waits for more bytes and decodes again from the start of the body.
//!
//! Row tokens carry no length. The reader only records that a row is current;
//! its values are read by a [`ResultSetReader`](crate::ResultSetReader) or
//! skipped on the next call to `move_next`.

use std::sync::Arc;

use tds_wire::{ColMetaData, Progress, ProtocolError, Token, TokenType, Validation};

use crate::buffered::ByteSource;
use crate::error::StreamError;
use crate::value::skip_value;

/// Decodes response tokens one at a time.
///
/// After any error the reader is poisoned: the stream position is no longer
/// known and every later call fails with [`StreamError::InvalidState`].
#[derive(Debug)]
pub struct TokenReader<S> {
    pub(crate) source: S,
    validation: Validation,
    current: Option<Token>,
    /// Tag read from the stream whose body is not decoded yet.
    pending: Option<TokenType>,
    metadata: Option<Arc<ColMetaData>>,
    /// Next unread column of the current row.
    pub(crate) row_column: Option<usize>,
    pub(crate) failed: bool,
}

impl<S: ByteSource> TokenReader<S> {
    /// Create a reader over a payload stream.
    pub fn new(source: S, validation: Validation) -> Self {
        Self {
            source,
            validation,
            current: None,
            pending: None,
            metadata: None,
            row_column: None,
            failed: false,
        }
    }

    /// Decode the next token and make it current.
    ///
    /// Any unread values of a current row are skipped first. Cancelling the
    /// returned future between tokens is safe; cancelling it mid-token leaves
    /// the reader resumable only while the remembered tag is kept.
    pub async fn move_next(&mut self) -> Result<&Token, StreamError> {
        if self.failed {
            return Err(StreamError::InvalidState("token reader failed earlier"));
        }
        if let Err(e) = self.read_token().await {
            self.failed = true;
            self.current = None;
            return Err(e);
        }
        self.current
            .as_ref()
            .ok_or(StreamError::InvalidState("no current token"))
    }

    /// The token decoded by the last successful [`move_next`](Self::move_next).
    #[must_use]
    pub fn current(&self) -> Option<&Token> {
        self.current.as_ref()
    }

    /// Metadata of the most recent result set.
    #[must_use]
    pub fn metadata(&self) -> Option<&Arc<ColMetaData>> {
        self.metadata.as_ref()
    }

    /// Whether an earlier error poisoned the reader.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Get a reference to the payload source.
    pub fn get_ref(&self) -> &S {
        &self.source
    }

    /// Consume the reader, returning the payload source.
    pub fn into_inner(self) -> S {
        self.source
    }

    async fn read_token(&mut self) -> Result<(), StreamError> {
        self.skip_row().await?;
        self.current = None;

        let token_type = match self.pending {
            Some(token_type) => token_type,
            None => {
                let tag = self.source.read_at_least(1).await?[0];
                let token_type =
                    TokenType::from_u8(tag).ok_or(ProtocolError::InvalidTokenType(tag))?;
                self.source.advance(1)?;
                self.pending = Some(token_type);
                token_type
            }
        };

        let token = loop {
            let available = self.source.buffer();
            let have = available.len();
            match Token::decode_body(token_type, available, self.validation)? {
                Progress::Ready((token, consumed)) => {
                    self.source.advance(consumed)?;
                    break token;
                }
                Progress::NeedMoreData => {
                    let capacity = self.source.capacity();
                    if have >= capacity {
                        return Err(StreamError::ValueTooLarge {
                            len: have + 1,
                            capacity,
                        });
                    }
                    self.source.fill(have + 1).await?;
                }
            }
        };
        self.pending = None;

        match &token {
            Token::ColMetaData(metadata) => {
                self.metadata = Some(Arc::clone(metadata));
            }
            Token::Row => {
                if self.metadata.is_none() {
                    return Err(ProtocolError::MalformedToken {
                        token: "ROW",
                        reason: "row before column metadata".into(),
                    }
                    .into());
                }
                self.row_column = Some(0);
            }
            Token::EnvChange(env) => {
                tracing::debug!(
                    change_type = ?env.change_type,
                    new_value = ?env.new_value,
                    "environment change"
                );
            }
            _ => {}
        }

        tracing::trace!(token_type = ?token_type, "decoded token");
        self.current = Some(token);
        Ok(())
    }

    /// Skip whatever is left of the current row.
    async fn skip_row(&mut self) -> Result<(), StreamError> {
        let (Some(start), Some(metadata)) = (self.row_column, self.metadata.clone()) else {
            return Ok(());
        };
        for (index, column) in metadata.columns.iter().enumerate().skip(start) {
            skip_value(&mut self.source, &column.data_type).await?;
            self.row_column = Some(index + 1);
        }
        self.row_column = None;
        Ok(())
    }
}
