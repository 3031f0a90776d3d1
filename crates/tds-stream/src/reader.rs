//! Inbound message reassembly.
//!
//! [`MessageReader`] sits on top of a raw [`ByteSource`] and is itself a
//! [`ByteSource`] whose window contains payload bytes only. Packet headers are
//! excised in place as they are reached, so the token decoder sees one
//! continuous stream no matter how the server split it.
//!
//! ```text
//! raw window:      [ logical bytes | rest of payload | hdr | payload ... ]
//!                   \____________/
//!                   exposed window
//! ```
//!
//! When the walk reaches a complete header, the logical bytes are moved right
//! over it and the raw source is advanced past the gap.
//!
//! Consecutive messages are presented back to back; a response ends at its
//! final DONE token, which the end-of-message flag of its last packet
//! mirrors. Strict validation only accepts tabular result packets.

use tds_wire::{PACKET_HEADER_SIZE, PacketHeader, PacketType, ProtocolError, Validation};

use crate::buffered::ByteSource;
use crate::error::StreamError;

/// Presents a packetized byte stream as a contiguous payload stream.
#[derive(Debug)]
pub struct MessageReader<S> {
    source: S,
    validation: Validation,
    /// Payload bytes at the front of the raw window.
    logical_len: usize,
    /// Payload bytes of the current packet not yet walked over.
    payload_remaining: usize,
    logical_consumed: u64,
    raw_consumed: u64,
    packets: u64,
    messages: u64,
}

impl<S: ByteSource> MessageReader<S> {
    /// Create a reassembler positioned at a packet boundary.
    pub fn new(source: S, validation: Validation) -> Self {
        Self {
            source,
            validation,
            logical_len: 0,
            payload_remaining: 0,
            logical_consumed: 0,
            raw_consumed: 0,
            packets: 0,
            messages: 0,
        }
    }

    /// Payload bytes consumed so far.
    #[must_use]
    pub fn logical_consumed(&self) -> u64 {
        self.logical_consumed
    }

    /// Raw bytes consumed so far, headers included.
    #[must_use]
    pub fn raw_consumed(&self) -> u64 {
        self.raw_consumed
    }

    /// Packets whose header has been processed.
    #[must_use]
    pub fn packets(&self) -> u64 {
        self.packets
    }

    /// Messages whose end-of-message packet has been processed.
    #[must_use]
    pub fn messages(&self) -> u64 {
        self.messages
    }

    /// Get a reference to the raw source.
    pub fn get_ref(&self) -> &S {
        &self.source
    }

    /// Consume the reassembler, returning the raw source.
    pub fn into_inner(self) -> S {
        self.source
    }

    /// Extend the logical region over everything already buffered.
    ///
    /// Stops without error when the raw window ends inside a header or a
    /// payload; the next fill resumes from the recorded position.
    fn walk(&mut self) -> Result<(), StreamError> {
        loop {
            let buffered = self.source.buffer().len();
            if self.payload_remaining > 0 {
                let take = self.payload_remaining.min(buffered - self.logical_len);
                self.logical_len += take;
                self.payload_remaining -= take;
                if self.payload_remaining > 0 {
                    return Ok(());
                }
            }

            let Some(header) =
                PacketHeader::try_parse(&self.source.buffer()[self.logical_len..], self.validation)?
            else {
                return Ok(());
            };
            if self.validation.is_strict() && header.packet_type != PacketType::TabularResult {
                return Err(ProtocolError::UnexpectedPacketType(header.packet_type).into());
            }

            self.source
                .buffer_mut()
                .copy_within(..self.logical_len, PACKET_HEADER_SIZE);
            self.source.advance(PACKET_HEADER_SIZE)?;
            self.raw_consumed += PACKET_HEADER_SIZE as u64;
            self.payload_remaining = header.payload_length();
            self.packets += 1;
            if header.is_end_of_message() {
                self.messages += 1;
            }

            tracing::trace!(
                packet_type = ?header.packet_type,
                length = header.length,
                packet_id = header.packet_id,
                is_eom = header.is_end_of_message(),
                messages = self.messages,
                "decoded TDS packet"
            );
        }
    }
}

impl<S: ByteSource> ByteSource for MessageReader<S> {
    async fn fill(&mut self, min: usize) -> Result<(), StreamError> {
        if min > self.capacity() {
            return Err(StreamError::InvalidArgument(format!(
                "requested {min} payload bytes from a buffer of {}",
                self.capacity()
            )));
        }

        loop {
            self.walk()?;
            if self.logical_len >= min {
                return Ok(());
            }
            // Either the raw window ends inside a payload or inside a header.
            let raw_needed = if self.payload_remaining > 0 {
                self.logical_len + self.payload_remaining.min(min - self.logical_len)
            } else {
                self.logical_len + PACKET_HEADER_SIZE
            };
            self.source.fill(raw_needed).await?;
        }
    }

    fn buffer(&self) -> &[u8] {
        &self.source.buffer()[..self.logical_len]
    }

    fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.source.buffer_mut()[..self.logical_len]
    }

    fn advance(&mut self, n: usize) -> Result<(), StreamError> {
        if n > self.logical_len {
            return Err(StreamError::InvalidArgument(format!(
                "cannot advance {n} bytes, {} available",
                self.logical_len
            )));
        }
        self.source.advance(n)?;
        self.logical_len -= n;
        self.logical_consumed += n as u64;
        self.raw_consumed += n as u64;
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.source.capacity() - PACKET_HEADER_SIZE
    }
}
