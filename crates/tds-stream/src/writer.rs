//! Outbound message framing.
//!
//! A [`MessageWriter`] turns one logical message of arbitrary length into
//! consecutive packets of the negotiated size. Payload is written directly
//! into the sink's buffer; once more than a packet's worth is present the
//! complete packets are framed in place and committed, and the remainder is
//! carried in a scratch buffer until more data arrives or the message ends.
//!
//! ```text
//! buffer():   [ 8 free | scratch | caller data ............................ ]
//! advance():  [ hdr | payload 0 ][ hdr | payload 1 ]  + remainder -> scratch
//! ```
//!
//! Headers are inserted by moving payloads right, last packet first, so no
//! payload byte is overwritten before it has been moved.

use tds_wire::{PACKET_HEADER_SIZE, PacketHeader, PacketStatus, PacketType};

use crate::error::StreamError;
use crate::options::{WriterOptions, validate_packet_size};
use crate::sink::ByteSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    NotStarted,
    Open,
    Closed,
}

/// Per-message header bookkeeping.
#[derive(Debug, Clone, Copy)]
struct Sequence {
    packet_type: PacketType,
    status: PacketStatus,
    next_id: u8,
    emitted: usize,
}

impl Sequence {
    fn header(&mut self, payload_len: usize, last: bool) -> PacketHeader {
        let mut status = PacketStatus::NORMAL;
        if self.emitted == 0 {
            status |= self.status & PacketStatus::RESET_FLAGS;
        }
        if last {
            status |= PacketStatus::END_OF_MESSAGE | (self.status & PacketStatus::IGNORE_EVENT);
        }
        // Packet sizes are capped at MAX_PACKET_SIZE, which fits a u16.
        let header = PacketHeader::new(
            self.packet_type,
            status,
            (PACKET_HEADER_SIZE + payload_len) as u16,
        )
        .with_packet_id(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.emitted += 1;
        header
    }
}

/// Splits logical messages into packets written to a [`ByteSink`].
///
/// ```text
/// NotStarted --start_message--> Open --end_message--> Closed --start_message--> Open ...
/// ```
#[derive(Debug)]
pub struct MessageWriter<S> {
    sink: S,
    packet_size: usize,
    state: State,
    seq: Sequence,
    /// Payload not yet framed; never more than one packet's worth.
    scratch: Vec<u8>,
    /// Size of the region handed out by the last `buffer` call.
    region_len: usize,
    /// Bytes the caller may still `advance` over.
    reserved: usize,
}

impl<S: ByteSink> MessageWriter<S> {
    /// Create a writer with the default packet size.
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            packet_size: WriterOptions::default().packet_size,
            state: State::NotStarted,
            seq: Sequence {
                packet_type: PacketType::SqlBatch,
                status: PacketStatus::NORMAL,
                next_id: 1,
                emitted: 0,
            },
            scratch: Vec::new(),
            region_len: 0,
            reserved: 0,
        }
    }

    /// Create a writer from options.
    pub fn with_options(sink: S, options: WriterOptions) -> Result<Self, StreamError> {
        options.validate()?;
        let mut writer = Self::new(sink);
        writer.packet_size = options.packet_size;
        Ok(writer)
    }

    /// The packet size, header included.
    #[must_use]
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Change the packet size for subsequent messages.
    ///
    /// Fails with [`StreamError::InvalidState`] while a message is open.
    pub fn set_packet_size(&mut self, size: usize) -> Result<(), StreamError> {
        validate_packet_size(size)?;
        if self.state == State::Open {
            return Err(StreamError::InvalidState(
                "cannot change the packet size while a message is open",
            ));
        }
        self.packet_size = size;
        Ok(())
    }

    /// Whether a message is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state == State::Open
    }

    fn max_payload(&self) -> usize {
        self.packet_size - PACKET_HEADER_SIZE
    }

    /// Begin a new message.
    ///
    /// `status` may carry one reset flag, applied to the first packet, and
    /// ignore-event, applied to the last. End-of-message is set by
    /// [`end_message`](Self::end_message) and must not be passed here.
    pub fn start_message(
        &mut self,
        packet_type: PacketType,
        status: PacketStatus,
    ) -> Result<(), StreamError> {
        if self.state == State::Open {
            return Err(StreamError::InvalidState("previous message is still open"));
        }
        if status.contains(PacketStatus::END_OF_MESSAGE) {
            return Err(StreamError::InvalidArgument(
                "end-of-message is set by end_message".into(),
            ));
        }
        if status.contains(PacketStatus::RESET_FLAGS) {
            return Err(StreamError::InvalidArgument(
                "reset-connection flags are mutually exclusive".into(),
            ));
        }

        self.seq = Sequence {
            packet_type,
            status,
            next_id: 1,
            emitted: 0,
        };
        self.scratch.clear();
        if self.scratch.capacity() == 0 {
            self.scratch.reserve(self.max_payload() * 11 / 10);
        }
        self.region_len = 0;
        self.reserved = 0;
        self.state = State::Open;
        Ok(())
    }

    /// Get a region for up to `size_hint` bytes of payload.
    ///
    /// The returned slice has exactly `size_hint` bytes. Report how many were
    /// written with [`advance`](Self::advance) before calling any other
    /// method.
    pub fn buffer(&mut self, size_hint: usize) -> Result<&mut [u8], StreamError> {
        if self.state != State::Open {
            return Err(StreamError::InvalidState("no message is open"));
        }
        let max_payload = self.max_payload();
        let pending = self.scratch.len();
        let total = pending + size_hint;
        let packets = total.div_ceil(max_payload).max(1);

        self.region_len = PACKET_HEADER_SIZE * packets + total;
        self.reserved = size_hint;

        let region = self.sink.get_buffer(self.region_len);
        let data_start = PACKET_HEADER_SIZE + pending;
        region[PACKET_HEADER_SIZE..data_start].copy_from_slice(&self.scratch);
        Ok(&mut region[data_start..data_start + size_hint])
    }

    /// Commit `n` bytes written into the last [`buffer`](Self::buffer) region.
    ///
    /// Every complete packet except the last is framed and handed to the
    /// sink. Advancing by zero is a no-op.
    pub fn advance(&mut self, n: usize) -> Result<(), StreamError> {
        if self.state != State::Open {
            return Err(StreamError::InvalidState("no message is open"));
        }
        if n == 0 {
            return Ok(());
        }
        if n > self.reserved {
            return Err(StreamError::InvalidArgument(format!(
                "cannot advance {n} bytes, {} reserved",
                self.reserved
            )));
        }
        self.reserved = 0;

        let max_payload = self.max_payload();
        let total = self.scratch.len() + n;
        let region = self.sink.get_buffer(self.region_len);

        // Keep the final, possibly full, packet back so `end_message` can
        // mark it.
        let full = (total - 1) / max_payload;
        let rest = PACKET_HEADER_SIZE + full * max_payload..PACKET_HEADER_SIZE + total;
        self.scratch.clear();
        self.scratch.extend_from_slice(&region[rest]);
        if full == 0 {
            return Ok(());
        }

        let framed = PACKET_HEADER_SIZE + max_payload;
        for i in (1..full).rev() {
            let from = PACKET_HEADER_SIZE + i * max_payload;
            region.copy_within(from..from + max_payload, i * framed + PACKET_HEADER_SIZE);
        }
        for i in 0..full {
            let header = self.seq.header(max_payload, false);
            header.encode(&mut &mut region[i * framed..i * framed + PACKET_HEADER_SIZE]);
            tracing::trace!(
                packet_type = ?header.packet_type,
                length = framed,
                packet_id = header.packet_id,
                is_eom = false,
                "framed TDS packet"
            );
        }
        self.sink.commit(full * framed)
    }

    /// Copy `data` into the open message.
    pub fn write_all(&mut self, mut data: &[u8]) -> Result<(), StreamError> {
        let chunk_size = self.max_payload();
        while !data.is_empty() {
            let len = data.len().min(chunk_size);
            self.buffer(len)?.copy_from_slice(&data[..len]);
            self.advance(len)?;
            data = &data[len..];
        }
        Ok(())
    }

    /// Frame the remaining payload as the terminal packet and close the
    /// message.
    pub fn end_message(&mut self) -> Result<(), StreamError> {
        if self.state != State::Open {
            return Err(StreamError::InvalidState("no message is open"));
        }
        let pending = self.scratch.len();
        let header = self.seq.header(pending, true);
        let region = self.sink.get_buffer(PACKET_HEADER_SIZE + pending);
        header.encode(&mut &mut region[..PACKET_HEADER_SIZE]);
        region[PACKET_HEADER_SIZE..PACKET_HEADER_SIZE + pending].copy_from_slice(&self.scratch);
        self.sink.commit(PACKET_HEADER_SIZE + pending)?;

        tracing::trace!(
            packet_type = ?header.packet_type,
            length = PACKET_HEADER_SIZE + pending,
            packet_id = header.packet_id,
            is_eom = true,
            "framed TDS packet"
        );

        self.scratch.clear();
        self.reserved = 0;
        self.state = State::Closed;
        Ok(())
    }

    /// Write a complete message.
    pub fn write_message(
        &mut self,
        packet_type: PacketType,
        status: PacketStatus,
        payload: &[u8],
    ) -> Result<(), StreamError> {
        self.start_message(packet_type, status)?;
        self.write_all(payload)?;
        self.end_message()
    }

    /// Send committed packets to the transport.
    pub async fn flush(&mut self) -> Result<(), StreamError> {
        self.sink.flush().await
    }

    /// Get a reference to the sink.
    pub fn get_ref(&self) -> &S {
        &self.sink
    }

    /// Get a mutable reference to the sink.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Consume the writer, returning the sink.
    pub fn into_inner(self) -> S {
        self.sink
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::sink::BufferSink;
    use tds_wire::Validation;

    fn headers(mut bytes: &[u8]) -> Vec<PacketHeader> {
        let mut out = Vec::new();
        while !bytes.is_empty() {
            let header = PacketHeader::try_parse(bytes, Validation::Strict)
                .unwrap()
                .unwrap();
            bytes = &bytes[usize::from(header.length)..];
            out.push(header);
        }
        out
    }

    fn writer() -> MessageWriter<BufferSink<Vec<u8>>> {
        MessageWriter::new(BufferSink::new(Vec::new()))
    }

    #[test]
    fn test_split_into_two_packets() {
        let mut writer = writer();
        let payload: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        writer
            .write_message(PacketType::SqlBatch, PacketStatus::NORMAL, &payload)
            .unwrap();

        let bytes = writer.get_ref().committed().to_vec();
        let headers = headers(&bytes);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0].length, 4096);
        assert_eq!(headers[1].length, 920);
        assert!(!headers[0].is_end_of_message());
        assert!(headers[1].is_end_of_message());
        assert_eq!((headers[0].packet_id, headers[1].packet_id), (1, 2));

        assert_eq!(&bytes[8..4096], &payload[..4088]);
        assert_eq!(&bytes[4096 + 8..], &payload[4088..]);
    }

    #[test]
    fn test_exact_multiple_has_no_empty_packet() {
        let mut writer = writer();
        writer
            .write_message(PacketType::SqlBatch, PacketStatus::NORMAL, &[7u8; 4088 * 2])
            .unwrap();

        let headers = headers(writer.get_ref().committed());
        assert_eq!(headers.len(), 2);
        assert!(headers.iter().all(|h| h.length == 4096));
        assert!(headers[1].is_end_of_message());
    }

    #[test]
    fn test_empty_message() {
        let mut writer = writer();
        writer
            .write_message(PacketType::Attention, PacketStatus::NORMAL, &[])
            .unwrap();

        let headers = headers(writer.get_ref().committed());
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].length, 8);
        assert!(headers[0].is_end_of_message());
    }

    #[test]
    fn test_reset_flag_on_first_packet_only() {
        let mut writer = writer();
        writer.set_packet_size(512).unwrap();
        writer
            .write_message(
                PacketType::SqlBatch,
                PacketStatus::RESET_CONNECTION,
                &[1u8; 1200],
            )
            .unwrap();

        let headers = headers(writer.get_ref().committed());
        assert_eq!(headers.len(), 3);
        assert!(headers[0].status.contains(PacketStatus::RESET_CONNECTION));
        assert!(!headers[1].status.contains(PacketStatus::RESET_CONNECTION));
        assert_eq!(headers[2].status, PacketStatus::END_OF_MESSAGE);
    }

    #[test]
    fn test_ignore_event_on_last_packet() {
        let mut writer = writer();
        writer.set_packet_size(512).unwrap();
        writer
            .write_message(PacketType::SqlBatch, PacketStatus::IGNORE_EVENT, &[1u8; 600])
            .unwrap();

        let headers = headers(writer.get_ref().committed());
        assert_eq!(headers[0].status, PacketStatus::NORMAL);
        assert_eq!(
            headers[1].status,
            PacketStatus::END_OF_MESSAGE | PacketStatus::IGNORE_EVENT
        );
    }

    #[test]
    fn test_packet_ids_wrap() {
        let mut writer = writer();
        writer.set_packet_size(512).unwrap();
        writer
            .write_message(PacketType::BulkLoad, PacketStatus::NORMAL, &vec![0u8; 504 * 300])
            .unwrap();

        let headers = headers(writer.get_ref().committed());
        assert_eq!(headers.len(), 300);
        assert_eq!(headers[254].packet_id, 255);
        assert_eq!(headers[255].packet_id, 0);
        assert_eq!(headers[256].packet_id, 1);
    }

    #[test]
    fn test_small_appends_accumulate() {
        let mut writer = writer();
        writer.set_packet_size(512).unwrap();
        writer
            .start_message(PacketType::SqlBatch, PacketStatus::NORMAL)
            .unwrap();
        let payload: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
        for chunk in payload.chunks(7) {
            let region = writer.buffer(16).unwrap();
            region[..chunk.len()].copy_from_slice(chunk);
            writer.advance(chunk.len()).unwrap();
        }
        writer.end_message().unwrap();

        let mut rest = writer.get_ref().committed();
        let mut packets = 0;
        let mut payload_out = Vec::new();
        while !rest.is_empty() {
            let header = PacketHeader::try_parse(rest, Validation::Strict)
                .unwrap()
                .unwrap();
            let len = usize::from(header.length);
            assert!(len <= 512);
            payload_out.extend_from_slice(&rest[PACKET_HEADER_SIZE..len]);
            rest = &rest[len..];
            packets += 1;
        }
        assert_eq!(packets, 3);
        assert_eq!(payload_out, payload);
    }

    #[test]
    fn test_state_errors() {
        let mut writer = writer();
        assert!(matches!(writer.advance(1), Err(StreamError::InvalidState(_))));
        assert!(matches!(writer.end_message(), Err(StreamError::InvalidState(_))));

        writer
            .start_message(PacketType::SqlBatch, PacketStatus::NORMAL)
            .unwrap();
        assert!(matches!(
            writer.start_message(PacketType::SqlBatch, PacketStatus::NORMAL),
            Err(StreamError::InvalidState(_))
        ));
        assert!(matches!(
            writer.set_packet_size(1024),
            Err(StreamError::InvalidState(_))
        ));
        writer.advance(0).unwrap();
        writer.buffer(4).unwrap();
        assert!(matches!(
            writer.advance(5),
            Err(StreamError::InvalidArgument(_))
        ));
        writer.end_message().unwrap();
        assert!(matches!(writer.advance(0), Err(StreamError::InvalidState(_))));
    }

    #[test]
    fn test_invalid_status() {
        let mut writer = writer();
        assert!(matches!(
            writer.start_message(PacketType::SqlBatch, PacketStatus::END_OF_MESSAGE),
            Err(StreamError::InvalidArgument(_))
        ));
        assert!(matches!(
            writer.start_message(PacketType::SqlBatch, PacketStatus::RESET_FLAGS),
            Err(StreamError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_flush_writes_packets() {
        let mut writer = writer();
        writer
            .write_message(PacketType::SqlBatch, PacketStatus::NORMAL, b"payload")
            .unwrap();
        writer.flush().await.unwrap();

        let written = writer.get_ref().get_ref();
        assert_eq!(written.len(), 15);
        assert_eq!(&written[8..], b"payload");
    }
}
