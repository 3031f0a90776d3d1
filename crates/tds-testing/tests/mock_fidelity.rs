//! Mock TDS Server Fidelity Tests
//!
//! These tests check that the scripted server produces byte streams the
//! `tds-wire` decoders accept, and that it answers pipelined requests in
//! arrival order.
//!
//! ```bash
//! cargo test -p tds-testing --test mock_fidelity
//! ```

#![allow(clippy::unwrap_used, clippy::panic)]

use std::time::Duration;

use tds_testing::{MockColumn, MockResponse, MockTdsServer, ScalarValue, TokenStreamBuilder, packetize};
use tds_wire::{
    DoneStatus, PACKET_HEADER_SIZE, PacketHeader, PacketType, Progress, Token, TokenType,
    Validation, encode_sql_batch,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

async fn send_batch(client: &mut DuplexStream, sql: &str) {
    let request = packetize(PacketType::SqlBatch, &encode_sql_batch(sql), 4096);
    client.write_all(&request).await.unwrap();
}

async fn read_response(client: &mut DuplexStream) -> (Vec<u8>, usize) {
    let mut payload = Vec::new();
    let mut packets = 0;
    loop {
        let mut header = [0u8; PACKET_HEADER_SIZE];
        client.read_exact(&mut header).await.unwrap();
        let header = PacketHeader::try_parse(&header, Validation::Strict)
            .unwrap()
            .unwrap();
        let start = payload.len();
        payload.resize(start + header.payload_length(), 0);
        client.read_exact(&mut payload[start..]).await.unwrap();
        packets += 1;
        if header.is_end_of_message() {
            return (payload, packets);
        }
    }
}

/// Decode tokens until the payload is exhausted. Row values are skipped by
/// the caller-provided width because rows carry no length of their own.
fn decode_tokens(mut payload: &[u8], row_width: usize) -> Vec<Token> {
    let mut tokens = Vec::new();
    while !payload.is_empty() {
        let token_type = TokenType::from_u8(payload[0]).unwrap();
        let Progress::Ready((token, consumed)) =
            Token::decode_body(token_type, &payload[1..], Validation::Strict).unwrap()
        else {
            panic!("incomplete {token_type:?} token");
        };
        payload = &payload[1 + consumed..];
        if token == Token::Row {
            payload = &payload[row_width..];
        }
        tokens.push(token);
    }
    tokens
}

#[tokio::test]
async fn test_scalar_response_decodes() {
    let server = MockTdsServer::builder()
        .with_response("SELECT 42", MockResponse::scalar_int(42))
        .build();
    let mut client = server.connect();

    send_batch(&mut client, "SELECT 42").await;
    let (payload, _) = read_response(&mut client).await;

    // INTN value: length byte plus 4 bytes.
    let tokens = decode_tokens(&payload, 5);
    assert_eq!(tokens.len(), 3);
    let Token::ColMetaData(meta) = &tokens[0] else {
        panic!("expected COLMETADATA, got {:?}", tokens[0]);
    };
    assert_eq!(meta.len(), 1);
    assert_eq!(tokens[1], Token::Row);
    let done = tokens[2].as_done().unwrap();
    assert!(done.is_final());
    assert_eq!(done.rows_affected(), Some(1));
}

#[tokio::test]
async fn test_error_response_decodes() {
    let server = MockTdsServer::builder()
        .with_default_response(MockResponse::error(208, "Invalid object name 'nope'."))
        .build();
    let mut client = server.connect();

    send_batch(&mut client, "SELECT * FROM nope").await;
    let (payload, _) = read_response(&mut client).await;

    let tokens = decode_tokens(&payload, 0);
    let Token::Error(error) = &tokens[0] else {
        panic!("expected ERROR, got {:?}", tokens[0]);
    };
    assert_eq!(error.number, 208);
    assert_eq!(error.message, "Invalid object name 'nope'.");
    assert!(error.is_error());
    assert!(tokens[1].as_done().unwrap().has_error());
}

#[tokio::test]
async fn test_large_response_spans_packets() {
    let rows: Vec<Vec<ScalarValue>> = (0..200)
        .map(|i| vec![ScalarValue::String(format!("row number {i:05}"))])
        .collect();
    let server = MockTdsServer::builder()
        .with_packet_size(512)
        .with_response(
            "SELECT name FROM t",
            MockResponse::rows(vec![MockColumn::nvarchar("name", 50)], rows),
        )
        .build();
    let mut client = server.connect();

    send_batch(&mut client, "SELECT name FROM t").await;
    let (payload, packets) = read_response(&mut client).await;
    assert!(packets > 1);

    // u16 length plus 16 UTF-16 characters.
    let tokens = decode_tokens(&payload, 2 + 32);
    assert_eq!(tokens.iter().filter(|t| **t == Token::Row).count(), 200);
}

#[tokio::test]
async fn test_pipelined_requests_answered_in_order() {
    let server = MockTdsServer::builder()
        .with_response("SELECT 1", MockResponse::scalar_int(1).delayed(Duration::from_millis(20)))
        .with_response("SELECT 2", MockResponse::affected(2))
        .build();
    let mut client = server.connect();

    send_batch(&mut client, "SELECT 1").await;
    send_batch(&mut client, "SELECT 2").await;

    let (first, _) = read_response(&mut client).await;
    let (second, _) = read_response(&mut client).await;
    assert!(matches!(decode_tokens(&first, 5)[0], Token::ColMetaData(_)));
    let tokens = decode_tokens(&second, 0);
    assert_eq!(tokens[0].as_done().unwrap().row_count, 2);

    let sql: Vec<_> = server.requests().into_iter().map(|r| r.sql).collect();
    assert_eq!(sql, ["SELECT 1", "SELECT 2"]);
}

#[tokio::test]
async fn test_raw_response() {
    let raw = TokenStreamBuilder::new()
        .info(5701, "Changed database context to 'test'.")
        .done(DoneStatus::FINAL, 0)
        .build();
    let server = MockTdsServer::builder()
        .with_default_response(MockResponse::Raw(raw.clone()))
        .build();
    let mut client = server.connect();

    send_batch(&mut client, "USE test").await;
    let (payload, _) = read_response(&mut client).await;
    assert_eq!(payload, raw.to_vec());
}

#[tokio::test]
async fn test_connection_accounting() {
    let server = MockTdsServer::builder().build();
    let client = server.connect();
    assert_eq!(server.total_connections(), 1);
    assert_eq!(server.connection_count(), 1);

    drop(client);
    for _ in 0..50 {
        if server.connection_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(server.connection_count(), 0);
}
