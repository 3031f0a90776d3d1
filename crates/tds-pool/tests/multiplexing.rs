//! Pool integration tests against the scripted server.
//!
//! ```bash
//! cargo test -p tds-pool --test multiplexing
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use tds_pool::{
    CommandContext, CommandValues, ConnectionFactory, DataSource, ExecutionFlags, PoolConfig,
    PoolError, SlotState,
};
use tds_testing::{MockColumn, MockResponse, MockTdsServer, ScalarValue, TokenStreamBuilder};
use tds_wire::{DoneStatus, PacketStatus, PacketType, RpcParam, Token};
use tokio::io::DuplexStream;

#[derive(Clone)]
struct MockFactory(Arc<MockTdsServer>);

#[async_trait::async_trait]
impl ConnectionFactory for MockFactory {
    type Transport = DuplexStream;

    async fn connect(&self) -> std::io::Result<DuplexStream> {
        Ok(self.0.connect())
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn pool(server: MockTdsServer, config: PoolConfig) -> (DataSource<MockFactory>, Arc<MockTdsServer>) {
    init_tracing();
    let server = Arc::new(server);
    let pool = DataSource::new(MockFactory(Arc::clone(&server)), config).unwrap();
    (pool, server)
}

fn numbered_server(count: i32) -> MockTdsServer {
    (0..count)
        .fold(MockTdsServer::builder(), |builder, i| {
            builder.with_response(format!("SELECT {i}"), MockResponse::scalar_int(i))
        })
        .build()
}

fn numbered_server_pool(count: i32) -> (DataSource<MockFactory>, Arc<MockTdsServer>) {
    pool(
        numbered_server(count),
        PoolConfig::new().min_connections(1).max_connections(1),
    )
}

async fn read_scalar(context: CommandContext<'_, DuplexStream>) -> Result<i32, PoolError> {
    let mut response = context.response().await?;
    let mut rows = response.next_result_set().await?.expect("result set");
    assert!(rows.move_to_next_row().await?);
    let value: i32 = rows.get(None).await?;
    response.drain().await?;
    Ok(value)
}

async fn read_recording(
    context: CommandContext<'_, DuplexStream>,
    label: char,
    order: &Mutex<Vec<char>>,
) -> i32 {
    let value = read_scalar(context).await.unwrap();
    order.lock().push(label);
    value
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_commands_share_one_connection() {
    let (pool, server) = numbered_server_pool(16);

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let pool = pool.clone();
            tokio::spawn(async move {
                let mut slot = pool.get_slot(false, None).await?;
                let context = pool.write_command(&mut slot, &format!("SELECT {i}")).await?;
                read_scalar(context).await
            })
        })
        .collect();

    for (i, result) in join_all(tasks).await.into_iter().enumerate() {
        assert_eq!(result.unwrap().unwrap(), i32::try_from(i).unwrap());
    }
    assert_eq!(server.total_connections(), 1);
    assert!(server.requests().iter().all(|r| r.connection == 0));
    assert_eq!(pool.status().idle, 1);
}

#[tokio::test]
async fn test_responses_are_read_in_write_order() {
    let (pool, _server) = numbered_server_pool(3);

    let mut a = pool.get_slot(false, None).await.unwrap();
    let mut b = pool.get_slot(false, None).await.unwrap();
    let mut c = pool.get_slot(false, None).await.unwrap();
    assert_eq!(a.connection().id(), c.connection().id());

    let first = pool.write_command(&mut a, "SELECT 0").await.unwrap();
    let second = pool.write_command(&mut b, "SELECT 1").await.unwrap();
    let third = pool.write_command(&mut c, "SELECT 2").await.unwrap();

    // Polled last-first; completion still follows write order.
    let order = Mutex::new(Vec::new());
    let (z, y, x) = tokio::join!(
        read_recording(third, 'c', &order),
        read_recording(second, 'b', &order),
        read_recording(first, 'a', &order),
    );

    assert_eq!((x, y, z), (0, 1, 2));
    assert_eq!(*order.lock(), ['a', 'b', 'c']);
    assert_eq!(a.state(), SlotState::Completed);
}

#[tokio::test]
async fn test_multiplexed_slot_runs_one_command() {
    let (pool, _server) = numbered_server_pool(1);
    let mut slot = pool.get_slot(false, None).await.unwrap();

    let context = pool.write_command(&mut slot, "SELECT 0").await.unwrap();
    assert_eq!(read_scalar(context).await.unwrap(), 0);

    let err = pool.write_command(&mut slot, "SELECT 0").await.unwrap_err();
    assert!(matches!(err, PoolError::InvalidSlot(_)));
}

#[tokio::test]
async fn test_exclusive_slot_runs_sequential_commands() {
    let (pool, _server) = numbered_server_pool(3);
    let mut slot = pool.get_slot(true, None).await.unwrap();
    assert!(slot.is_exclusive());
    assert_eq!(pool.status().exclusive, 1);

    for i in 0..3 {
        let context = pool
            .write_command(&mut slot, &format!("SELECT {i}"))
            .await
            .unwrap();
        assert_eq!(read_scalar(context).await.unwrap(), i);
    }

    // Another caller cannot get the connection meanwhile.
    let err = pool
        .get_slot(false, Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::AcquisitionTimeout(_)));

    drop(slot);
    assert_eq!(pool.status().idle, 1);
}

#[tokio::test]
async fn test_command_timeout_evicts_connection() {
    let server = MockTdsServer::builder()
        .with_response("WAITFOR DELAY '01:00'", MockResponse::Hang)
        .with_response("SELECT 0", MockResponse::scalar_int(0))
        .build();
    let (pool, server) = pool(server, PoolConfig::new().max_connections(1));

    let mut slot = pool.get_slot(false, None).await.unwrap();
    let command = CommandValues::new("WAITFOR DELAY '01:00'").timeout(Duration::from_millis(50));
    let context = pool.write_command(&mut slot, &command).await.unwrap();
    let err = context.response().await.unwrap_err();
    assert!(matches!(err, PoolError::CommandTimeout(_)));
    assert!(err.is_connection_fatal());
    assert_eq!(slot.state(), SlotState::Faulted);
    assert!(slot.connection().is_broken());

    drop(slot);
    assert_eq!(pool.status().total, 0);

    let mut slot = pool.get_slot(false, None).await.unwrap();
    let context = pool.write_command(&mut slot, "SELECT 0").await.unwrap();
    assert_eq!(read_scalar(context).await.unwrap(), 0);
    assert_eq!(server.total_connections(), 2);
}

#[tokio::test]
async fn test_command_timeout_starts_at_read_turn() {
    let (pool, _server) = numbered_server_pool(2);

    let mut a = pool.get_slot(false, None).await.unwrap();
    let mut b = pool.get_slot(false, None).await.unwrap();
    let first = pool.write_command(&mut a, "SELECT 0").await.unwrap();
    let command = CommandValues::new("SELECT 1").timeout(Duration::from_millis(50));
    let second = pool.write_command(&mut b, &command).await.unwrap();

    // The first response is read well after the second command's timeout.
    let (first, second) = tokio::join!(
        async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            read_scalar(first).await
        },
        read_scalar(second),
    );
    assert_eq!(first.unwrap(), 0);
    assert_eq!(second.unwrap(), 1);
    assert!(!b.connection().is_broken());
}

#[tokio::test]
async fn test_abandoned_response_fails_queued_commands() {
    let (pool, _server) = numbered_server_pool(2);

    let mut a = pool.get_slot(false, None).await.unwrap();
    let mut b = pool.get_slot(false, None).await.unwrap();
    let first = pool.write_command(&mut a, "SELECT 0").await.unwrap();
    let second = pool.write_command(&mut b, "SELECT 1").await.unwrap();

    let response = first.response().await.unwrap();
    drop(response);
    assert_eq!(a.state(), SlotState::Faulted);

    let err = second.response().await.unwrap_err();
    assert!(matches!(err, PoolError::ConnectionBroken));
    assert_eq!(b.state(), SlotState::Faulted);

    // Evicted once the last slot on it is released.
    drop(a);
    assert_eq!(pool.status().total, 1);
    drop(b);
    assert_eq!(pool.status().total, 0);
}

#[tokio::test]
async fn test_rows_read_to_final_done_hand_off_without_drain() {
    let (pool, _server) = numbered_server_pool(2);

    let mut a = pool.get_slot(false, None).await.unwrap();
    let mut b = pool.get_slot(false, None).await.unwrap();
    let first = pool.write_command(&mut a, "SELECT 0").await.unwrap();
    let second = pool.write_command(&mut b, "SELECT 1").await.unwrap();

    let mut response = first.response().await.unwrap();
    let mut rows = response.next_result_set().await.unwrap().unwrap();
    assert!(rows.move_to_next_row().await.unwrap());
    assert_eq!(rows.get::<i32>(None).await.unwrap(), 0);
    assert!(!rows.move_to_next_row().await.unwrap());
    assert!(rows.done().unwrap().is_final());
    drop(response);

    assert_eq!(a.state(), SlotState::Completed);
    assert!(!a.connection().is_broken());
    assert_eq!(read_scalar(second).await.unwrap(), 1);
}

#[tokio::test]
async fn test_dropping_between_result_sets_breaks_connection() {
    let tokens = TokenStreamBuilder::new()
        .col_metadata(&[MockColumn::int("id")])
        .row(&[ScalarValue::Int(1)])
        .done(DoneStatus::MORE | DoneStatus::COUNT, 1)
        .col_metadata(&[MockColumn::int("id")])
        .row(&[ScalarValue::Int(2)])
        .done(DoneStatus::COUNT, 1)
        .build();
    let server = MockTdsServer::builder()
        .with_response("EXEC two_sets", MockResponse::Raw(tokens))
        .build();
    let (pool, _server) = pool(server, PoolConfig::default());

    let mut slot = pool.get_slot(false, None).await.unwrap();
    let mut response = pool
        .write_command(&mut slot, "EXEC two_sets")
        .await
        .unwrap()
        .response()
        .await
        .unwrap();
    let mut rows = response.next_result_set().await.unwrap().unwrap();
    rows.drain().await.unwrap();
    drop(response);

    assert_eq!(slot.state(), SlotState::Faulted);
    assert!(slot.connection().is_broken());
}

#[tokio::test]
async fn test_server_error_after_drain() {
    let server = MockTdsServer::builder()
        .with_response(
            "SELECT * FROM nope",
            MockResponse::error(208, "Invalid object name 'nope'."),
        )
        .with_response("SELECT 0", MockResponse::scalar_int(0))
        .build();
    let (pool, server) = pool(server, PoolConfig::new().max_connections(1));

    let err = pool.execute("SELECT * FROM nope").await.unwrap_err();
    let PoolError::Server(message) = err else {
        panic!("expected a server error, got {err:?}");
    };
    assert_eq!(message.number, 208);
    assert_eq!(message.class, 16);

    // The connection stays in the pool.
    let execution = pool.execute("SELECT 0").await.unwrap();
    assert!(execution.is_completed());
    assert_eq!(server.total_connections(), 1);
}

#[tokio::test]
async fn test_result_sets_and_messages() {
    let tokens = TokenStreamBuilder::new()
        .info(5701, "Changed database context to 'app'.")
        .col_metadata(&[MockColumn::int("id"), MockColumn::nvarchar("name", 20)])
        .row(&[ScalarValue::Int(1), ScalarValue::String("one".into())])
        .row(&[ScalarValue::Int(2), ScalarValue::String("two".into())])
        .row(&[ScalarValue::Int(3), ScalarValue::String("three".into())])
        .done(DoneStatus::MORE | DoneStatus::COUNT, 3)
        .col_metadata(&[MockColumn::bigint("total")])
        .row(&[ScalarValue::BigInt(6)])
        .done(DoneStatus::COUNT, 1)
        .build();
    let server = MockTdsServer::builder()
        .with_response("EXEC report", MockResponse::Raw(tokens))
        .build();
    let (pool, _server) = pool(server, PoolConfig::default());

    let mut slot = pool.get_slot(false, None).await.unwrap();
    let mut response = pool
        .write_command(&mut slot, "EXEC report")
        .await
        .unwrap()
        .response()
        .await
        .unwrap();

    // Only the first row of the first result set is read.
    let mut rows = response.next_result_set().await.unwrap().unwrap();
    assert_eq!(rows.metadata().len(), 2);
    assert!(rows.move_to_next_row().await.unwrap());
    let name: String = rows.get(Some(1)).await.unwrap();
    assert_eq!(name, "one");

    let mut rows = response.next_result_set().await.unwrap().unwrap();
    assert!(rows.move_to_next_row().await.unwrap());
    let total: i64 = rows.get(None).await.unwrap();
    assert_eq!(total, 6);
    assert!(!rows.move_to_next_row().await.unwrap());

    assert!(response.next_result_set().await.unwrap().is_none());
    assert!(response.is_finished());

    let execution = response.drain().await.unwrap();
    assert_eq!(execution.result_sets(), 2);
    assert_eq!(execution.rows_affected(), Some(4));
    assert_eq!(execution.messages().len(), 1);
    assert_eq!(execution.messages()[0].number, 5701);
    assert_eq!(slot.state(), SlotState::Completed);
}

#[tokio::test]
async fn test_next_token_skips_rows() {
    let server = MockTdsServer::builder()
        .with_default_response(MockResponse::rows(
            vec![MockColumn::int("n")],
            (0..5).map(|i| vec![ScalarValue::Int(i)]).collect(),
        ))
        .build();
    let (pool, _server) = pool(server, PoolConfig::default());

    let mut slot = pool.get_slot(false, None).await.unwrap();
    let mut response = pool
        .write_command(&mut slot, "SELECT n FROM numbers")
        .await
        .unwrap()
        .response()
        .await
        .unwrap();

    let mut types = Vec::new();
    while let Some(token) = response.next_token().await.unwrap() {
        types.push(token.token_type());
    }
    assert_eq!(types.len(), 7);
    assert!(matches!(response.next_token().await, Ok(None)));
    assert_eq!(response.execution().rows_affected(), Some(5));
}

#[tokio::test]
async fn test_packet_size_change_applies_to_next_request() {
    let tokens = TokenStreamBuilder::new()
        .packet_size(8192, 4096)
        .done(DoneStatus::FINAL, 0)
        .build();
    let server = MockTdsServer::builder()
        .with_response("SET PACKET SIZE", MockResponse::Raw(tokens))
        .build();
    let (pool, server) = pool(server, PoolConfig::new().max_connections(1));

    let mut slot = pool.get_slot(true, None).await.unwrap();
    assert_eq!(slot.connection().packet_size(), 4096);
    let context = pool.write_command(&mut slot, "SET PACKET SIZE").await.unwrap();
    let mut response = context.response().await.unwrap();
    let Some(Token::EnvChange(env)) = response.next_token().await.unwrap() else {
        panic!("expected ENVCHANGE");
    };
    assert_eq!(env.packet_size(), Some(8192));
    response.drain().await.unwrap();
    assert_eq!(slot.connection().packet_size(), 8192);

    // A statement longer than one old packet still reaches the server intact.
    let long = format!("SELECT '{}'", "x".repeat(5000));
    let context = pool.write_command(&mut slot, &long).await.unwrap();
    context.response().await.unwrap().drain().await.unwrap();
    assert_eq!(server.requests().last().unwrap().sql, long);
}

#[tokio::test]
async fn test_parameters_and_flags_reach_the_server() {
    let server = MockTdsServer::builder().build();
    let (pool, server) = pool(server, PoolConfig::default());

    let command = CommandValues::new("UPDATE t SET name = @p2 WHERE id = @p1")
        .param(RpcParam::int("@p1", 7))
        .param(RpcParam::nvarchar("@p2", "seven"))
        .flags(ExecutionFlags::RESET_CONNECTION);
    pool.execute(&command).await.unwrap();
    pool.execute("SELECT 1").await.unwrap();

    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].packet_type, PacketType::Rpc);
    assert_eq!(requests[0].sql, "UPDATE t SET name = @p2 WHERE id = @p1");
    assert!(requests[0].status.contains(PacketStatus::RESET_CONNECTION));
    assert_eq!(requests[1].packet_type, PacketType::SqlBatch);
    assert!(!requests[1].status.contains(PacketStatus::RESET_CONNECTION));
}

#[tokio::test]
async fn test_invalid_flags_do_not_consume_slot() {
    let (pool, _server) = numbered_server_pool(1);
    let mut slot = pool.get_slot(false, None).await.unwrap();

    let command = CommandValues::new("SELECT 0").flags(ExecutionFlags::all());
    let err = pool.write_command(&mut slot, &command).await.unwrap_err();
    assert!(matches!(err, PoolError::InvalidCommand(_)));
    assert_eq!(slot.state(), SlotState::Pending);

    let context = pool.write_command(&mut slot, "SELECT 0").await.unwrap();
    assert_eq!(read_scalar(context).await.unwrap(), 0);
}

#[tokio::test]
async fn test_server_stop_breaks_connection() {
    let (pool, server) = numbered_server_pool(1);
    let mut slot = pool.get_slot(false, None).await.unwrap();
    server.stop();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let result = async {
        let context = pool.write_command(&mut slot, "SELECT 0").await?;
        read_scalar(context).await
    }
    .await;
    let err = result.unwrap_err();
    assert!(err.is_connection_fatal(), "unexpected error {err:?}");
    assert_eq!(slot.state(), SlotState::Faulted);
}
