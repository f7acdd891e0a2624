mod test_utils;

use flexi_logger::LoggerHandle;
use log::*;
use redisconnect::{
    Arg, CommandOptions, ConnectParams, Connection, ConnectionConfiguration, Pool,
    PoolConfiguration, RedisError, RedisResult,
};
use std::time::Instant;
use test_utils::{MockOptions, MockServer};

#[tokio::test]
async fn test_010_connect() -> RedisResult<()> {
    let mut log_handle = test_utils::init_logger();
    let start = Instant::now();
    startup_sequence_runs_in_order(&mut log_handle).await?;
    wrong_credentials_are_rejected(&mut log_handle).await;
    ping_probe_verifies_echo(&mut log_handle).await?;
    disconnect_is_idempotent(&mut log_handle).await?;
    info!("Elapsed time: {:?}", Instant::now().duration_since(start));
    Ok(())
}

async fn startup_sequence_runs_in_order(_log_handle: &mut LoggerHandle) -> RedisResult<()> {
    info!("the startup prelude (AUTH, CLIENT SETNAME, SELECT, READONLY) precedes user commands");
    let server = MockServer::start_with(MockOptions {
        username: Some("app".to_string()),
        password: Some("secret".to_string()),
    })
    .await;

    let params = ConnectParams::builder()
        .hostname(server.addr().ip().to_string())
        .port(server.addr().port())
        .username("app")
        .password("secret")
        .build()?;
    let config = ConnectionConfiguration::default()
        .with_client_name("test-client")
        .with_db(3)
        .with_readonly(true);
    let pool = Pool::new(params, config, PoolConfiguration::default().with_min_size(1)).await?;

    pool.execute("PING", vec![Arg::from("hello")], CommandOptions::default())
        .await?;

    let names = server.command_names();
    assert_eq!(
        &names[..5],
        &["AUTH", "CLIENT", "SELECT", "READONLY", "PING"],
        "unexpected command order: {names:?}"
    );
    pool.close().await;
    pool.wait_closed().await;
    Ok(())
}

async fn wrong_credentials_are_rejected(_log_handle: &mut LoggerHandle) {
    info!("wrong credentials produce an authentication error");
    let server = MockServer::start_with(MockOptions {
        username: None,
        password: Some("right".to_string()),
    })
    .await;

    let params = ConnectParams::builder()
        .hostname(server.addr().ip().to_string())
        .port(server.addr().port())
        .password("wrong")
        .build()
        .unwrap();
    let result = Connection::connect(params, ConnectionConfiguration::default()).await;
    assert!(
        matches!(result, Err(RedisError::Auth { .. })),
        "expected an auth error, got {result:?}"
    );
}

async fn ping_probe_verifies_echo(_log_handle: &mut LoggerHandle) -> RedisResult<()> {
    info!("the health-check probe round-trips its sentinel");
    let server = MockServer::start().await;
    let pool = Pool::from_url(server.url()).await?;
    let conn = pool.acquire().await?;
    conn.ping_probe().await?;
    drop(conn);
    pool.close().await;
    pool.wait_closed().await;
    Ok(())
}

async fn disconnect_is_idempotent(_log_handle: &mut LoggerHandle) -> RedisResult<()> {
    info!("disconnect can be called repeatedly and fails pending work exactly once");
    let server = MockServer::start().await;
    let params = ConnectParams::builder()
        .hostname(server.addr().ip().to_string())
        .port(server.addr().port())
        .build()?;
    let conn = Connection::connect(params, ConnectionConfiguration::default()).await?;
    conn.disconnect().await;
    conn.disconnect().await;
    let result = conn
        .send_command(
            redisconnect::Command::new("PING"),
            CommandOptions::default(),
        )
        .await;
    assert!(matches!(result, Err(RedisError::ConnectionClosed)));
    Ok(())
}
