mod test_utils;

use flexi_logger::LoggerHandle;
use log::*;
use redisconnect::{
    Arg, CommandOptions, Pool, RedisError, RedisResult,
};
use std::time::{Duration, Instant};
use test_utils::MockServer;

#[tokio::test]
async fn test_060_url_and_recovery() -> RedisResult<()> {
    let mut log_handle = test_utils::init_logger();
    let start = Instant::now();
    pool_from_url_honors_options(&mut log_handle).await?;
    malformed_urls_are_rejected(&mut log_handle).await;
    broken_connections_are_destroyed_on_release(&mut log_handle).await?;
    info!("Elapsed time: {:?}", Instant::now().duration_since(start));
    Ok(())
}

async fn pool_from_url_honors_options(_log_handle: &mut LoggerHandle) -> RedisResult<()> {
    info!("URL query options reach the connection and pool configuration");
    let server = MockServer::start().await;
    let pool = Pool::from_url(format!(
        "{}?min_size=2&max_size=3&auto_decode=true&client_name=urltest",
        server.url()
    ))
    .await?;

    assert_eq!(pool.idle_count(), 2);
    assert!(pool.connection_configuration().is_auto_decode());
    assert_eq!(pool.connection_configuration().client_name(), Some("urltest"));
    // the eager connections announced their name
    assert!(server.command_names().iter().any(|n| n == "CLIENT"));

    pool.execute(
        "SET",
        vec![Arg::from("k"), Arg::from("v")],
        CommandOptions::default(),
    )
    .await?;
    let reply = pool
        .execute("GET", vec![Arg::from("k")], CommandOptions::default())
        .await?;
    assert_eq!(reply.into_string()?, "v");
    pool.close().await;
    pool.wait_closed().await;
    Ok(())
}

async fn malformed_urls_are_rejected(_log_handle: &mut LoggerHandle) {
    info!("bad schemes and unknown options fail fast");
    for url in [
        "http://localhost",
        "redis://localhost?nope=1",
        "redis://localhost/not-a-db",
    ] {
        let result = Pool::from_url(url).await;
        assert!(
            matches!(result, Err(RedisError::ConnParams { .. })),
            "expected ConnParams for {url}, got {result:?}"
        );
    }
}

async fn broken_connections_are_destroyed_on_release(
    _log_handle: &mut LoggerHandle,
) -> RedisResult<()> {
    info!("a connection that died in use is not refiled into the free list");
    let server = MockServer::start().await;
    let pool = Pool::from_url(format!("{}?min_size=0&max_size=2", server.url())).await?;

    let conn = pool.acquire().await?;
    conn.ping_probe().await?;
    server.kick_connections();
    // wait until the client side noticed the loss
    for _ in 0..200 {
        if conn.is_broken() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(conn.is_broken());
    drop(conn);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pool.idle_count(), 0);
    assert_eq!(pool.in_use_count(), 0);

    // the next acquire builds a fresh connection
    let conn = pool.acquire().await?;
    conn.ping_probe().await?;
    drop(conn);
    pool.close().await;
    pool.wait_closed().await;
    Ok(())
}
