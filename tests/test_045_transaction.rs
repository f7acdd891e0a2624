mod test_utils;

use flexi_logger::LoggerHandle;
use log::*;
use redisconnect::{
    Command, CommandOptions, PipelineState, Pool, RedisError, RedisResult, Value,
};
use std::time::Instant;
use test_utils::MockServer;

#[tokio::test]
async fn test_045_transaction() -> RedisResult<()> {
    let mut log_handle = test_utils::init_logger();
    let start = Instant::now();
    transaction_happy_path(&mut log_handle).await?;
    broken_watch_aborts_with_watch_error(&mut log_handle).await?;
    queueing_errors_abort_the_transaction(&mut log_handle).await?;
    state_machine_rejects_misuse(&mut log_handle).await?;
    info!("Elapsed time: {:?}", Instant::now().duration_since(start));
    Ok(())
}

async fn transaction_happy_path(_log_handle: &mut LoggerHandle) -> RedisResult<()> {
    info!("MULTI/EXEC pairs the EXEC array with the buffered commands");
    let server = MockServer::start().await;
    let pool = Pool::from_url(server.url()).await?;
    let mut pipe = pool.pipeline(true);

    pipe.command(Command::new("INCR").arg("foo")?, CommandOptions::default())
        .await?;
    pipe.command(Command::new("INCR").arg("bar")?, CommandOptions::default())
        .await?;
    let results = pipe.execute(true).await?;
    assert_eq!(results.len(), 2);
    assert_eq!(*results[0].as_ref().unwrap(), Value::Integer(1));
    assert_eq!(*results[1].as_ref().unwrap(), Value::Integer(1));

    let names = server.command_names();
    assert_eq!(names, vec!["MULTI", "INCR", "INCR", "EXEC"]);
    pool.close().await;
    Ok(())
}

async fn broken_watch_aborts_with_watch_error(_log_handle: &mut LoggerHandle) -> RedisResult<()> {
    info!("a concurrent write to a watched key turns EXEC into a watch error");
    let server = MockServer::start().await;
    server.set(b"x", b"1");
    let pool = Pool::from_url(server.url()).await?;
    let mut pipe = pool.pipeline(true);

    pipe.watch(&["x"]).await?;
    assert_eq!(pipe.state(), PipelineState::Watching);
    assert!(pipe.is_watching());

    // reads between WATCH and MULTI run immediately on the held connection
    let current = pipe
        .command(Command::new("GET").arg("x")?, CommandOptions::default())
        .await?;
    assert_eq!(current, Some(Value::BulkString(b"1".to_vec())));

    pipe.multi()?;
    assert_eq!(pipe.state(), PipelineState::Queuing);
    let queued = pipe
        .command(
            Command::new("SET").arg("x")?.arg("2")?,
            CommandOptions::default(),
        )
        .await?;
    assert_eq!(queued, None);

    // another client modifies the watched key before EXEC
    server.set(b"x", b"99");

    let result = pipe.execute(true).await;
    assert!(
        matches!(result, Err(RedisError::Watch)),
        "expected a watch error, got {result:?}"
    );
    // no buffered write happened
    assert_eq!(server.get(b"x"), Some(b"99".to_vec()));
    pool.close().await;
    Ok(())
}

async fn queueing_errors_abort_the_transaction(_log_handle: &mut LoggerHandle) -> RedisResult<()> {
    info!("a command rejected at queueing time surfaces as the transaction error");
    let server = MockServer::start().await;
    let pool = Pool::from_url(server.url()).await?;
    let mut pipe = pool.pipeline(true);

    pipe.command(Command::new("INCR").arg("a")?, CommandOptions::default())
        .await?;
    pipe.command(Command::new("NOSUCHCOMMAND"), CommandOptions::default())
        .await?;

    let result = pipe.execute(true).await;
    assert!(
        matches!(result, Err(RedisError::Response { ref kind, .. }) if kind == "ERR"),
        "expected the queueing error, got {result:?}"
    );
    // the transaction did not run
    assert_eq!(server.get(b"a"), None);
    pool.close().await;
    Ok(())
}

async fn state_machine_rejects_misuse(_log_handle: &mut LoggerHandle) -> RedisResult<()> {
    info!("nested MULTI and WATCH-after-MULTI are usage errors");
    let server = MockServer::start().await;
    let pool = Pool::from_url(server.url()).await?;

    let mut pipe = pool.pipeline(true);
    pipe.watch(&["k"]).await?;
    pipe.multi()?;
    assert!(matches!(pipe.multi(), Err(RedisError::Usage(_))));
    assert!(matches!(
        pipe.watch(&["other"]).await,
        Err(RedisError::Usage(_))
    ));
    pipe.reset().await;
    assert_eq!(pipe.state(), PipelineState::Buffering);

    // buffered commands without a WATCH forbid a late multi()
    let mut pipe = pool.pipeline(false);
    pipe.command(Command::new("PING"), CommandOptions::default())
        .await?;
    assert!(matches!(pipe.multi(), Err(RedisError::Usage(_))));
    pipe.reset().await;

    pool.close().await;
    Ok(())
}
