//! An asynchronous client library for Redis(TM), built on tokio.
//!
//! The crate covers the client core: the RESP2 wire codec, the
//! connection layer with its background read task, a bounded connection
//! pool, the pipeline/transaction engine, and a publish/subscribe
//! multiplexer. The typed command catalog is deliberately not part of
//! this crate; commands go through the generic execute path with the
//! universal [`Value`] reply type.
//!
//! # Example
//!
//! ```rust,no_run
//! use redisconnect::{Arg, CommandOptions, Pool, RedisResult};
//!
//! async fn roundtrip() -> RedisResult<()> {
//!     let pool = Pool::from_url("redis://localhost:6379?max_size=4").await?;
//!     pool.execute(
//!         "SET",
//!         vec![Arg::from("greeting"), Arg::from("hello")],
//!         CommandOptions::default(),
//!     )
//!     .await?;
//!     let reply = pool
//!         .execute("GET", vec![Arg::from("greeting")], CommandOptions::default())
//!         .await?;
//!     assert_eq!(reply.into_bytes()?, b"hello".to_vec());
//!     pool.close().await;
//!     pool.wait_closed().await;
//!     Ok(())
//! }
//! ```

#![deny(missing_debug_implementations)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

#[macro_use]
extern crate log;

mod conn;
mod pipeline;
mod pool;
pub mod protocol;
mod pubsub;
mod redis_error;
pub mod url;

pub use crate::conn::{
    Addr, ConnectParams, ConnectParamsBuilder, Connection, ConnectionConfiguration,
    ConnectionStatus, IntoConnectParams, ReconnectHook, ServerCerts, Tls,
};
pub use crate::pipeline::{Pipeline, PipelineState, Script};
pub use crate::pool::{Pool, PoolConfiguration, PooledConnection};
pub use crate::protocol::{Arg, Command, CommandOptions, DecodePolicy, ToArg, Value};
pub use crate::pubsub::{MessageHandler, PubSub, PubSubExceptionHandler, PubSubMessage};
pub use crate::redis_error::{RedisError, RedisResult};
