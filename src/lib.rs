//! redis-pool is the core of a pooled Redis client: a RESP codec, a strict
//! FIFO command pipeline per connection, and a size-bounded connection pool
//! with pubsub support.
//!
//! # Basic Operation
//!
//! A [`Pool`] is configured with one or more target addresses and hands out
//! pipelined connections.  The simplest way to talk to the server is to let
//! the pool manage the lease per command:
//!
//! ```rust,no_run
//! # async fn run() -> redis_pool::RedisResult<()> {
//! use redis_pool::{cmd, Pool, PoolConfig};
//!
//! let pool = Pool::new(PoolConfig::from_url("redis://127.0.0.1/")?)?;
//! pool.activate();
//!
//! let mut set = cmd("SET");
//! set.arg("key").arg("value");
//! pool.send(set).await?;
//! # Ok(())
//! # }
//! ```
//!
//! When several commands must run on the same physical connection, lease one
//! explicitly.  The connection is returned to the pool exactly once, when
//! the guard drops:
//!
//! ```rust,no_run
//! # async fn run() -> redis_pool::RedisResult<()> {
//! # let pool = redis_pool::Pool::new(redis_pool::PoolConfig::from_url("redis://127.0.0.1/")?)?;
//! use redis_pool::cmd;
//!
//! let conn = pool.lease().await?;
//! conn.send(&cmd("MULTI")).await?;
//! conn.send(cmd("INCR").arg("counter")).await?;
//! conn.send(&cmd("EXEC")).await?;
//! drop(conn);
//! # Ok(())
//! # }
//! ```
//!
//! # Ordering
//!
//! Commands sent on one connection resolve strictly in the order they were
//! accepted.  Between connections no order is guaranteed; the pool may route
//! consecutive [`Pool::send`] calls over different connections.
//!
//! # Pub/Sub
//!
//! While any subscription is active the pool dedicates a single connection
//! to it.  Messages are delivered to the callback registered per channel or
//! pattern; when the last subscription ends the connection returns to
//! general use:
//!
//! ```rust,no_run
//! # async fn run() -> redis_pool::RedisResult<()> {
//! # let pool = redis_pool::Pool::new(redis_pool::PoolConfig::from_url("redis://127.0.0.1/")?)?;
//! pool.subscribe(&["news"], |msg| {
//!     println!("{}: {:?}", msg.get_channel_name(), msg.get_payload_bytes());
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Connection Parameters
//!
//! [`PoolConfig::from_url`] accepts `redis://` URLs in the format
//! `redis://[<username>][:<password>@]<hostname>[:port][/<db>]`; database
//! and credentials are applied to every connection the pool creates.

#![deny(unsafe_code)]

mod cmd;
mod connection_info;
mod errors;
mod parser;
mod rotator;
mod types;

pub mod aio;

pub use crate::aio::{
    connect, Connection, ConnectionCounters, ConnectionDriver, MaxConnections, MessageCallback,
    Msg, Pool, PoolConfig, PooledConnection, RetryConfig, SubscriptionCallback,
};
pub use crate::cmd::{cmd, Cmd};
pub use crate::connection_info::{
    parse_redis_url, ConnectionAddr, ConnectionInfo, IntoConnectionInfo, RedisConnectionInfo,
};
pub use crate::errors::{ErrorKind, RedisError, ServerError, ServerErrorKind};
pub use crate::parser::{encode_value, parse_redis_value, ValueCodec};
pub use crate::rotator::AddressRotator;
pub use crate::types::{RedisResult, RedisWrite, ToRedisArgs, Value};
