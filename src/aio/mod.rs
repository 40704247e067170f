//! The asynchronous core: pipelined connections and the connection pool.

use tokio::task::JoinHandle;

mod connection;
mod pipeline;
mod pool;
mod pubsub;

pub use connection::{connect, Connection, ConnectionDriver};
pub use pipeline::ConnectionCounters;
pub use pool::{MaxConnections, Pool, PoolConfig, PooledConnection, RetryConfig};
pub use pubsub::{MessageCallback, Msg, SubscriptionCallback};

/// Holds a spawned task and aborts it on drop, so background work never
/// outlives its owner.
#[derive(Debug)]
pub(crate) struct HandleContainer(Option<JoinHandle<()>>);

impl HandleContainer {
    pub(crate) fn new(handle: JoinHandle<()>) -> Self {
        HandleContainer(Some(handle))
    }
}

impl Drop for HandleContainer {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}
