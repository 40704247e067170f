use std::collections::{HashSet, VecDeque};
use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use log::{debug, trace, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time;

use crate::aio::connection::{connect, Connection, ConnectionDriver};
use crate::aio::pubsub::{
    route_messages, subscription_count, MessageCallback, Msg, SubscriptionCallback,
    SubscriptionEntry, SubscriptionKind, SubscriptionRegistry,
};
use crate::aio::HandleContainer;
use crate::cmd::{cmd, Cmd};
use crate::connection_info::{ConnectionAddr, ConnectionInfo, IntoConnectionInfo, RedisConnectionInfo};
use crate::errors::{pool_closed_error, ErrorKind, RedisError};
use crate::rotator::AddressRotator;
use crate::types::{RedisResult, Value};

/// How the pool bounds its connection count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaxConnections {
    /// Hard cap on the total number of connections; leases beyond it wait.
    Strict(usize),
    /// Caps only the *preserved idle* connections.  Leases never wait for
    /// capacity, and surplus connections are closed when they come back.
    Leaky(usize),
}

/// Reconnect pacing for the connection factory.
///
/// Attempt `n` sleeps `initial_delay * factor^n` (with jitter) before
/// running, and the whole acquisition gives up after `timeout`.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Overall deadline for acquiring one connection, attempts included.
    pub timeout: Duration,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after every failed attempt.
    pub factor: f32,
    /// Attempts after the first try.
    pub max_attempts: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            timeout: Duration::from_secs(10),
            initial_delay: Duration::from_millis(100),
            factor: 2.0,
            max_attempts: 6,
        }
    }
}

/// The configuration for a [`Pool`].
#[derive(Clone)]
pub struct PoolConfig {
    addresses: Vec<ConnectionAddr>,
    redis: RedisConnectionInfo,
    max_connections: MaxConnections,
    min_connections: usize,
    retry: RetryConfig,
    on_unexpected_closure: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl std::fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConfig")
            .field("addresses", &self.addresses)
            .field("max_connections", &self.max_connections)
            .field("min_connections", &self.min_connections)
            .field("retry", &self.retry)
            .field(
                "on_unexpected_closure",
                if self.on_unexpected_closure.is_some() {
                    &"set"
                } else {
                    &"not set"
                },
            )
            .finish()
    }
}

impl PoolConfig {
    /// Creates a configuration with default sizing over the given targets.
    pub fn new(addresses: Vec<ConnectionAddr>) -> PoolConfig {
        PoolConfig {
            addresses,
            redis: RedisConnectionInfo::default(),
            max_connections: MaxConnections::Strict(10),
            min_connections: 1,
            retry: RetryConfig::default(),
            on_unexpected_closure: None,
        }
    }

    /// Creates a configuration from a `redis://` URL, taking the address,
    /// database and credentials from it.
    pub fn from_url(url: &str) -> RedisResult<PoolConfig> {
        let ConnectionInfo { addr, redis } = url.into_connection_info()?;
        let mut config = PoolConfig::new(vec![addr]);
        config.redis = redis;
        Ok(config)
    }

    /// Sets the password sent as `AUTH` on every new connection.
    pub fn set_password(mut self, password: impl Into<String>) -> PoolConfig {
        self.redis.password = Some(password.into());
        self
    }

    /// Sets the username used together with the password for `AUTH`.
    pub fn set_username(mut self, username: impl Into<String>) -> PoolConfig {
        self.redis.username = Some(username.into());
        self
    }

    /// Sets the database every new connection `SELECT`s into.
    pub fn set_database(mut self, db: i64) -> PoolConfig {
        self.redis.db = db;
        self
    }

    /// Sets the sizing mode.
    pub fn set_max_connections(mut self, max: MaxConnections) -> PoolConfig {
        self.max_connections = max;
        self
    }

    /// Sets the idle floor the pool maintains once activated.
    pub fn set_min_connections(mut self, min: usize) -> PoolConfig {
        self.min_connections = min;
        self
    }

    /// Sets the reconnect pacing.
    pub fn set_retry(mut self, retry: RetryConfig) -> PoolConfig {
        self.retry = retry;
        self
    }

    /// Installs a callback invoked whenever a pooled connection's socket
    /// closes without the pool having asked for it.
    pub fn set_on_unexpected_closure(
        mut self,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> PoolConfig {
        self.on_unexpected_closure = Some(Arc::new(callback));
        self
    }
}

/// Why a connection is being handed out.
#[derive(Clone, Copy, PartialEq, Eq)]
enum LeasePurpose {
    Caller,
    PubSub,
}

struct Waiter {
    purpose: LeasePurpose,
    reply: oneshot::Sender<RedisResult<Connection>>,
}

enum PoolRequest {
    Activate,
    Lease {
        purpose: LeasePurpose,
        reply: oneshot::Sender<RedisResult<Connection>>,
    },
    Return {
        conn: Connection,
    },
    CreationDone {
        result: RedisResult<(Connection, ConnectionDriver)>,
    },
    ConnectionTerminated {
        id: u64,
    },
    GetPubSub {
        kind: SubscriptionKind,
        reply: oneshot::Sender<Option<(Connection, Vec<String>)>>,
    },
    RegisterSubscriptions {
        conn_id: u64,
        kind: SubscriptionKind,
        entries: Vec<(String, SubscriptionEntry)>,
        reply: oneshot::Sender<()>,
    },
    Unregister {
        conn_id: u64,
        kind: SubscriptionKind,
        name: String,
        remaining: i64,
    },
    UpdateAddresses {
        addresses: Vec<ConnectionAddr>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// A connection leased from a [`Pool`].
///
/// Dereferences to [`Connection`]; dropping the guard returns the connection
/// to the pool exactly once.
#[derive(Debug)]
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: mpsc::UnboundedSender<PoolRequest>,
}

impl PooledConnection {
    /// The leased connection.
    pub fn connection(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.connection()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // pool gone means nothing to return to; the connection closes
            // itself once this last handle is dropped
            let _ = self.pool.send(PoolRequest::Return { conn });
        }
    }
}

/// A bounded pool of pipelined connections to one logical server.
///
/// The pool hands out whole connections ([`Pool::lease`]) or runs single
/// commands over a transient lease ([`Pool::send`]), maintains an idle floor,
/// re-establishes connections with exponential backoff, rotates over its
/// target addresses, and dedicates at most one connection to pubsub while
/// subscriptions exist.
///
/// All pool state lives in one task; handles are cheap clones that post
/// messages to it, so the pool can be driven from any task or thread.  The
/// state task is aborted when the last handle is dropped.
#[derive(Clone, Debug)]
pub struct Pool {
    sender: mpsc::UnboundedSender<PoolRequest>,
    lease_timeout: Duration,
    _task: Arc<HandleContainer>,
}

impl Pool {
    /// Creates a pool.  Must be called within a tokio runtime.  No
    /// connection is made until the pool is activated or the first lease
    /// arrives.
    pub fn new(config: PoolConfig) -> RedisResult<Pool> {
        if config.addresses.is_empty() {
            return Err((
                ErrorKind::NoConnectionTargets,
                "At least one connection target is required",
            )
                .into());
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        let lease_timeout = config.retry.timeout;
        let rotator = Arc::new(AddressRotator::new(config.addresses.clone()));
        let inner = PoolInner {
            config,
            rotator,
            requests: sender.clone(),
            available: Vec::new(),
            leased: HashSet::new(),
            live: HashSet::new(),
            pending_creations: 0,
            waiters: VecDeque::new(),
            pubsub: None,
            activated: false,
            closed: false,
            close_waiters: Vec::new(),
        };
        let task = HandleContainer::new(tokio::spawn(inner.run(receiver)));
        Ok(Pool {
            sender,
            lease_timeout,
            _task: Arc::new(task),
        })
    }

    /// Starts maintaining the configured idle floor.  Idempotent.
    pub fn activate(&self) {
        let _ = self.sender.send(PoolRequest::Activate);
    }

    /// Leases a connection.  Resolves with an idle connection when one
    /// exists, a freshly created one when capacity allows, and otherwise
    /// waits (FIFO) until a connection is returned, up to the retry timeout.
    pub async fn lease(&self) -> RedisResult<PooledConnection> {
        let conn = self.acquire(LeasePurpose::Caller).await?;
        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.sender.clone(),
        })
    }

    /// Runs `body` against a single leased connection: every command issued
    /// on it runs on the same physical connection, and the connection is
    /// returned exactly once when the returned future resolves.
    pub async fn lease_connection<F, Fut, T>(&self, body: F) -> RedisResult<T>
    where
        F: FnOnce(Connection) -> Fut,
        Fut: std::future::Future<Output = RedisResult<T>>,
    {
        let leased = self.lease().await?;
        let result = body(leased.connection().clone()).await;
        drop(leased);
        result
    }

    /// Sends one command over a transient lease.
    pub async fn send(&self, command: Cmd) -> RedisResult<Value> {
        let leased = self.lease().await?;
        leased.send(&command).await
    }

    /// Replaces the set of target addresses used for new connections.
    /// Existing connections are not touched.
    pub fn update_connection_addresses(&self, addresses: Vec<ConnectionAddr>) {
        let _ = self.sender.send(PoolRequest::UpdateAddresses { addresses });
    }

    /// Subscribes to the given channels, delivering published messages to
    /// `on_message`.
    pub async fn subscribe<F>(&self, channels: &[&str], on_message: F) -> RedisResult<()>
    where
        F: Fn(Msg) + Send + Sync + 'static,
    {
        self.subscribe_with_handlers(channels, Arc::new(on_message), None, None)
            .await
    }

    /// Subscribes to the given channels with optional confirmation handlers:
    /// `on_subscribe` runs per confirmed channel, `on_unsubscribe` runs when
    /// that channel is later unsubscribed, both with the connection's
    /// remaining subscription count.
    pub async fn subscribe_with_handlers(
        &self,
        channels: &[&str],
        on_message: MessageCallback,
        on_subscribe: Option<SubscriptionCallback>,
        on_unsubscribe: Option<SubscriptionCallback>,
    ) -> RedisResult<()> {
        self.subscribe_impl(
            SubscriptionKind::Channel,
            channels,
            on_message,
            on_subscribe,
            on_unsubscribe,
        )
        .await
    }

    /// Subscribes to the given patterns, delivering matching published
    /// messages to `on_message`.
    pub async fn psubscribe<F>(&self, patterns: &[&str], on_message: F) -> RedisResult<()>
    where
        F: Fn(Msg) + Send + Sync + 'static,
    {
        self.psubscribe_with_handlers(patterns, Arc::new(on_message), None, None)
            .await
    }

    /// Pattern variant of [`Pool::subscribe_with_handlers`].
    pub async fn psubscribe_with_handlers(
        &self,
        patterns: &[&str],
        on_message: MessageCallback,
        on_subscribe: Option<SubscriptionCallback>,
        on_unsubscribe: Option<SubscriptionCallback>,
    ) -> RedisResult<()> {
        self.subscribe_impl(
            SubscriptionKind::Pattern,
            patterns,
            on_message,
            on_subscribe,
            on_unsubscribe,
        )
        .await
    }

    /// Unsubscribes from the given channels, or from all channels when the
    /// list is empty.  A no-op when no pubsub connection is pinned.
    pub async fn unsubscribe(&self, channels: &[&str]) -> RedisResult<()> {
        self.unsubscribe_impl(SubscriptionKind::Channel, channels).await
    }

    /// Pattern variant of [`Pool::unsubscribe`].
    pub async fn punsubscribe(&self, patterns: &[&str]) -> RedisResult<()> {
        self.unsubscribe_impl(SubscriptionKind::Pattern, patterns).await
    }

    /// Closes the pool: new leases fail, idle connections close now, and the
    /// returned future resolves once every connection has been returned and
    /// finished closing.  Idempotent.
    pub async fn close(&self) -> RedisResult<()> {
        let (done, wait) = oneshot::channel();
        if self.sender.send(PoolRequest::Close { done }).is_err() {
            return Ok(());
        }
        let _ = wait.await;
        Ok(())
    }

    async fn acquire(&self, purpose: LeasePurpose) -> RedisResult<Connection> {
        let (reply, receiver) = oneshot::channel();
        self.sender
            .send(PoolRequest::Lease { purpose, reply })
            .map_err(|_| pool_closed_error())?;
        match time::timeout(self.lease_timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(pool_closed_error()),
            Err(_) => Err((
                ErrorKind::AcquireTimeout,
                "Timed out acquiring a connection from the pool",
            )
                .into()),
        }
    }

    async fn subscribe_impl(
        &self,
        kind: SubscriptionKind,
        names: &[&str],
        on_message: MessageCallback,
        on_subscribe: Option<SubscriptionCallback>,
        on_unsubscribe: Option<SubscriptionCallback>,
    ) -> RedisResult<()> {
        if names.is_empty() {
            return Ok(());
        }
        let conn = self.acquire(LeasePurpose::PubSub).await?;
        let entries = names
            .iter()
            .map(|name| {
                (
                    name.to_string(),
                    SubscriptionEntry {
                        on_message: on_message.clone(),
                        on_unsubscribe: on_unsubscribe.clone(),
                    },
                )
            })
            .collect();
        // Registration completes before the commands hit the wire so the
        // first published message already finds its callback.
        let (registered, ack) = oneshot::channel();
        let _ = self.sender.send(PoolRequest::RegisterSubscriptions {
            conn_id: conn.id(),
            kind,
            entries,
            reply: registered,
        });
        let _ = ack.await;
        for name in names {
            let mut command = cmd(kind.subscribe_command());
            command.arg(*name);
            let reply = conn.send(&command).await?;
            if let Some((channel, count)) = subscription_count(&reply) {
                if let Some(on_subscribe) = &on_subscribe {
                    on_subscribe(&channel, count.max(0) as usize);
                }
            }
        }
        Ok(())
    }

    async fn unsubscribe_impl(&self, kind: SubscriptionKind, names: &[&str]) -> RedisResult<()> {
        let (reply, receiver) = oneshot::channel();
        if self
            .sender
            .send(PoolRequest::GetPubSub { kind, reply })
            .is_err()
        {
            return Ok(());
        }
        let Some((conn, known)) = receiver.await.unwrap_or(None) else {
            // nothing is pinned for pubsub, so there is nothing to balance
            return Ok(());
        };
        let names: Vec<String> = if names.is_empty() {
            known
        } else {
            names.iter().map(|name| name.to_string()).collect()
        };
        for name in names {
            let mut command = cmd(kind.unsubscribe_command());
            command.arg(&name);
            let reply = conn.send(&command).await?;
            let remaining = subscription_count(&reply)
                .map(|(_, count)| count)
                .unwrap_or(0);
            let _ = self.sender.send(PoolRequest::Unregister {
                conn_id: conn.id(),
                kind,
                name,
                remaining,
            });
        }
        Ok(())
    }
}

struct PubSubState {
    conn: Connection,
    registry: Arc<Mutex<SubscriptionRegistry>>,
    _router: HandleContainer,
}

/// The pool's owned state.  Lives in a single task; every mutation happens
/// through [`PoolRequest`] messages, so no lock guards any of these fields.
struct PoolInner {
    config: PoolConfig,
    rotator: Arc<AddressRotator>,
    requests: mpsc::UnboundedSender<PoolRequest>,
    /// Idle connections, most recently returned last (leases pop the back).
    available: Vec<Connection>,
    /// Ids of connections currently handed out to callers.
    leased: HashSet<u64>,
    /// Ids of all connections whose drivers are still running.
    live: HashSet<u64>,
    pending_creations: usize,
    waiters: VecDeque<Waiter>,
    pubsub: Option<PubSubState>,
    activated: bool,
    closed: bool,
    close_waiters: Vec<oneshot::Sender<()>>,
}

impl PoolInner {
    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<PoolRequest>) {
        while let Some(request) = receiver.recv().await {
            match request {
                PoolRequest::Activate => self.handle_activate(),
                PoolRequest::Lease { purpose, reply } => self.handle_lease(purpose, reply),
                PoolRequest::Return { conn } => self.handle_return(conn),
                PoolRequest::CreationDone { result } => self.handle_creation_done(result),
                PoolRequest::ConnectionTerminated { id } => self.handle_terminated(id),
                PoolRequest::GetPubSub { kind, reply } => self.handle_get_pubsub(kind, reply),
                PoolRequest::RegisterSubscriptions {
                    conn_id,
                    kind,
                    entries,
                    reply,
                } => self.handle_register(conn_id, kind, entries, reply),
                PoolRequest::Unregister {
                    conn_id,
                    kind,
                    name,
                    remaining,
                } => self.handle_unregister(conn_id, kind, name, remaining),
                PoolRequest::UpdateAddresses { addresses } => self.rotator.update(addresses),
                PoolRequest::Close { done } => self.handle_close(done),
            }
        }
    }

    fn total_connections(&self) -> usize {
        self.leased.len()
            + self.available.len()
            + self.pending_creations
            + usize::from(self.pubsub.is_some())
    }

    fn has_capacity_for_new_connection(&self) -> bool {
        match self.config.max_connections {
            MaxConnections::Strict(max) => self.total_connections() < max,
            MaxConnections::Leaky(_) => true,
        }
    }

    fn preserved_idle_cap(&self) -> usize {
        match self.config.max_connections {
            MaxConnections::Strict(max) | MaxConnections::Leaky(max) => max,
        }
    }

    fn handle_activate(&mut self) {
        self.activated = true;
        self.ensure_minimum();
    }

    fn ensure_minimum(&mut self) {
        if !self.activated || self.closed {
            return;
        }
        while self.available.len() + self.pending_creations < self.config.min_connections
            && self.has_capacity_for_new_connection()
        {
            self.spawn_creation();
        }
    }

    fn spawn_creation(&mut self) {
        self.pending_creations += 1;
        let rotator = self.rotator.clone();
        let redis = self.config.redis.clone();
        let retry = self.config.retry.clone();
        let requests = self.requests.clone();
        trace!("creating a new pooled connection");
        tokio::spawn(async move {
            let result = create_connection(rotator, redis, retry).await;
            let _ = requests.send(PoolRequest::CreationDone { result });
        });
    }

    fn install_driver(&self, conn: &Connection, driver: ConnectionDriver) {
        let id = conn.id();
        let flags = conn.shared_flags();
        let requests = self.requests.clone();
        let callback = self.config.on_unexpected_closure.clone();
        tokio::spawn(async move {
            driver.await;
            let unexpected = !flags
                .close_requested
                .load(std::sync::atomic::Ordering::SeqCst);
            if unexpected {
                debug!("pooled connection {id} closed unexpectedly");
                if let Some(callback) = &callback {
                    callback();
                }
            }
            let _ = requests.send(PoolRequest::ConnectionTerminated { id });
        });
    }

    fn spawn_close(conn: Connection) {
        tokio::spawn(async move {
            let _ = conn.close().await;
        });
    }

    fn handle_lease(&mut self, purpose: LeasePurpose, reply: oneshot::Sender<RedisResult<Connection>>) {
        if self.closed {
            let _ = reply.send(Err(pool_closed_error()));
            return;
        }
        if purpose == LeasePurpose::PubSub {
            if let Some(state) = &self.pubsub {
                let _ = reply.send(Ok(state.conn.clone()));
                return;
            }
        }
        while let Some(conn) = self.available.pop() {
            if conn.is_closed() {
                // terminated connections are purged lazily; the termination
                // event already dropped it from `live`
                continue;
            }
            let id = conn.id();
            match purpose {
                LeasePurpose::Caller => match reply.send(Ok(conn)) {
                    Ok(()) => {
                        self.leased.insert(id);
                    }
                    Err(result) => {
                        if let Ok(conn) = result {
                            self.available.push(conn);
                        }
                    }
                },
                LeasePurpose::PubSub => {
                    if reply.send(Ok(conn.clone())).is_ok() {
                        self.pin(conn);
                    } else {
                        self.available.push(conn);
                    }
                }
            }
            return;
        }
        if self.has_capacity_for_new_connection() {
            self.spawn_creation();
        }
        self.waiters.push_back(Waiter { purpose, reply });
    }

    fn handle_return(&mut self, conn: Connection) {
        let id = conn.id();
        if !self.leased.remove(&id) {
            debug_assert!(false, "connection {id} was returned twice or never leased");
            return;
        }
        if self.closed {
            Self::spawn_close(conn);
            self.check_close_complete();
            return;
        }
        if conn.is_closed() {
            debug!("leased connection {id} came back dead");
            self.ensure_minimum();
            return;
        }
        self.hand_off(conn);
        self.ensure_minimum();
    }

    /// Gives a usable connection a new home: the oldest live waiter, the
    /// idle list, or a close when the idle list is already at its cap.
    fn hand_off(&mut self, mut conn: Connection) {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.reply.is_closed() {
                continue;
            }
            let id = conn.id();
            match waiter.purpose {
                LeasePurpose::Caller => match waiter.reply.send(Ok(conn)) {
                    Ok(()) => {
                        self.leased.insert(id);
                        return;
                    }
                    Err(result) => match result {
                        Ok(returned) => conn = returned,
                        Err(_) => return,
                    },
                },
                LeasePurpose::PubSub => {
                    if let Some(state) = &self.pubsub {
                        // someone pinned a connection while this waiter was
                        // queued; share it and keep looking for a home
                        let _ = waiter.reply.send(Ok(state.conn.clone()));
                        continue;
                    }
                    if waiter.reply.send(Ok(conn.clone())).is_ok() {
                        self.pin(conn);
                        return;
                    }
                }
            }
        }
        if self.available.len() >= self.preserved_idle_cap() {
            debug!("idle list full; closing returned connection {}", conn.id());
            Self::spawn_close(conn);
        } else {
            self.available.push(conn);
        }
    }

    fn handle_creation_done(&mut self, result: RedisResult<(Connection, ConnectionDriver)>) {
        self.pending_creations -= 1;
        match result {
            Ok((conn, driver)) => {
                self.install_driver(&conn, driver);
                self.live.insert(conn.id());
                if self.closed {
                    Self::spawn_close(conn);
                } else {
                    self.hand_off(conn);
                }
            }
            Err(err) => {
                warn!("failed to establish a pooled connection: {err}");
                // the oldest live waiter inherits the failure
                while let Some(waiter) = self.waiters.pop_front() {
                    if waiter.reply.is_closed() {
                        continue;
                    }
                    let _ = waiter.reply.send(Err(err));
                    break;
                }
            }
        }
        self.check_close_complete();
        self.ensure_minimum();
    }

    fn handle_terminated(&mut self, id: u64) {
        self.live.remove(&id);
        self.available.retain(|conn| conn.id() != id);
        if self
            .pubsub
            .as_ref()
            .is_some_and(|state| state.conn.id() == id)
        {
            warn!("pubsub connection closed; active subscriptions were dropped");
            self.pubsub = None;
        }
        self.check_close_complete();
        self.ensure_minimum();
    }

    fn handle_get_pubsub(
        &mut self,
        kind: SubscriptionKind,
        reply: oneshot::Sender<Option<(Connection, Vec<String>)>>,
    ) {
        let response = self.pubsub.as_ref().map(|state| {
            let names = state.registry.lock().unwrap().names(kind);
            (state.conn.clone(), names)
        });
        let _ = reply.send(response);
    }

    fn handle_register(
        &mut self,
        conn_id: u64,
        kind: SubscriptionKind,
        entries: Vec<(String, SubscriptionEntry)>,
        reply: oneshot::Sender<()>,
    ) {
        if let Some(state) = &self.pubsub {
            if state.conn.id() == conn_id {
                let mut registry = state.registry.lock().unwrap();
                for (name, entry) in entries {
                    registry.entries(kind).insert(name, entry);
                }
            }
        }
        let _ = reply.send(());
    }

    fn handle_unregister(
        &mut self,
        conn_id: u64,
        kind: SubscriptionKind,
        name: String,
        remaining: i64,
    ) {
        let Some(state) = &self.pubsub else {
            return;
        };
        if state.conn.id() != conn_id {
            return;
        }
        let removed = {
            let mut registry = state.registry.lock().unwrap();
            registry.entries(kind).remove(&name)
        };
        if let Some(entry) = removed {
            if let Some(on_unsubscribe) = entry.on_unsubscribe {
                on_unsubscribe(&name, remaining.max(0) as usize);
            }
        }
        if remaining <= 0 {
            self.unpin();
        }
    }

    /// Dedicates a connection to pubsub: subscriptions become legal on it and
    /// published messages start flowing to the router.
    fn pin(&mut self, conn: Connection) {
        debug_assert!(self.pubsub.is_none(), "a pubsub connection is already pinned");
        conn.set_allow_subscriptions(true);
        let (sender, receiver) = mpsc::unbounded_channel::<Msg>();
        conn.install_msg_sender(Some(sender));
        let registry = Arc::new(Mutex::new(SubscriptionRegistry::default()));
        let router = HandleContainer::new(tokio::spawn(route_messages(receiver, registry.clone())));
        debug!("pinned connection {} for pubsub", conn.id());
        self.pubsub = Some(PubSubState {
            conn,
            registry,
            _router: router,
        });
    }

    /// Releases the pinned pubsub connection back into general use.
    fn unpin(&mut self) {
        let Some(state) = self.pubsub.take() else {
            return;
        };
        let PubSubState {
            conn,
            registry,
            _router,
        } = state;
        drop(_router);
        conn.set_allow_subscriptions(false);
        conn.install_msg_sender(None);
        {
            let mut registry = registry.lock().unwrap();
            if !registry.is_empty() {
                debug!("server reported no remaining subscriptions; clearing local registry");
                registry.channels.clear();
                registry.patterns.clear();
            }
        }
        debug!("unpinned pubsub connection {}", conn.id());
        self.hand_off(conn);
    }

    fn handle_close(&mut self, done: oneshot::Sender<()>) {
        if !self.closed {
            self.closed = true;
            debug!("closing connection pool");
            for waiter in self.waiters.drain(..) {
                let _ = waiter.reply.send(Err(pool_closed_error()));
            }
            for conn in self.available.drain(..) {
                Self::spawn_close(conn);
            }
            if let Some(state) = self.pubsub.take() {
                state.conn.set_allow_subscriptions(false);
                Self::spawn_close(state.conn.clone());
            }
        }
        self.close_waiters.push(done);
        self.check_close_complete();
    }

    fn check_close_complete(&mut self) {
        if !self.closed || !self.live.is_empty() || self.pending_creations > 0 {
            return;
        }
        for done in self.close_waiters.drain(..) {
            let _ = done.send(());
        }
    }
}

/// Opens one connection, rotating over targets and backing off between
/// attempts, bounded by the retry timeout.
async fn create_connection(
    rotator: Arc<AddressRotator>,
    redis: RedisConnectionInfo,
    retry: RetryConfig,
) -> RedisResult<(Connection, ConnectionDriver)> {
    let connect_once = || async {
        let Some(addr) = rotator.next_target() else {
            return Err(RedisError::from((
                ErrorKind::NoConnectionTargets,
                "No connection targets configured",
            )));
        };
        let info = ConnectionInfo {
            addr,
            redis: redis.clone(),
        };
        connect(&info).await
    };
    let strategy = ExponentialBuilder::default()
        .with_min_delay(retry.initial_delay)
        .with_factor(retry.factor)
        .with_max_times(retry.max_attempts)
        .with_jitter();
    let attempts = connect_once
        .retry(strategy)
        .sleep(|duration| async move { time::sleep(duration).await })
        .when(|err: &RedisError| err.kind() != ErrorKind::NoConnectionTargets);
    match time::timeout(retry.timeout, attempts).await {
        Ok(result) => result,
        Err(_) => Err((
            ErrorKind::AcquireTimeout,
            "Timed out establishing a connection",
        )
            .into()),
    }
}
