use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::{future, pin_mut};
use log::debug;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::codec::Decoder;

use crate::aio::pipeline::{ConnectionCounters, Pipeline};
use crate::aio::pubsub::Msg;
use crate::cmd::{cmd, Cmd};
use crate::connection_info::{ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use crate::errors::ErrorKind;
use crate::parser::ValueCodec;
use crate::types::{RedisResult, Value};

/// The future that moves a connection's I/O.  It must be spawned; the
/// connection is inert until it runs, and its completion means the socket is
/// gone.
pub struct ConnectionDriver(Pin<Box<dyn Future<Output = ()> + Send>>);

impl fmt::Debug for ConnectionDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDriver").finish_non_exhaustive()
    }
}

impl Future for ConnectionDriver {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0.as_mut().poll(cx)
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
pub(crate) struct ConnectionFlags {
    pub(crate) allow_subscriptions: AtomicBool,
    pub(crate) close_requested: AtomicBool,
}

/// A single pipelined connection to one server.
///
/// The handle is cheap to clone; all clones share the underlying socket and
/// its strict FIFO request/response pipeline.  Commands sent through any
/// clone resolve in the order they were accepted.
#[derive(Clone)]
pub struct Connection {
    pipeline: Pipeline,
    flags: Arc<ConnectionFlags>,
    counters: Arc<ConnectionCounters>,
    id: u64,
}

impl Connection {
    /// Constructs a new `Connection` out of an `AsyncRead + AsyncWrite`
    /// object and connection settings, running the `AUTH`/`SELECT` setup the
    /// settings ask for.  The returned driver future must be spawned.
    pub async fn new<C>(
        connection_info: &RedisConnectionInfo,
        stream: C,
    ) -> RedisResult<(Connection, ConnectionDriver)>
    where
        C: Unpin + AsyncRead + AsyncWrite + Send + 'static,
    {
        fn boxed(f: impl Future<Output = ()> + Send + 'static) -> ConnectionDriver {
            ConnectionDriver(Box::pin(f))
        }

        let codec = ValueCodec::default().framed(stream);
        let counters = Arc::new(ConnectionCounters::default());
        let (pipeline, driver) = Pipeline::new(codec, counters.clone());
        let driver = boxed(driver);
        let con = Connection {
            pipeline,
            flags: Arc::new(ConnectionFlags {
                allow_subscriptions: AtomicBool::new(false),
                close_requested: AtomicBool::new(false),
            }),
            counters,
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
        };
        let driver = {
            let setup = setup_connection(connection_info, &con);
            pin_mut!(setup);

            match future::select(setup, driver).await {
                future::Either::Left((result, driver)) => {
                    result?;
                    driver
                }
                future::Either::Right(((), _)) => {
                    return Err((
                        ErrorKind::ConnectionClosed,
                        "Connection driver unexpectedly terminated during setup",
                    )
                        .into());
                }
            }
        };
        Ok((con, driver))
    }

    /// Sends a command and resolves with the response paired to it.
    ///
    /// Subscribe-family commands fail synchronously unless this connection
    /// [allows subscriptions](Connection::allow_subscriptions); they would
    /// otherwise desync the request/response pairing for every later command
    /// on the connection.
    pub async fn send(&self, command: &Cmd) -> RedisResult<Value> {
        if command.is_subscribe_family() && !self.allow_subscriptions() {
            return Err((
                ErrorKind::SubscriptionsDisabled,
                "Subscriptions are not allowed on this connection",
            )
                .into());
        }
        self.pipeline.send_single(command.get_packed_command()).await
    }

    /// Gracefully closes the connection: in-flight commands still resolve,
    /// new sends fail, and the returned future resolves once the socket has
    /// shut down.  Closing an already closed connection resolves right away.
    pub async fn close(&self) -> RedisResult<()> {
        self.flags.close_requested.store(true, Ordering::SeqCst);
        self.pipeline.close().await;
        Ok(())
    }

    /// True once the connection's driver has terminated; no command sent
    /// through this handle can succeed anymore.
    pub fn is_closed(&self) -> bool {
        self.pipeline.is_closed()
    }

    /// Whether subscribe-family commands are accepted.  Off by default; the
    /// pool flips it on for the single connection it pins for pubsub.
    pub fn allow_subscriptions(&self) -> bool {
        self.flags.allow_subscriptions.load(Ordering::SeqCst)
    }

    /// Changes whether subscribe-family commands are accepted.
    pub fn set_allow_subscriptions(&self, allow: bool) {
        self.flags.allow_subscriptions.store(allow, Ordering::SeqCst);
    }

    /// Response counters for this connection.
    pub fn counters(&self) -> &ConnectionCounters {
        &self.counters
    }

    /// Stable identifier for pool bookkeeping.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn install_msg_sender(&self, sender: Option<UnboundedSender<Msg>>) {
        self.pipeline.install_msg_sender(sender);
    }

    pub(crate) fn shared_flags(&self) -> Arc<ConnectionFlags> {
        self.flags.clone()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Opens a TCP socket to the given address and sets the connection up on it.
pub async fn connect(connection_info: &ConnectionInfo) -> RedisResult<(Connection, ConnectionDriver)> {
    let ConnectionAddr::Tcp(host, port) = &connection_info.addr;
    let stream = TcpStream::connect((host.as_str(), *port)).await?;
    stream.set_nodelay(true)?;
    debug!("connected to {}", connection_info.addr);
    Connection::new(&connection_info.redis, stream).await
}

// Initial setup for every connection.
async fn setup_connection(
    connection_info: &RedisConnectionInfo,
    con: &Connection,
) -> RedisResult<()> {
    if let Some(password) = &connection_info.password {
        let mut command = cmd("AUTH");
        if let Some(username) = &connection_info.username {
            command.arg(username);
        }
        command.arg(password);
        match con.send(&command).await {
            Ok(Value::SimpleString(_)) => (),
            Ok(_) => {
                return Err((
                    ErrorKind::AuthenticationFailed,
                    "Redis server refused to authenticate, returned a non-status reply",
                )
                    .into())
            }
            Err(err) => {
                // Servers that predate ACLs reject the two-argument form;
                // retry with the password alone.
                let is_arity_error = err
                    .detail()
                    .is_some_and(|detail| detail.contains("wrong number of arguments"));
                if connection_info.username.is_some() && is_arity_error {
                    let mut fallback = cmd("AUTH");
                    fallback.arg(password);
                    match con.send(&fallback).await? {
                        Value::SimpleString(_) => (),
                        _ => {
                            return Err((
                                ErrorKind::AuthenticationFailed,
                                "Password authentication failed",
                            )
                                .into())
                        }
                    }
                } else {
                    return Err((
                        ErrorKind::AuthenticationFailed,
                        "Password authentication failed",
                        err.to_string(),
                    )
                        .into());
                }
            }
        }
    }

    if connection_info.db != 0 {
        let mut command = cmd("SELECT");
        command.arg(connection_info.db);
        match con.send(&command).await? {
            Value::SimpleString(_) => (),
            _ => {
                return Err((
                    ErrorKind::InvalidClientConfig,
                    "Redis server refused to switch database",
                )
                    .into())
            }
        }
    }

    Ok(())
}
