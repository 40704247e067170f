use std::{error, fmt, io, sync::Arc};

use arcstr::ArcStr;

use crate::errors::server_error::{ServerError, ServerErrorKind};

/// An enum of all error kinds.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The parser could not make sense of the server response.  The
    /// connection that produced it is no longer usable.
    Parse,
    /// The authentication with the server failed.
    AuthenticationFailed,
    /// An error that was caused because the parameters to the client were
    /// wrong.
    InvalidClientConfig,
    /// An underlying transport failure.
    Io,
    /// An error raised on the client before anything touched the wire.
    Client,
    /// The connection is closed, closing, or was closed while the operation
    /// was in flight.
    ConnectionClosed,
    /// The pool was closed and does not give out connections anymore.
    PoolClosed,
    /// A connection could not be acquired within the configured deadline.
    AcquireTimeout,
    /// The pool has no connection targets to connect to.
    NoConnectionTargets,
    /// A subscribe-family command was issued on a connection that does not
    /// allow subscriptions.
    SubscriptionsDisabled,
    /// An error returned from the server.
    Server(ServerErrorKind),
    /// A server error code this library does not know.
    Extension,
}

/// Represents a redis error.
///
/// For the most part you should be using the `Error` trait to interact with
/// this rather than the actual struct.
#[derive(Clone)]
pub struct RedisError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    General(ErrorKind, &'static str, Option<ArcStr>),
    Internal {
        kind: ErrorKind,
        err: Arc<dyn error::Error + Send + Sync>,
    },
    Server(ServerError),
}

impl PartialEq for RedisError {
    fn eq(&self, other: &RedisError) -> bool {
        match (&self.repr, &other.repr) {
            (&ErrorRepr::General(kind_a, _, _), &ErrorRepr::General(kind_b, _, _)) => {
                kind_a == kind_b
            }
            (ErrorRepr::Server(a), ErrorRepr::Server(b)) => *a == *b,
            _ => false,
        }
    }
}

impl From<io::Error> for RedisError {
    fn from(err: io::Error) -> RedisError {
        RedisError {
            repr: ErrorRepr::Internal {
                kind: ErrorKind::Io,
                err: Arc::new(err),
            },
        }
    }
}

impl From<(ErrorKind, &'static str)> for RedisError {
    fn from((kind, desc): (ErrorKind, &'static str)) -> RedisError {
        RedisError {
            repr: ErrorRepr::General(kind, desc, None),
        }
    }
}

impl From<(ErrorKind, &'static str, String)> for RedisError {
    fn from((kind, desc, detail): (ErrorKind, &'static str, String)) -> RedisError {
        RedisError {
            repr: ErrorRepr::General(kind, desc, Some(detail.into())),
        }
    }
}

impl From<ServerError> for RedisError {
    fn from(err: ServerError) -> Self {
        Self {
            repr: ErrorRepr::Server(err),
        }
    }
}

impl From<ServerErrorKind> for ErrorKind {
    fn from(kind: ServerErrorKind) -> Self {
        ErrorKind::Server(kind)
    }
}

impl error::Error for RedisError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Internal { err, .. } => Some(err),
            ErrorRepr::Server(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Debug for RedisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for RedisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match &self.repr {
            ErrorRepr::General(kind, desc, detail) => {
                desc.fmt(f)?;
                f.write_str(" - ")?;
                fmt::Debug::fmt(&kind, f)?;
                if let Some(detail) = detail {
                    f.write_str(": ")?;
                    detail.fmt(f)?;
                }
                Ok(())
            }
            ErrorRepr::Internal { err, .. } => err.fmt(f),
            ErrorRepr::Server(err) => err.fmt(f),
        }
    }
}

impl RedisError {
    /// Returns the kind of the error.
    pub fn kind(&self) -> ErrorKind {
        match &self.repr {
            ErrorRepr::General(kind, _, _) => *kind,
            ErrorRepr::Internal { kind, .. } => *kind,
            ErrorRepr::Server(err) => match err.kind() {
                Some(kind) => ErrorKind::Server(kind),
                None => ErrorKind::Extension,
            },
        }
    }

    /// Returns the error detail.
    pub fn detail(&self) -> Option<&str> {
        match &self.repr {
            ErrorRepr::General(_, _, detail) => detail.as_ref().map(|detail| detail.as_str()),
            ErrorRepr::Server(err) => err.details(),
            _ => None,
        }
    }

    /// Returns the raw server error code if this is a server error.
    pub fn code(&self) -> Option<&str> {
        match &self.repr {
            ErrorRepr::Server(err) => Some(err.code()),
            _ => None,
        }
    }

    /// Indicates that this failure is an IO failure.
    pub fn is_io_error(&self) -> bool {
        self.kind() == ErrorKind::Io
    }

    pub(crate) fn as_io_error(&self) -> Option<&io::Error> {
        match &self.repr {
            ErrorRepr::Internal { err, .. } => err.downcast_ref(),
            _ => None,
        }
    }

    /// Returns true if the error was caused by an I/O time out.
    /// Note that this may not be accurate depending on platform.
    pub fn is_timeout(&self) -> bool {
        self.as_io_error().is_some_and(|err| {
            matches!(
                err.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            )
        })
    }

    /// Returns true if the error was caused by a dropped connection.
    pub fn is_connection_dropped(&self) -> bool {
        match &self.repr {
            ErrorRepr::General(kind, _, _) => {
                matches!(kind, ErrorKind::Io | ErrorKind::ConnectionClosed)
            }
            ErrorRepr::Internal { .. } => self.as_io_error().is_some_and(|err| {
                matches!(
                    err.kind(),
                    io::ErrorKind::BrokenPipe
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionRefused
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::UnexpectedEof
                        | io::ErrorKind::NotConnected
                )
            }),
            _ => false,
        }
    }

    /// Returns true if the error means the connection must be replaced:
    /// either the transport failed or the protocol stream is desynced.
    pub fn is_unrecoverable_error(&self) -> bool {
        match self.kind() {
            ErrorKind::Parse | ErrorKind::ConnectionClosed => true,
            ErrorKind::Io => self.is_connection_dropped(),
            _ => false,
        }
    }
}

/// The error every operation on a closed connection fails with.
pub(crate) fn closed_connection_error() -> RedisError {
    RedisError::from((ErrorKind::ConnectionClosed, "Connection closed"))
}

/// The error every lease on a closed pool fails with.
pub(crate) fn pool_closed_error() -> RedisError {
    RedisError::from((ErrorKind::PoolClosed, "Pool has been closed"))
}
