mod redis_error;
mod server_error;

pub use redis_error::{ErrorKind, RedisError};
pub(crate) use redis_error::{closed_connection_error, pool_closed_error};
pub use server_error::{ServerError, ServerErrorKind};
