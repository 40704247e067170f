use std::fmt;
use std::str::from_utf8;

use crate::errors::RedisError;

/// Library generic result type.
pub type RedisResult<T> = Result<T, RedisError>;

/// A single RESP protocol value.
///
/// This is the lowest level of the crate: everything a server sends back is
/// decoded into a `Value`, and every command is encoded from one (an array of
/// bulk strings).  Nil bulk strings and nil arrays are distinct wire forms
/// (`$-1` vs `*-1`) and are kept distinct here so that encoding a decoded
/// value reproduces the original bytes.
#[derive(PartialEq, Eq, Clone)]
pub enum Value {
    /// A `+` simple string.  Single line, never contains CRLF.
    SimpleString(String),
    /// A `-` error reply.  The pipeline converts these into [`RedisError`]s
    /// for the command they answer; they only appear as plain values when
    /// nested inside arrays.
    Error(String),
    /// A `:` integer reply.
    Int(i64),
    /// A `$` bulk string, or nil for `$-1`.  Binary safe.
    BulkString(Option<Vec<u8>>),
    /// A `*` array, or nil for `*-1`.  May nest arbitrarily.
    Array(Option<Vec<Value>>),
}

impl Value {
    /// The canonical `+OK` status reply.
    pub fn okay() -> Value {
        Value::SimpleString("OK".to_string())
    }

    /// A non-nil bulk string from anything byte-like.
    pub fn bulk(data: impl Into<Vec<u8>>) -> Value {
        Value::BulkString(Some(data.into()))
    }

    /// The nil bulk string (`$-1`).
    pub fn nil_bulk() -> Value {
        Value::BulkString(None)
    }

    /// The nil array (`*-1`).
    pub fn nil_array() -> Value {
        Value::Array(None)
    }

    /// Returns the payload bytes if `self` is a non-nil bulk string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::BulkString(Some(data)) => Some(data),
            _ => None,
        }
    }

    /// Returns the value as text for simple strings and UTF-8 bulk strings.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::SimpleString(s) => Some(s),
            Value::BulkString(Some(data)) => from_utf8(data).ok(),
            _ => None,
        }
    }

    /// Returns the integer payload, also accepting numeric strings the way
    /// servers sometimes return counters.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(val) => Some(*val),
            Value::SimpleString(s) => s.parse().ok(),
            Value::BulkString(Some(data)) => from_utf8(data).ok()?.parse().ok(),
            _ => None,
        }
    }

    /// Returns an `&[Value]` if `self` is a non-nil array.
    pub fn as_sequence(&self) -> Option<&[Value]> {
        match self {
            Value::Array(Some(items)) => Some(items),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Value::SimpleString(ref s) => write!(fmt, "simple-string({s:?})"),
            Value::Error(ref s) => write!(fmt, "error({s:?})"),
            Value::Int(val) => write!(fmt, "int({val:?})"),
            Value::BulkString(None) => write!(fmt, "nil"),
            Value::BulkString(Some(ref val)) => match from_utf8(val) {
                Ok(x) => write!(fmt, "bulk-string({x:?})"),
                Err(_) => write!(fmt, "binary-data({val:?})"),
            },
            Value::Array(None) => write!(fmt, "nil-array"),
            Value::Array(Some(ref values)) => {
                write!(fmt, "array(")?;
                let mut is_first = true;
                for val in values.iter() {
                    if !is_first {
                        write!(fmt, ", ")?;
                    }
                    write!(fmt, "{val:?}")?;
                    is_first = false;
                }
                write!(fmt, ")")
            }
        }
    }
}

/// An abstraction over command argument sinks; [`crate::Cmd`] implements it
/// so arguments serialize straight into the command buffer.
pub trait RedisWrite {
    /// Accepts a serialized argument.
    fn write_arg(&mut self, arg: &[u8]);

    /// Accepts an argument that can be formatted.
    fn write_arg_fmt(&mut self, arg: impl fmt::Display)
    where
        Self: Sized,
    {
        self.write_arg(arg.to_string().as_bytes())
    }
}

/// Conversion of Rust values into command arguments.
///
/// Every argument becomes one bulk string on the wire.
pub trait ToRedisArgs {
    /// Writes the value as one or more arguments into `out`.
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite;
}

impl ToRedisArgs for String {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        out.write_arg(self.as_bytes())
    }
}

impl ToRedisArgs for &str {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        out.write_arg(self.as_bytes())
    }
}

impl ToRedisArgs for Vec<u8> {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        out.write_arg(self)
    }
}

impl ToRedisArgs for &[u8] {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        out.write_arg(self)
    }
}

macro_rules! itoa_based_to_redis_impl {
    ($t:ty) => {
        impl ToRedisArgs for $t {
            fn write_redis_args<W>(&self, out: &mut W)
            where
                W: ?Sized + RedisWrite,
            {
                let mut buf = ::itoa::Buffer::new();
                out.write_arg(buf.format(*self).as_bytes())
            }
        }
    };
}

itoa_based_to_redis_impl!(i8);
itoa_based_to_redis_impl!(i16);
itoa_based_to_redis_impl!(i32);
itoa_based_to_redis_impl!(i64);
itoa_based_to_redis_impl!(isize);
itoa_based_to_redis_impl!(u8);
itoa_based_to_redis_impl!(u16);
itoa_based_to_redis_impl!(u32);
itoa_based_to_redis_impl!(u64);
itoa_based_to_redis_impl!(usize);

impl ToRedisArgs for Value {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        match self {
            Value::SimpleString(s) | Value::Error(s) => out.write_arg(s.as_bytes()),
            Value::Int(val) => {
                let mut buf = ::itoa::Buffer::new();
                out.write_arg(buf.format(*val).as_bytes())
            }
            Value::BulkString(Some(data)) => out.write_arg(data),
            Value::BulkString(None) => out.write_arg(b""),
            Value::Array(items) => {
                for item in items.iter().flatten() {
                    item.write_redis_args(out);
                }
            }
        }
    }
}

impl<T> ToRedisArgs for &T
where
    T: ToRedisArgs + ?Sized,
{
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        (*self).write_redis_args(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_bulk_and_nil_array_are_distinct() {
        assert_ne!(Value::nil_bulk(), Value::nil_array());
        assert_eq!(Value::bulk(""), Value::BulkString(Some(vec![])));
        assert_ne!(Value::bulk(""), Value::nil_bulk());
    }

    #[test]
    fn as_int_accepts_numeric_strings() {
        assert_eq!(Value::Int(7).as_int(), Some(7));
        assert_eq!(Value::bulk("42").as_int(), Some(42));
        assert_eq!(Value::SimpleString("13".into()).as_int(), Some(13));
        assert_eq!(Value::bulk("nope").as_int(), None);
    }

    #[test]
    fn debug_output_is_compact() {
        let value = Value::Array(Some(vec![
            Value::Int(1),
            Value::bulk("foo"),
            Value::nil_bulk(),
        ]));
        assert_eq!(
            format!("{value:?}"),
            "array(int(1), bulk-string(\"foo\"), nil)"
        );
    }
}
