use std::{io, str};

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::errors::{ErrorKind, RedisError};
use crate::types::{RedisResult, Value};

/// Nesting ceiling for arrays, so a hostile length prefix cannot blow the
/// stack through recursion.
const MAX_RECURSE_DEPTH: usize = 100;

/// Cursor over a byte buffer that attempts to parse exactly one RESP value.
///
/// `Ok(None)` means the buffer ends mid-value; the caller keeps the bytes and
/// retries once more arrive, so the cursor never has to survive across calls
/// and a partial parse consumes nothing.  `Err` means the stream is
/// malformed and cannot be resynchronized.
struct ValueParser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> ValueParser<'a> {
    fn new(input: &'a [u8]) -> ValueParser<'a> {
        ValueParser { input, pos: 0 }
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn take_byte(&mut self) -> Option<u8> {
        let byte = *self.input.get(self.pos)?;
        self.pos += 1;
        Some(byte)
    }

    fn take(&mut self, count: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(count)?;
        let bytes = self.input.get(self.pos..end)?;
        self.pos = end;
        Some(bytes)
    }

    /// Consumes up to and including the next CRLF, yielding the bytes before
    /// it.  `None` when no full CRLF is buffered yet.
    fn line(&mut self) -> Option<&'a [u8]> {
        let haystack = &self.input[self.pos..];
        let mut i = 0;
        while i + 1 < haystack.len() {
            if haystack[i] == b'\r' && haystack[i + 1] == b'\n' {
                self.pos += i + 2;
                return Some(&haystack[..i]);
            }
            i += 1;
        }
        None
    }

    fn text_line(&mut self) -> RedisResult<Option<&'a str>> {
        let Some(line) = self.line() else {
            return Ok(None);
        };
        match str::from_utf8(line) {
            Ok(text) => Ok(Some(text)),
            Err(_) => Err((ErrorKind::Parse, "expected valid UTF-8 line").into()),
        }
    }

    fn int_line(&mut self) -> RedisResult<Option<i64>> {
        let Some(line) = self.text_line()? else {
            return Ok(None);
        };
        match line.trim().parse::<i64>() {
            Ok(value) => Ok(Some(value)),
            Err(_) => Err((ErrorKind::Parse, "expected integer, got garbage").into()),
        }
    }

    fn crlf(&mut self) -> RedisResult<Option<()>> {
        let Some(bytes) = self.take(2) else {
            return Ok(None);
        };
        if bytes != b"\r\n" {
            return Err((ErrorKind::Parse, "expected CRLF after bulk payload").into());
        }
        Ok(Some(()))
    }

    fn value(&mut self, depth: usize) -> RedisResult<Option<Value>> {
        if depth > MAX_RECURSE_DEPTH {
            return Err((ErrorKind::Parse, "maximum recursion depth exceeded").into());
        }
        let Some(first) = self.take_byte() else {
            return Ok(None);
        };
        let value = match first {
            b'+' => match self.text_line()? {
                Some(line) => Value::SimpleString(line.to_string()),
                None => return Ok(None),
            },
            b'-' => match self.text_line()? {
                Some(line) => Value::Error(line.to_string()),
                None => return Ok(None),
            },
            b':' => match self.int_line()? {
                Some(value) => Value::Int(value),
                None => return Ok(None),
            },
            b'$' => {
                let Some(length) = self.int_line()? else {
                    return Ok(None);
                };
                if length == -1 {
                    Value::BulkString(None)
                } else if length < 0 {
                    return Err((ErrorKind::Parse, "invalid bulk string length").into());
                } else {
                    let Some(data) = self.take(length as usize) else {
                        return Ok(None);
                    };
                    let data = data.to_vec();
                    if self.crlf()?.is_none() {
                        return Ok(None);
                    }
                    Value::BulkString(Some(data))
                }
            }
            b'*' => {
                let Some(length) = self.int_line()? else {
                    return Ok(None);
                };
                if length == -1 {
                    Value::Array(None)
                } else if length < 0 {
                    return Err((ErrorKind::Parse, "invalid array length").into());
                } else {
                    let length = length as usize;
                    let mut items = Vec::with_capacity(length.min(1024));
                    for _ in 0..length {
                        match self.value(depth + 1)? {
                            Some(item) => items.push(item),
                            None => return Ok(None),
                        }
                    }
                    Value::Array(Some(items))
                }
            }
            other => {
                return Err((
                    ErrorKind::Parse,
                    "invalid response type byte",
                    format!("{:?}", char::from(other)),
                )
                    .into())
            }
        };
        Ok(Some(value))
    }
}

/// A [`tokio_util`] codec speaking RESP: values in, packed command bytes out.
///
/// Decoding is resumable over arbitrarily fragmented reads: a buffer that
/// ends mid-value yields `None` without consuming anything, and the next
/// read retries from the head of the value.
#[derive(Default)]
pub struct ValueCodec;

impl Encoder<Vec<u8>> for ValueCodec {
    type Error = RedisError;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(item.as_ref());
        Ok(())
    }
}

impl Decoder for ValueCodec {
    type Item = Value;
    type Error = RedisError;

    fn decode(&mut self, bytes: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (value, consumed) = {
            let mut parser = ValueParser::new(&bytes[..]);
            match parser.value(0)? {
                Some(value) => (value, parser.pos()),
                None => return Ok(None),
            }
        };
        bytes.advance(consumed);
        Ok(Some(value))
    }
}

/// Parses bytes into a redis value.
///
/// This is the most straightforward way to parse something into a low level
/// redis value instead of having to use a whole codec.
pub fn parse_redis_value(bytes: &[u8]) -> RedisResult<Value> {
    let mut parser = ValueParser::new(bytes);
    match parser.value(0)? {
        Some(value) => Ok(value),
        None => Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
    }
}

/// Encodes a value in its wire representation.  Total: every `Value` has
/// exactly one encoding, and decoding it yields the value back.
pub fn encode_value<W>(value: &Value, writer: &mut W) -> io::Result<()>
where
    W: io::Write + ?Sized,
{
    let mut buf = itoa::Buffer::new();
    match value {
        Value::SimpleString(s) => {
            writer.write_all(b"+")?;
            writer.write_all(s.as_bytes())?;
            writer.write_all(b"\r\n")
        }
        Value::Error(s) => {
            writer.write_all(b"-")?;
            writer.write_all(s.as_bytes())?;
            writer.write_all(b"\r\n")
        }
        Value::Int(val) => {
            writer.write_all(b":")?;
            writer.write_all(buf.format(*val).as_bytes())?;
            writer.write_all(b"\r\n")
        }
        Value::BulkString(None) => writer.write_all(b"$-1\r\n"),
        Value::BulkString(Some(data)) => {
            writer.write_all(b"$")?;
            writer.write_all(buf.format(data.len()).as_bytes())?;
            writer.write_all(b"\r\n")?;
            writer.write_all(data)?;
            writer.write_all(b"\r\n")
        }
        Value::Array(None) => writer.write_all(b"*-1\r\n"),
        Value::Array(Some(items)) => {
            writer.write_all(b"*")?;
            writer.write_all(buf.format(items.len()).as_bytes())?;
            writer.write_all(b"\r\n")?;
            for item in items {
                encode_value(item, writer)?;
            }
            Ok(())
        }
    }
}
