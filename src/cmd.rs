use std::io;

use crate::types::{RedisWrite, ToRedisArgs};

/// Represents a redis command.
///
/// A command acts as a builder interface to creating encoded redis requests.
/// This allows you to easily assemble a packed command by chaining arguments
/// together.  On the wire every command is an array of bulk strings.
#[derive(Clone, Debug, Default)]
pub struct Cmd {
    data: Vec<u8>,
    // each entry marks the end offset of one argument in `data`
    args: Vec<usize>,
}

/// Shortcut function to creating a command with a single argument.
///
/// The first argument of a redis command is always the name of the command
/// which allows a shortcut for creating such command objects.
///
/// ```rust
/// let cmd = redis_pool::cmd("PING");
/// assert_eq!(cmd.get_packed_command(), b"*1\r\n$4\r\nPING\r\n");
/// ```
pub fn cmd(name: &str) -> Cmd {
    let mut rv = Cmd::new();
    rv.arg(name);
    rv
}

fn countdigits(mut v: usize) -> usize {
    let mut result = 1;
    loop {
        if v < 10 {
            return result;
        }
        if v < 100 {
            return result + 1;
        }
        if v < 1000 {
            return result + 2;
        }
        if v < 10000 {
            return result + 3;
        }

        v /= 10000;
        result += 4;
    }
}

#[inline]
fn bulklen(len: usize) -> usize {
    1 + countdigits(len) + 2 + len + 2
}

fn write_command<'a, I>(cmd: &mut (impl ?Sized + io::Write), args: I) -> io::Result<()>
where
    I: IntoIterator<Item = &'a [u8]> + ExactSizeIterator,
{
    let mut buf = ::itoa::Buffer::new();

    cmd.write_all(b"*")?;
    let s = buf.format(args.len());
    cmd.write_all(s.as_bytes())?;
    cmd.write_all(b"\r\n")?;

    for arg in args {
        cmd.write_all(b"$")?;
        let s = buf.format(arg.len());
        cmd.write_all(s.as_bytes())?;
        cmd.write_all(b"\r\n")?;

        cmd.write_all(arg)?;
        cmd.write_all(b"\r\n")?;
    }
    Ok(())
}

impl RedisWrite for Cmd {
    fn write_arg(&mut self, arg: &[u8]) {
        self.data.extend_from_slice(arg);
        self.args.push(self.data.len());
    }

    fn write_arg_fmt(&mut self, arg: impl std::fmt::Display) {
        use std::io::Write;
        write!(self.data, "{arg}").unwrap();
        self.args.push(self.data.len());
    }
}

impl Cmd {
    /// Creates a new empty command.
    pub fn new() -> Cmd {
        Cmd::default()
    }

    /// Appends an argument to the command.  The argument passed must be a
    /// type that implements `ToRedisArgs`.  Most primitive types as well as
    /// vectors of primitive types implement it.
    #[inline]
    pub fn arg<T: ToRedisArgs>(&mut self, arg: T) -> &mut Cmd {
        arg.write_redis_args(self);
        self
    }

    /// Returns the number of arguments, including the command name.
    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// Returns true if the command holds no arguments at all.
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Returns an iterator over the arguments in this command, including the
    /// command name.
    pub fn args_iter(&self) -> impl Iterator<Item = &[u8]> + Clone + ExactSizeIterator {
        self.args.iter().enumerate().map(move |(i, &end)| {
            let start = if i == 0 { 0 } else { self.args[i - 1] };
            &self.data[start..end]
        })
    }

    /// Returns the name of the command, i.e. its first argument.
    pub fn command_name(&self) -> Option<&[u8]> {
        self.args_iter().next()
    }

    /// True for the commands that enter or leave subscriber mode and are
    /// only valid on a connection that allows subscriptions.
    pub(crate) fn is_subscribe_family(&self) -> bool {
        const SUBSCRIBE_COMMANDS: &[&[u8]] =
            &[b"SUBSCRIBE", b"PSUBSCRIBE", b"UNSUBSCRIBE", b"PUNSUBSCRIBE"];
        match self.command_name() {
            Some(name) => SUBSCRIBE_COMMANDS
                .iter()
                .any(|candidate| name.eq_ignore_ascii_case(candidate)),
            None => false,
        }
    }

    /// Returns the packed command as a byte vector.
    pub fn get_packed_command(&self) -> Vec<u8> {
        let args = self.args_iter();
        let mut totlen = 1 + countdigits(args.len()) + 2;
        for arg in args.clone() {
            totlen += bulklen(arg.len());
        }

        let mut packed = Vec::with_capacity(totlen);
        write_command(&mut packed, args).unwrap();
        packed
    }
}
