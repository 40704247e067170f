use std::{error, fmt};

/// Error categories a server names with a well-known code prefix.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum ServerErrorKind {
    /// `ERR`, the generic failure code.
    Response,
    /// `EXECABORT`, a transaction was discarded.
    ExecAbort,
    /// `LOADING`, the dataset is still being loaded into memory.
    BusyLoading,
    /// `NOSCRIPT`, an `EVALSHA` for an unknown script.
    NoScript,
    /// `READONLY`, a write was issued against a read-only replica.
    ReadOnly,
    /// `NOTBUSY`, no script was running.
    NotBusy,
    /// `NOSUB`, an unsubscribe-family command outside subscriber mode.
    NoSub,
}

/// An error reply sent by the server (`-CODE detail` on the wire).
#[derive(PartialEq, Eq, Debug, Clone)]
pub enum ServerError {
    /// A code this library has no variant for.
    ExtensionError {
        /// The raw error code.
        code: String,
        /// Everything after the code.
        detail: Option<String>,
    },
    /// A code with a known meaning.
    KnownError {
        /// The error category.
        kind: ServerErrorKind,
        /// Everything after the code.
        detail: Option<String>,
    },
}

impl ServerError {
    /// Splits an error line into its code prefix and detail.
    pub(crate) fn parse(line: &str) -> ServerError {
        let mut pieces = line.splitn(2, ' ');
        let kind = match pieces.next().unwrap_or_default() {
            "ERR" => ServerErrorKind::Response,
            "EXECABORT" => ServerErrorKind::ExecAbort,
            "LOADING" => ServerErrorKind::BusyLoading,
            "NOSCRIPT" => ServerErrorKind::NoScript,
            "READONLY" => ServerErrorKind::ReadOnly,
            "NOTBUSY" => ServerErrorKind::NotBusy,
            "NOSUB" => ServerErrorKind::NoSub,
            code => {
                return ServerError::ExtensionError {
                    code: code.to_string(),
                    detail: pieces.next().map(|detail| detail.to_string()),
                }
            }
        };
        let detail = pieces.next().map(|detail| detail.to_string());
        ServerError::KnownError { kind, detail }
    }

    /// Returns the known kind, or `None` for extension codes.
    pub fn kind(&self) -> Option<ServerErrorKind> {
        match self {
            ServerError::ExtensionError { .. } => None,
            ServerError::KnownError { kind, .. } => Some(*kind),
        }
    }

    /// Returns the raw error code.
    pub fn code(&self) -> &str {
        match self {
            ServerError::ExtensionError { code, .. } => code,
            ServerError::KnownError { kind, .. } => match kind {
                ServerErrorKind::Response => "ERR",
                ServerErrorKind::ExecAbort => "EXECABORT",
                ServerErrorKind::BusyLoading => "LOADING",
                ServerErrorKind::NoScript => "NOSCRIPT",
                ServerErrorKind::ReadOnly => "READONLY",
                ServerErrorKind::NotBusy => "NOTBUSY",
                ServerErrorKind::NoSub => "NOSUB",
            },
        }
    }

    /// Returns the detail text following the code, if any.
    pub fn details(&self) -> Option<&str> {
        match self {
            ServerError::ExtensionError { detail, .. } => detail.as_deref(),
            ServerError::KnownError { detail, .. } => detail.as_deref(),
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())?;
        if let Some(details) = self.details() {
            write!(f, ": {details}")?;
        }
        Ok(())
    }
}

impl error::Error for ServerError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_codes() {
        let err = ServerError::parse("ERR unknown command 'FOO'");
        assert_eq!(err.kind(), Some(ServerErrorKind::Response));
        assert_eq!(err.details(), Some("unknown command 'FOO'"));

        let err = ServerError::parse("LOADING server is loading");
        assert_eq!(err.kind(), Some(ServerErrorKind::BusyLoading));
        assert_eq!(err.code(), "LOADING");
    }

    #[test]
    fn unknown_codes_become_extensions() {
        let err = ServerError::parse("WRONGTYPE Operation against a key");
        assert_eq!(err.kind(), None);
        assert_eq!(err.code(), "WRONGTYPE");
        assert_eq!(err.details(), Some("Operation against a key"));
    }

    #[test]
    fn code_only_errors_have_no_details() {
        let err = ServerError::parse("NOTBUSY");
        assert_eq!(err.kind(), Some(ServerErrorKind::NotBusy));
        assert_eq!(err.details(), None);
    }
}
