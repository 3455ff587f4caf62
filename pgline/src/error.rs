//! `pgline` error types.
use std::{backtrace::Backtrace, fmt, io};

use crate::{
    common::unit_error,
    connection::ParseError,
    phase::UnsupportedAuth,
    pipeline::InvalidSql,
    postgres::{ErrorResponse, ProtocolError},
    row::DecodeError,
};

/// A specialized [`Result`] type for `pgline` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from `pgline` library.
pub struct Error {
    context: String,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn into_kind(self) -> ErrorKind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// Add context to the error message.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    /// Take the error out of a shared [`Notification`][crate::Notification].
    ///
    /// Transport errors are copied by kind and message when still shared.
    pub fn unshare(error: std::sync::Arc<Error>) -> Error {
        std::sync::Arc::try_unwrap(error).unwrap_or_else(|error| {
            Error::from(error.kind.clone()).context(error.context.clone())
        })
    }

    /// Returns `true` if the command failed because the connection is gone.
    pub fn is_closed(&self) -> bool {
        matches!(self.kind, ErrorKind::Closed(_))
    }

    /// Returns the server error if this error is reported by postgres.
    pub fn as_database(&self) -> Option<&ErrorResponse> {
        match &self.kind {
            ErrorKind::Database(e) => Some(e),
            _ => None,
        }
    }
}

/// All possible error kind from `pgline` library.
pub enum ErrorKind {
    /// Url or environment configuration is invalid.
    Config(ParseError),
    /// Backend sent a malformed or out of phase frame.
    Protocol(ProtocolError),
    /// Transport failure.
    Io(io::Error),
    /// Postgres reported an error.
    Database(ErrorResponse),
    /// Server requested an authentication method that is not implemented.
    UnsupportedAuth(UnsupportedAuth),
    /// Command started a `COPY` to or from the client.
    UnsupportedCopy(UnsupportedCopy),
    /// Row value cannot be coerced.
    Decode(DecodeError),
    /// Command sql cannot be sent, only that command fails.
    InvalidSql(InvalidSql),
    /// Connection is closed or closing.
    Closed(ConnectionClosed),
}

unit_error! {
    /// Command could not complete because the connection is closed or closing.
    pub struct ConnectionClosed("connection closed");
}

unit_error! {
    /// `COPY FROM STDIN` and `COPY TO STDOUT` are not supported.
    pub struct UnsupportedCopy("copy to or from the client is not supported");
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = std::backtrace::Backtrace::capture();
                Self { context: String::new(), backtrace, kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<ParseError>e => ErrorKind::Config(e));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<io::Error>e => ErrorKind::Io(e));
from!(<ErrorResponse>e => ErrorKind::Database(e));
from!(<UnsupportedAuth>e => ErrorKind::UnsupportedAuth(e));
from!(<DecodeError>e => ErrorKind::Decode(e));
from!(<InvalidSql>e => ErrorKind::InvalidSql(e));
from!(<ConnectionClosed>e => ErrorKind::Closed(e));
from!(<UnsupportedCopy>e => ErrorKind::UnsupportedCopy(e));

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.kind.source()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        fmt::Display::fmt(&self.kind, f)?;

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{}", backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl Clone for ErrorKind {
    fn clone(&self) -> Self {
        match self {
            Self::Config(e) => Self::Config(e.clone()),
            Self::Protocol(e) => Self::Protocol(e.clone()),
            Self::Io(e) => Self::Io(io::Error::new(e.kind(), e.to_string())),
            Self::Database(e) => Self::Database(e.clone()),
            Self::UnsupportedAuth(e) => Self::UnsupportedAuth(*e),
            Self::UnsupportedCopy(e) => Self::UnsupportedCopy(*e),
            Self::Decode(e) => Self::Decode(e.clone()),
            Self::InvalidSql(e) => Self::InvalidSql(*e),
            Self::Closed(e) => Self::Closed(*e),
        }
    }
}

impl std::error::Error for ErrorKind {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Database(e) => Some(e),
            Self::Protocol(e) => Some(e),
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::Database(e) => e.fmt(f),
            Self::UnsupportedAuth(e) => e.fmt(f),
            Self::UnsupportedCopy(e) => e.fmt(f),
            Self::Decode(e) => e.fmt(f),
            Self::InvalidSql(e) => e.fmt(f),
            Self::Closed(e) => e.fmt(f),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
