//! Protocol error
use std::{fmt, str::Utf8Error};

use super::BackendMessage;

/// An error when translating buffer from postgres.
///
/// All variants are fatal to the connection, a frame that cannot be decoded
/// leaves no safe point to resume from.
#[derive(Clone)]
pub enum ProtocolError {
    /// A decoder tried to read past the end of the frame.
    FrameTruncated {
        /// Bytes requested.
        need: usize,
        /// Bytes left in the frame.
        remaining: usize,
    },
    /// Frame length is less than the length field itself.
    InvalidLength(i32),
    /// Received message that is not valid in current phase.
    Unexpected {
        found: u8,
        phase: &'static str,
    },
    /// Unknown authentication request code.
    UnknownAuth(i32),
    /// Unknown `ReadyForQuery` transaction status.
    UnknownStatus(u8),
    /// Backend sent non utf8 string.
    Utf8(Utf8Error),
}

impl std::error::Error for ProtocolError { }

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FrameTruncated { need, remaining } => write!(
                f,
                "frame truncated, need {need} bytes but only {remaining} remaining"
            ),
            Self::InvalidLength(len) => write!(f, "invalid frame length: {len}"),
            Self::Unexpected { found, phase } => write!(
                f,
                "unexpected message `{}` in `{phase}`",
                BackendMessage::message_name(*found),
            ),
            Self::UnknownAuth(auth) => write!(f, "unknown authentication code: {auth}"),
            Self::UnknownStatus(status) => {
                write!(f, "unknown transaction status: {:?}", *status as char)
            }
            Self::Utf8(e) => write!(f, "backend sent invalid utf8: {e}"),
        }
    }
}

impl fmt::Debug for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<Utf8Error> for ProtocolError {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8(value)
    }
}

impl ProtocolError {
    pub(crate) fn truncated(need: usize, remaining: usize) -> ProtocolError {
        Self::FrameTruncated { need, remaining }
    }

    pub(crate) fn unexpected(found: u8, phase: &'static str) -> ProtocolError {
        Self::Unexpected { found, phase }
    }
}
