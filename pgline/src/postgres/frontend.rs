//! Postgres Frontend Messages
//!
//! <https://www.postgresql.org/docs/current/protocol-message-formats.html>
use bytes::BytesMut;

use super::{Oid, codec::Encoder};
use crate::ext::UsizeExt;

/// Write a frontend message to `buf`.
pub fn write<F: FrontendProtocol>(msg: F, buf: &mut BytesMut) {
    let mut enc = Encoder::new(buf, Some(F::MSGTYPE));
    msg.encode(&mut enc);
    enc.finalize();
}

/// A type which can be encoded into postgres frontend message.
pub trait FrontendProtocol {
    /// Message type.
    const MSGTYPE: u8;

    /// Message name, used for logging.
    const NAME: &'static str;

    /// Write the main body of the message.
    fn encode(self, enc: &mut Encoder);
}

/// The protocol version number.
///
/// The most significant 16 bits are the major version number (3 for the protocol described here).
/// The least significant 16 bits are the minor version number (0 for the protocol described here).
pub const PROTOCOL_VERSION: i32 = 196_608;

/// The SSL request code.
///
/// The value is chosen to contain 1234 in the most significant 16 bits, and 5679 in the
/// least significant 16 bits. (To avoid confusion, this code must not be the same as any
/// protocol version number.)
pub const SSL_REQUEST_CODE: i32 = 80_877_103;

/// Postgres Startup frontend message
///
/// For historical reasons, the very first message sent by the client (the [`Startup`] message)
/// has no initial message-type byte, thus [`Startup`] does not implement [`FrontendProtocol`].
///
/// To write startup message, use [`Startup::write`].
#[derive(Debug)]
pub struct Startup<'a> {
    /// The database user name to connect as. Required; there is no default.
    pub user: &'a str,
    /// The database to connect to. Defaults to the user name.
    pub database: Option<&'a str>,
    /// Used to connect in streaming replication mode.
    ///
    /// Value can be true, false, or database, and the default is false.
    pub replication: Option<&'a str>,
}

impl Startup<'_> {
    pub fn write(self, buf: &mut BytesMut) {
        let mut params = vec![("user", self.user)];

        if let Some(db) = self.database {
            params.push(("database", db));
        }

        if let Some(repl) = self.replication {
            params.push(("replication", repl));
        }

        let mut enc = Encoder::new(buf, None);
        enc.push_int32(PROTOCOL_VERSION);
        // name/value pairs, a zero byte is required as a terminator after the last pair
        enc.push_hash(params);
        enc.finalize();
    }
}

/// Request for SSL negotiation, also without message-type byte.
///
/// Never sent by this crate, tls is not supported.
#[derive(Debug)]
pub struct SslRequest;

impl SslRequest {
    pub fn write(self, buf: &mut BytesMut) {
        let mut enc = Encoder::new(buf, None);
        enc.push_int32(SSL_REQUEST_CODE);
        enc.finalize();
    }
}

/// Identifies the message as a password response.
#[derive(Debug)]
pub struct PasswordMessage<'a> {
    /// The password (encrypted, if requested)
    pub password: &'a str,
}

impl FrontendProtocol for PasswordMessage<'_> {
    const MSGTYPE: u8 = b'p';
    const NAME: &'static str = "PasswordMessage";

    fn encode(self, enc: &mut Encoder) {
        enc.push_cstring(self.password);
    }
}

/// Identifies the message as a simple query.
#[derive(Debug)]
pub struct Query<'a> {
    /// the query string itself
    pub sql: &'a str,
}

impl FrontendProtocol for Query<'_> {
    const MSGTYPE: u8 = b'Q';
    const NAME: &'static str = "Query";

    fn encode(self, enc: &mut Encoder) {
        enc.push_cstring(self.sql);
    }
}

/// Identifies the message as a Parse command.
#[derive(Debug)]
pub struct Parse<'a> {
    /// prepared statement name (an empty string selects the unnamed prepared statement).
    pub prepare_name: &'a str,
    /// The query string to be parsed.
    pub sql: &'a str,
    /// Object ID of the parameter data types, placing a zero is equivalent to
    /// leaving the type unspecified.
    ///
    /// Note that this is not an indication of the number of parameters that might
    /// appear in the query string, only the number that the frontend wants to prespecify types for.
    pub oids: &'a [Oid],
}

impl FrontendProtocol for Parse<'_> {
    const MSGTYPE: u8 = b'P';
    const NAME: &'static str = "Parse";

    fn encode(self, enc: &mut Encoder) {
        let len = i16::try_from(self.oids.len().to_i32()).expect("too many parameter types");
        enc.push_cstring(self.prepare_name);
        enc.push_cstring(self.sql);
        enc.push_int16(len);
        for &oid in self.oids {
            enc.push_int32(oid);
        }
    }
}

/// Identifies the message as a Describe command.
#[derive(Debug)]
pub struct Describe<'a> {
    /// 'S' to describe a prepared statement; or 'P' to describe a portal.
    pub kind: u8,
    /// The name of the prepared statement or portal to describe
    /// (an empty string selects the unnamed prepared statement or portal).
    pub name: &'a str,
}

impl FrontendProtocol for Describe<'_> {
    const MSGTYPE: u8 = b'D';
    const NAME: &'static str = "Describe";

    fn encode(self, enc: &mut Encoder) {
        enc.push_raw_string([self.kind]);
        enc.push_cstring(self.name);
    }
}

/// Identifies the message as a Execute command.
#[derive(Debug)]
pub struct Execute<'a> {
    /// The name of the portal to execute (an empty string selects the unnamed portal).
    pub portal_name: &'a str,
    /// Maximum number of rows to return, if portal contains a query that returns rows
    /// (ignored otherwise). Zero denotes “no limit”.
    pub max_row: i32,
}

impl FrontendProtocol for Execute<'_> {
    const MSGTYPE: u8 = b'E';
    const NAME: &'static str = "Execute";

    fn encode(self, enc: &mut Encoder) {
        enc.push_cstring(self.portal_name);
        enc.push_int32(self.max_row);
    }
}

/// Identifies the message as a COPY-failure indicator.
#[derive(Debug)]
pub struct CopyFail<'a> {
    /// An error message to report as the cause of failure.
    pub message: &'a str,
}

impl FrontendProtocol for CopyFail<'_> {
    const MSGTYPE: u8 = b'f';
    const NAME: &'static str = "CopyFail";

    fn encode(self, enc: &mut Encoder) {
        enc.push_cstring(self.message);
    }
}

macro_rules! unit_msg {
    ($(
        $(#[$doc:meta])* struct $name:ident, $ty:literal;
    )*) => {$(
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $name;

        impl FrontendProtocol for $name {
            const MSGTYPE: u8 = $ty;
            const NAME: &'static str = stringify!($name);

            fn encode(self, _: &mut Encoder) { }
        }
    )*};
}

unit_msg! {
    /// Identifies the message as a Flush command.
    struct Flush, b'H';

    /// Identifies the message as a Sync command.
    struct Sync, b'S';

    /// Identifies the message as a termination.
    struct Terminate, b'X';
}
