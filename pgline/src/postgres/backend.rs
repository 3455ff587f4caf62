//! Postgres Backend Messages
//!
//! <https://www.postgresql.org/docs/current/protocol-message-formats.html>
use bytes::Bytes;
use std::fmt;

use super::{Oid, ProtocolError, codec::{Decoder, Frame}};
use crate::common::ByteStr;

/// A type that can be decoded into postgres backend message.
pub trait BackendProtocol: Sized {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError>;
}

/// Postgres backend messages.
#[derive(Debug)]
pub enum BackendMessage {
    Authentication(Authentication),
    BackendKeyData(BackendKeyData),
    CommandComplete(CommandComplete),
    CopyBothResponse(CopyBothResponse),
    CopyData(CopyData),
    CopyDone(CopyDone),
    CopyInResponse(CopyInResponse),
    CopyOutResponse(CopyOutResponse),
    DataRow(DataRow),
    EmptyQueryResponse(EmptyQueryResponse),
    ErrorResponse(ErrorResponse),
    NoticeResponse(NoticeResponse),
    ParameterStatus(ParameterStatus),
    ReadyForQuery(ReadyForQuery),
    RowDescription(RowDescription),
}

macro_rules! match_backend {
    ($($name:ident,)*) => {
        impl BackendMessage {
            pub fn msgtype(&self) -> u8 {
                match self {
                    $(Self::$name(_) => $name::MSGTYPE,)*
                }
            }

            /// Get message name from message type.
            ///
            /// Returns `"Unknown"` for unknown message type.
            pub fn message_name(msgtype: u8) -> &'static str {
                match msgtype {
                    $($name::MSGTYPE => stringify!($name),)*
                    _ => "Unknown",
                }
            }

            /// Decode a received frame.
            ///
            /// Returns `None` for unknown message type, the frame is already
            /// consumed whole so the stream stays in sync.
            pub fn decode(frame: Frame) -> Result<Option<Self>, ProtocolError> {
                let Frame { tag, body } = frame;
                let message = match tag {
                    $($name::MSGTYPE => Self::$name(<$name as BackendProtocol>::decode(tag, body)?),)*
                    _ => return Ok(None),
                };
                Ok(Some(message))
            }
        }
    };
}

match_backend! {
    Authentication,
    BackendKeyData,
    CommandComplete,
    CopyBothResponse,
    CopyData,
    CopyDone,
    CopyInResponse,
    CopyOutResponse,
    DataRow,
    EmptyQueryResponse,
    ErrorResponse,
    NoticeResponse,
    ParameterStatus,
    ReadyForQuery,
    RowDescription,
}

impl BackendMessage {
    /// Create an error for message which is not valid in `phase`.
    pub fn unexpected(&self, phase: &'static str) -> ProtocolError {
        ProtocolError::unexpected(self.msgtype(), phase)
    }
}

macro_rules! assert_msgtype {
    ($typ:ident) => {
        if Self::MSGTYPE != $typ {
            return Err(ProtocolError::unexpected($typ, "decode"))
        }
    };
}

/// Identifies the message as an authentication request.
#[derive(Debug)]
pub enum Authentication {
    /// Specifies that the authentication was successful.
    Ok,
    /// Specifies that Kerberos V5 authentication is required.
    KerberosV5,
    /// Specifies that a clear-text password is required.
    CleartextPassword,
    /// Specifies that a crypt()-encrypted password is required.
    CryptPassword {
        /// The salt to use when encrypting the password.
        salt: [u8; 2],
    },
    /// Specifies that an MD5-encrypted password is required.
    MD5Password {
        /// The salt to use when encrypting the password.
        salt: [u8; 4],
    },
    /// Specifies that an SCM credentials message is required.
    SCMCredential,
    /// Specifies that GSSAPI authentication is required.
    GSS,
    /// GSSAPI or SSPI authentication data.
    GSSContinue { data: Bytes },
    /// Specifies that SSPI authentication is required.
    SSPI,
    /// Specifies that SASL authentication is required.
    ///
    /// The message body is a list of SASL authentication mechanisms, in the server's order of preference.
    SASL { mechanisms: Vec<Bytes> },
    /// Specifies that this message contains a SASL challenge.
    SASLContinue { data: Bytes },
    /// Specifies that SASL authentication has completed.
    SASLFinal { data: Bytes },
}

impl Authentication {
    pub const MSGTYPE: u8 = b'R';

    /// Name of the requested authentication method.
    pub fn method_name(&self) -> &'static str {
        match self {
            Self::Ok => "Ok",
            Self::KerberosV5 => "KerberosV5",
            Self::CleartextPassword => "CleartextPassword",
            Self::CryptPassword { .. } => "CryptPassword",
            Self::MD5Password { .. } => "MD5Password",
            Self::SCMCredential => "SCMCredential",
            Self::GSS => "GSS",
            Self::GSSContinue { .. } => "GSSContinue",
            Self::SSPI => "SSPI",
            Self::SASL { .. } => "SASL",
            Self::SASLContinue { .. } => "SASLContinue",
            Self::SASLFinal { .. } => "SASLFinal",
        }
    }
}

impl BackendProtocol for Authentication {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        let mut body = Decoder::new(body);
        let auth = match body.shift_int32()? {
            0 => Self::Ok,
            2 => Self::KerberosV5,
            3 => Self::CleartextPassword,
            4 => {
                let salt = body.shift_raw_string(2)?;
                Self::CryptPassword { salt: [salt[0], salt[1]] }
            }
            5 => Self::MD5Password { salt: body.shift_int32()?.to_be_bytes() },
            6 => Self::SCMCredential,
            7 => Self::GSS,
            8 => Self::GSSContinue { data: body.shift_rest() },
            9 => Self::SSPI,
            10 => Self::SASL { mechanisms: body.shift_multi_cstring()? },
            11 => Self::SASLContinue { data: body.shift_rest() },
            12 => Self::SASLFinal { data: body.shift_rest() },
            auth => return Err(ProtocolError::UnknownAuth(auth)),
        };
        Ok(auth)
    }
}

/// Identifies the message as cancellation key data.
///
/// The frontend must save these values if it wishes to be able to issue CancelRequest messages later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendKeyData {
    /// The process ID of this backend.
    pub process_id: i32,
    /// The secret key of this backend.
    pub secret_key: i32,
}

impl BackendKeyData {
    pub const MSGTYPE: u8 = b'K';
}

impl BackendProtocol for BackendKeyData {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        let mut body = Decoder::new(body);
        Ok(Self {
            process_id: body.shift_int32()?,
            secret_key: body.shift_int32()?,
        })
    }
}

/// Identifies the message as a run-time parameter status report.
#[derive(Debug, Clone)]
pub struct ParameterStatus {
    /// The name of the run-time parameter being reported
    pub name: ByteStr,
    /// The current value of the parameter
    pub value: ByteStr,
}

impl ParameterStatus {
    pub const MSGTYPE: u8 = b'S';
}

impl BackendProtocol for ParameterStatus {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        let mut body = Decoder::new(body);
        Ok(Self {
            name: body.shift_str()?,
            value: body.shift_str()?,
        })
    }
}

/// Current backend transaction status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Not in a transaction block.
    Idle,
    /// In a transaction block.
    Transaction,
    /// In a failed transaction block, queries will be rejected until block is ended.
    Failed,
}

/// Identifies the message type. ReadyForQuery is sent whenever the backend is ready for a new query cycle.
#[derive(Debug, Clone, Copy)]
pub struct ReadyForQuery {
    pub status: TransactionStatus,
}

impl ReadyForQuery {
    pub const MSGTYPE: u8 = b'Z';
}

impl BackendProtocol for ReadyForQuery {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        let status = match Decoder::new(body).shift_tag()? {
            b'I' => TransactionStatus::Idle,
            b'T' => TransactionStatus::Transaction,
            b'E' => TransactionStatus::Failed,
            status => return Err(ProtocolError::UnknownStatus(status)),
        };
        Ok(Self { status })
    }
}

/// Column metadata from [`RowDescription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// The field name.
    pub name: ByteStr,
    /// If the field can be identified as a column of a specific table, the object ID of the table; otherwise zero.
    pub table_id: i32,
    /// If the field can be identified as a column of a specific table, the attribute number of the column; otherwise zero.
    pub column_id: i16,
    /// The object ID of the field's data type.
    pub type_id: Oid,
    /// The data type size (see `pg_type.typlen`). Note that negative values denote variable-width types.
    pub type_size: i16,
    /// The type modifier (see `pg_attribute.atttypmod`). The meaning of the modifier is type-specific.
    pub type_modifier: i32,
    /// The format code being used for the field. Currently will be zero (text) or one (binary).
    pub format_code: i16,
}

/// Identifies the message as a row description.
#[derive(Debug, Clone)]
pub struct RowDescription {
    pub fields: Vec<FieldDescriptor>,
}

impl RowDescription {
    pub const MSGTYPE: u8 = b'T';
}

impl BackendProtocol for RowDescription {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        let mut body = Decoder::new(body);
        let len = body.shift_int16()?;
        let mut fields = Vec::with_capacity(len.max(0) as usize);
        for _ in 0..len {
            fields.push(FieldDescriptor {
                name: body.shift_str()?,
                table_id: body.shift_int32()?,
                column_id: body.shift_int16()?,
                type_id: body.shift_int32()?,
                type_size: body.shift_int16()?,
                type_modifier: body.shift_int32()?,
                format_code: body.shift_int16()?,
            });
        }
        Ok(Self { fields })
    }
}

/// Identifies the message as a data row.
#[derive(Debug)]
pub struct DataRow {
    /// Column values, `None` is `NULL`.
    pub values: Vec<Option<Bytes>>,
}

impl DataRow {
    pub const MSGTYPE: u8 = b'D';
}

impl BackendProtocol for DataRow {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        let mut body = Decoder::new(body);
        let len = body.shift_int16()?;
        let mut values = Vec::with_capacity(len.max(0) as usize);
        for _ in 0..len {
            // -1 indicates a NULL column value, no value bytes follow
            let value = match body.shift_int32()? {
                -1 => None,
                len if len < 0 => return Err(ProtocolError::InvalidLength(len)),
                len => Some(body.shift_raw_string(len as usize)?),
            };
            values.push(value);
        }
        Ok(Self { values })
    }
}

/// Identifies the message as a command-completed response.
///
/// For an INSERT command, the tag is `INSERT oid rows`, where rows is the number of rows inserted.
/// For SELECT, UPDATE, DELETE, MERGE, FETCH, MOVE and COPY the tag is `<COMMAND> rows`.
#[derive(Debug)]
pub struct CommandComplete {
    /// The command tag. This is usually a single word that identifies which SQL command was completed.
    pub tag: ByteStr,
}

impl CommandComplete {
    pub const MSGTYPE: u8 = b'C';

    /// Number of rows affected according to the command tag.
    ///
    /// Returns zero for commands that does not report rows.
    pub fn rows_affected(&self) -> u64 {
        let mut whs = self.tag.split_whitespace();
        let Some(tag) = whs.next() else {
            return 0;
        };
        let Some(rows) = whs.next() else {
            return 0;
        };
        match tag {
            "INSERT" => whs.next().unwrap_or_default(),
            "SELECT" | "UPDATE" | "DELETE" | "MERGE" | "FETCH" | "MOVE" | "COPY" => rows,
            _ => return 0,
        }
        .parse()
        .unwrap_or_default()
    }
}

impl BackendProtocol for CommandComplete {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self { tag: Decoder::new(body).shift_str()? })
    }
}

/// Identifies the message as a response to an empty query string.
///
/// This substitutes for CommandComplete.
#[derive(Debug)]
pub struct EmptyQueryResponse;

impl EmptyQueryResponse {
    pub const MSGTYPE: u8 = b'I';
}

impl BackendProtocol for EmptyQueryResponse {
    fn decode(msgtype: u8, _: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self)
    }
}

/// Copy sub-protocol messages, the payload is kept undecoded.
macro_rules! copy_msg {
    ($(
        $(#[$doc:meta])* struct $name:ident, $ty:literal;
    )*) => {$(
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $name {
            pub body: Bytes,
        }

        impl $name {
            pub const MSGTYPE: u8 = $ty;
        }

        impl BackendProtocol for $name {
            fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
                assert_msgtype!(msgtype);
                Ok(Self { body })
            }
        }
    )*};
}

copy_msg! {
    /// The backend is ready to copy data from the frontend to a table.
    struct CopyInResponse, b'G';
    /// The backend is ready to copy data from a table to the frontend.
    struct CopyOutResponse, b'H';
    /// Start of copy-both mode, only used for streaming replication.
    struct CopyBothResponse, b'W';
    /// Data that forms part of a `COPY` data stream.
    struct CopyData, b'd';
    /// End of a `COPY` data stream.
    struct CopyDone, b'c';
}

/// Identified fields of [`ErrorResponse`] and [`NoticeResponse`].
///
/// Each field is a code byte identifying the field type followed by the value.
/// Since more field types might be added in future, unrecognized codes are kept as is.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Fields {
    fields: Vec<(u8, ByteStr)>,
}

impl Fields {
    fn decode(body: Bytes) -> Result<Self, ProtocolError> {
        let mut fields = vec![];
        for mut field in Decoder::new(body).shift_multi_cstring()? {
            let code = field[0];
            let value = ByteStr::from_utf8(field.split_off(1))?;
            fields.push((code, value));
        }
        Ok(Self { fields })
    }

    /// Get field by its code.
    pub fn get(&self, code: u8) -> Option<&str> {
        self.fields.iter().find(|(c, _)| *c == code).map(|(_, v)| v.as_str())
    }

    /// Iterate over field code and value.
    pub fn iter(&self) -> impl Iterator<Item = (u8, &str)> {
        self.fields.iter().map(|(c, v)| (*c, v.as_str()))
    }

    /// `ERROR`, `FATAL`, or `PANIC` (in an error message), or `WARNING`, `NOTICE`, `DEBUG`,
    /// `INFO`, or `LOG` (in a notice message).
    ///
    /// Prefer the non-localized `V` field, present in PostgreSQL 9.6 and later.
    pub fn severity(&self) -> &str {
        self.get(b'V').or_else(|| self.get(b'S')).unwrap_or_default()
    }

    /// The SQLSTATE code for the error.
    pub fn code(&self) -> &str {
        self.get(b'C').unwrap_or_default()
    }

    /// The primary human-readable error message.
    pub fn message(&self) -> &str {
        self.get(b'M').unwrap_or_default()
    }

    /// An optional secondary error message carrying more detail about the problem.
    pub fn detail(&self) -> Option<&str> {
        self.get(b'D')
    }

    /// An optional suggestion what to do about the problem.
    pub fn hint(&self) -> Option<&str> {
        self.get(b'H')
    }
}

impl fmt::Display for Fields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.severity(), self.message())?;
        if let Some(detail) = self.detail() {
            write!(f, ", {detail}")?;
        }
        if let Some(hint) = self.hint() {
            write!(f, ", hint: {hint}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.iter().map(|(c, v)| (c as char, v)))
            .finish()
    }
}

/// Identifies the message as an error.
#[derive(Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub fields: Fields,
}

impl ErrorResponse {
    pub const MSGTYPE: u8 = b'E';

    /// Returns `true` if the server is going to terminate the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self.fields.severity(), "FATAL" | "PANIC")
    }
}

impl std::ops::Deref for ErrorResponse {
    type Target = Fields;

    fn deref(&self) -> &Fields {
        &self.fields
    }
}

impl BackendProtocol for ErrorResponse {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self { fields: Fields::decode(body)? })
    }
}

impl std::error::Error for ErrorResponse { }

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.fields, f)
    }
}

impl fmt::Debug for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.fields, f)
    }
}

/// A warning message. The frontend should display the message.
#[derive(Clone, PartialEq, Eq)]
pub struct NoticeResponse {
    pub fields: Fields,
}

impl NoticeResponse {
    pub const MSGTYPE: u8 = b'N';
}

impl std::ops::Deref for NoticeResponse {
    type Target = Fields;

    fn deref(&self) -> &Fields {
        &self.fields
    }
}

impl BackendProtocol for NoticeResponse {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self { fields: Fields::decode(body)? })
    }
}

impl fmt::Display for NoticeResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.fields, f)
    }
}

impl fmt::Debug for NoticeResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.fields, f)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::postgres::mock;
    use bytes::BytesMut;

    fn decode(build: impl FnOnce(&mut BytesMut)) -> BackendMessage {
        let mut buf = BytesMut::new();
        build(&mut buf);
        let frame = crate::postgres::codec::split_frame(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        BackendMessage::decode(frame).unwrap().unwrap()
    }

    #[test]
    fn authentication() {
        let BackendMessage::Authentication(auth) = decode(|b| mock::auth_md5(b, *b"salt")) else {
            panic!("expected authentication")
        };
        assert!(matches!(auth, Authentication::MD5Password { salt } if &salt == b"salt"));

        let BackendMessage::Authentication(auth) = decode(|b| mock::auth(b, 7)) else {
            panic!("expected authentication")
        };
        assert_eq!(auth.method_name(), "GSS");
    }

    #[test]
    fn unknown_auth_code() {
        let mut buf = BytesMut::new();
        mock::auth(&mut buf, 99);
        let frame = crate::postgres::codec::split_frame(&mut buf).unwrap().unwrap();
        assert!(matches!(BackendMessage::decode(frame), Err(ProtocolError::UnknownAuth(99))));
    }

    #[test]
    fn error_response() {
        let BackendMessage::ErrorResponse(err) = decode(|b| {
            mock::error(b, "ERROR", "42601", "syntax error at or near \"INVALID\"")
        }) else {
            panic!("expected error")
        };
        assert_eq!(err.severity(), "ERROR");
        assert_eq!(err.code(), "42601");
        assert_eq!(err.message(), "syntax error at or near \"INVALID\"");
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "ERROR: syntax error at or near \"INVALID\"");
    }

    #[test]
    fn row_description_and_data_row() {
        let BackendMessage::RowDescription(rd) = decode(|b| mock::row_description(b, &[("id", 23), ("name", 25)])) else {
            panic!("expected row description")
        };
        assert_eq!(rd.fields.len(), 2);
        assert_eq!(rd.fields[0].name, "id");
        assert_eq!(rd.fields[0].type_id, 23);
        assert_eq!(rd.fields[1].type_size, -1);

        let BackendMessage::DataRow(dr) = decode(|b| mock::data_row(b, &[Some("42"), None])) else {
            panic!("expected data row")
        };
        assert_eq!(dr.values.len(), 2);
        assert_eq!(dr.values[0].as_deref(), Some(&b"42"[..]));
        assert!(dr.values[1].is_none());
    }

    #[test]
    fn truncated_data_row() {
        let mut buf = BytesMut::new();
        // claims one column of 10 bytes but carries 2
        buf.extend_from_slice(b"D\0\0\0\x0c\0\x01\0\0\0\x0a42");
        let frame = crate::postgres::codec::split_frame(&mut buf).unwrap().unwrap();
        assert!(matches!(BackendMessage::decode(frame), Err(ProtocolError::FrameTruncated { .. })));
    }

    #[test]
    fn ready_for_query() {
        let BackendMessage::ReadyForQuery(r) = decode(|b| mock::ready(b, b'T')) else {
            panic!("expected ready for query")
        };
        assert_eq!(r.status, TransactionStatus::Transaction);
    }

    #[test]
    fn unknown_message_is_skipped() {
        let mut buf = BytesMut::from(&b"?\0\0\0\x06ab"[..]);
        let frame = crate::postgres::codec::split_frame(&mut buf).unwrap().unwrap();
        assert!(BackendMessage::decode(frame).unwrap().is_none());
        assert_eq!(BackendMessage::message_name(b'?'), "Unknown");
    }

    #[test]
    fn command_tag_rows() {
        let tag = |s: &'static str| CommandComplete { tag: ByteStr::from_static(s) }.rows_affected();
        assert_eq!(tag("INSERT 0 3"), 3);
        assert_eq!(tag("SELECT 12"), 12);
        assert_eq!(tag("UPDATE 0"), 0);
        assert_eq!(tag("CREATE TABLE"), 0);
        assert_eq!(tag("BEGIN"), 0);
    }
}
