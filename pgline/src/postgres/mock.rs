//! Backend message writers, acting as the server in tests.
use bytes::BytesMut;

use super::{Oid, codec::Encoder};

pub fn auth(buf: &mut BytesMut, code: i32) {
    let mut enc = Encoder::new(buf, Some(b'R'));
    enc.push_int32(code);
    enc.finalize();
}

pub fn auth_md5(buf: &mut BytesMut, salt: [u8; 4]) {
    let mut enc = Encoder::new(buf, Some(b'R'));
    enc.push_int32(5).push_raw_string(salt);
    enc.finalize();
}

pub fn parameter_status(buf: &mut BytesMut, name: &str, value: &str) {
    let mut enc = Encoder::new(buf, Some(b'S'));
    enc.push_cstring(name).push_cstring(value);
    enc.finalize();
}

pub fn backend_key(buf: &mut BytesMut, process_id: i32, secret_key: i32) {
    let mut enc = Encoder::new(buf, Some(b'K'));
    enc.push_int32(process_id).push_int32(secret_key);
    enc.finalize();
}

pub fn ready(buf: &mut BytesMut, status: u8) {
    let mut enc = Encoder::new(buf, Some(b'Z'));
    enc.push_raw_string([status]);
    enc.finalize();
}

pub fn row_description(buf: &mut BytesMut, fields: &[(&str, Oid)]) {
    let mut enc = Encoder::new(buf, Some(b'T'));
    enc.push_int16(fields.len() as i16);
    for &(name, oid) in fields {
        enc.push_cstring(name)
            .push_int32(0)
            .push_int16(0)
            .push_int32(oid)
            .push_int16(-1)
            .push_int32(-1)
            .push_int16(0);
    }
    enc.finalize();
}

pub fn data_row(buf: &mut BytesMut, values: &[Option<&str>]) {
    let mut enc = Encoder::new(buf, Some(b'D'));
    enc.push_int16(values.len() as i16);
    for value in values {
        match value {
            Some(value) => enc.push_int32(value.len() as i32).push_raw_string(value),
            None => enc.push_int32(-1),
        };
    }
    enc.finalize();
}

pub fn command_complete(buf: &mut BytesMut, tag: &str) {
    let mut enc = Encoder::new(buf, Some(b'C'));
    enc.push_cstring(tag);
    enc.finalize();
}

/// `CopyInResponse` or `CopyOutResponse` of a single text column.
pub fn copy_response(buf: &mut BytesMut, tag: u8) {
    let mut enc = Encoder::new(buf, Some(tag));
    enc.push_raw_string([0]).push_int16(1).push_int16(0);
    enc.finalize();
}

pub fn copy_data(buf: &mut BytesMut, data: &str) {
    let mut enc = Encoder::new(buf, Some(b'd'));
    enc.push_raw_string(data);
    enc.finalize();
}

pub fn copy_done(buf: &mut BytesMut) {
    Encoder::new(buf, Some(b'c')).finalize();
}

pub fn empty_query(buf: &mut BytesMut) {
    Encoder::new(buf, Some(b'I')).finalize();
}

pub fn error(buf: &mut BytesMut, severity: &str, code: &str, message: &str) {
    let mut enc = Encoder::new(buf, Some(b'E'));
    enc.push_multi_cstring([
        format!("S{severity}"),
        format!("V{severity}"),
        format!("C{code}"),
        format!("M{message}"),
    ]);
    enc.finalize();
}

pub fn notice(buf: &mut BytesMut, message: &str) {
    let mut enc = Encoder::new(buf, Some(b'N'));
    enc.push_multi_cstring(["SNOTICE".to_owned(), format!("M{message}")]);
    enc.finalize();
}

/// Everything a trust-authenticated server sends after the startup message.
pub fn handshake(buf: &mut BytesMut) {
    auth(buf, 0);
    parameter_status(buf, "server_version", "17.0");
    parameter_status(buf, "client_encoding", "UTF8");
    backend_key(buf, 4242, -7);
    ready(buf, b'I');
}

/// A complete simple query cycle returning `rows` of a single int4 column.
pub fn select_int(buf: &mut BytesMut, column: &str, rows: &[&str]) {
    row_description(buf, &[(column, 23)]);
    for row in rows {
        data_row(buf, &[Some(*row)]);
    }
    command_complete(buf, &format!("SELECT {}", rows.len()));
    ready(buf, b'I');
}
