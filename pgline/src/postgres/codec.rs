//! Frame codec.
//!
//! Every message is enveloped as:
//!
//! ```text
//! ┏━━━━━━━━━━━━━┳━━━━━━━━━━━━━━━━━━━┳━━━━━━━━━┓
//! ┃ Tag         ┃ Length            ┃ Payload ┃
//! ┣━━━━━━━━━━━━━╋━━━━━━━━━━━━━━━━━━━╋━━━━━━━━━┫
//! ┃ u8 (or none)┃ i32, big endian   ┃ [u8]    ┃
//! ┗━━━━━━━━━━━━━┻━━━━━━━━━━━━━━━━━━━┻━━━━━━━━━┛
//! ```
//!
//! The length counts itself but not the tag, so it is always `4 + payload.len()`.
//!
//! [`Encoder`] appends one frame to a write buffer, [`Decoder`] is a read cursor
//! over the payload of one received frame. Neither performs io.
use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::ProtocolError;
use crate::{common::ByteStr, ext::UsizeExt};

/// Size of the length field.
const LEN: usize = size_of::<i32>();

/// Largest frame accepted from the backend, postgres itself caps messages at 1 GiB.
pub const MAX_FRAME_LEN: usize = 1024 * 1024 * 1024;

/// Upper bound of a single reservation while waiting for a frame body.
const RESERVE_CHUNK: usize = 64 * 1024;

/// Appends a single frame to a buffer.
///
/// The length field is reserved up front and written by [`Encoder::finalize`].
#[must_use = "frame length is only written on `finalize`"]
pub struct Encoder<'a> {
    buf: &'a mut BytesMut,
    /// Position of the length field.
    offset: usize,
}

impl<'a> Encoder<'a> {
    /// Begin a frame.
    ///
    /// `tag` is `None` only for the startup and ssl request messages, which for
    /// historical reasons have no message-type byte.
    pub fn new(buf: &'a mut BytesMut, tag: Option<u8>) -> Self {
        if let Some(tag) = tag {
            buf.put_u8(tag);
        }
        let offset = buf.len();
        buf.put_i32(0);
        Self { buf, offset }
    }

    /// Append 4 bytes, two's complement, big endian.
    pub fn push_int32(&mut self, n: i32) -> &mut Self {
        self.buf.put_i32(n);
        self
    }

    /// Append 2 bytes, two's complement, big endian.
    pub fn push_int16(&mut self, n: i16) -> &mut Self {
        self.buf.put_i16(n);
        self
    }

    /// Append bytes verbatim, without terminator.
    pub fn push_raw_string(&mut self, s: impl AsRef<[u8]>) -> &mut Self {
        self.buf.put_slice(s.as_ref());
        self
    }

    /// Append bytes followed by a nul terminator.
    pub fn push_cstring(&mut self, s: impl AsRef<[u8]>) -> &mut Self {
        let s = s.as_ref();
        debug_assert!(!s.contains(&0), "cstring contains nul byte");
        self.buf.put_slice(s);
        self.buf.put_u8(b'\0');
        self
    }

    /// Append each string nul terminated, followed by one extra nul.
    pub fn push_multi_cstring<I>(&mut self, strings: I) -> &mut Self
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        for s in strings {
            self.push_cstring(s);
        }
        self.buf.put_u8(b'\0');
        self
    }

    /// Append `key NUL value NUL` for each pair in iteration order, followed by one extra nul.
    pub fn push_hash<I, K, V>(&mut self, pairs: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        for (key, value) in pairs {
            self.push_cstring(key);
            self.push_cstring(value);
        }
        self.buf.put_u8(b'\0');
        self
    }

    /// Write the length field, returns the frame length (excluding tag).
    pub fn finalize(self) -> i32 {
        let len = (self.buf.len() - self.offset).to_i32();
        self.buf[self.offset..self.offset + LEN].copy_from_slice(&len.to_be_bytes());
        len
    }
}

/// A read cursor over one frame payload.
///
/// Every `shift_*` returns [`ProtocolError::FrameTruncated`] instead of reading
/// out of bounds.
#[derive(Debug, Clone)]
pub struct Decoder {
    buf: Bytes,
    pos: usize,
}

impl Decoder {
    pub fn new(buf: Bytes) -> Self {
        Self { buf, pos: 0 }
    }

    /// Number of bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Returns `true` if all bytes have been consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<Bytes, ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::truncated(n, self.remaining()));
        }
        let bytes = self.buf.slice(self.pos..self.pos + n);
        self.pos += n;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        if self.remaining() < N {
            return Err(ProtocolError::truncated(N, self.remaining()));
        }
        let mut array = [0u8; N];
        array.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        Ok(array)
    }

    /// Consume one byte.
    pub fn shift_tag(&mut self) -> Result<u8, ProtocolError> {
        self.take_array::<1>().map(|[b]| b)
    }

    /// Consume 4 bytes as big endian signed integer.
    pub fn shift_int32(&mut self) -> Result<i32, ProtocolError> {
        self.take_array().map(i32::from_be_bytes)
    }

    /// Consume 2 bytes as big endian signed integer.
    pub fn shift_int16(&mut self) -> Result<i16, ProtocolError> {
        self.take_array().map(i16::from_be_bytes)
    }

    /// Consume exactly `len` bytes.
    pub fn shift_raw_string(&mut self, len: usize) -> Result<Bytes, ProtocolError> {
        self.take(len)
    }

    /// Consume up to and including the next nul, returns the bytes before it.
    pub fn shift_cstring(&mut self) -> Result<Bytes, ProtocolError> {
        let Some(end) = self.buf[self.pos..].iter().position(|&b| b == b'\0') else {
            return Err(ProtocolError::truncated(self.remaining() + 1, self.remaining()));
        };
        let string = self.take(end)?;
        self.pos += 1;
        Ok(string)
    }

    /// Same as [`shift_cstring`][Decoder::shift_cstring] with utf8 validation.
    pub fn shift_str(&mut self) -> Result<ByteStr, ProtocolError> {
        Ok(ByteStr::from_utf8(self.shift_cstring()?)?)
    }

    /// Consume nul terminated strings until the terminating extra nul.
    pub fn shift_multi_cstring(&mut self) -> Result<Vec<Bytes>, ProtocolError> {
        let mut strings = vec![];
        loop {
            if self.shift_tag()? == b'\0' {
                return Ok(strings);
            }
            self.pos -= 1;
            strings.push(self.shift_cstring()?);
        }
    }

    /// Consume the rest of the payload.
    pub fn shift_rest(&mut self) -> Bytes {
        let rest = self.buf.slice(self.pos..);
        self.pos = self.buf.len();
        rest
    }
}

/// One received frame.
#[derive(Debug)]
pub struct Frame {
    pub tag: u8,
    pub body: Bytes,
}

/// Split one complete frame from the front of `buf`.
///
/// Returns `None` when `buf` does not yet contain the whole frame, in which
/// case nothing is consumed.
pub fn split_frame(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    let Some(mut header) = buf.get(..1 + LEN) else {
        return Ok(None);
    };

    let tag = header.get_u8();
    let len = header.get_i32();

    if len < LEN as i32 || len as usize > MAX_FRAME_LEN {
        return Err(ProtocolError::InvalidLength(len));
    }

    let len = len as usize;

    if buf.len() < 1 + len {
        buf.reserve((1 + len - buf.len()).min(RESERVE_CHUNK));
        return Ok(None);
    }

    buf.advance(1 + LEN);
    let body = buf.split_to(len - LEN).freeze();

    Ok(Some(Frame { tag, body }))
}

#[cfg(test)]
mod test {
    use super::*;

    fn payload(f: impl FnOnce(&mut Encoder)) -> Decoder {
        let mut buf = BytesMut::new();
        let mut enc = Encoder::new(&mut buf, None);
        f(&mut enc);
        enc.finalize();
        Decoder::new(buf.freeze().slice(LEN..))
    }

    #[test]
    fn int32_boundaries() {
        for n in [0, 1, -1, 196_608, i32::MIN, i32::MAX] {
            let mut dec = payload(|e| { e.push_int32(n); });
            assert_eq!(dec.shift_int32().unwrap(), n);
            assert!(dec.is_empty());
        }
    }

    #[test]
    fn int16_boundaries() {
        for n in [0, 1, -1, i16::MIN, i16::MAX] {
            let mut dec = payload(|e| { e.push_int16(n); });
            assert_eq!(dec.shift_int16().unwrap(), n);
            assert!(dec.is_empty());
        }
    }

    #[test]
    fn negative_is_twos_complement() {
        let mut buf = BytesMut::new();
        Encoder::new(&mut buf, None).push_int32(-2).push_int16(-2);
        assert_eq!(&buf[LEN..], &[0xff, 0xff, 0xff, 0xfe, 0xff, 0xfe]);
    }

    #[test]
    fn cstring() {
        let mut dec = payload(|e| { e.push_cstring("client_encoding").push_cstring(""); });
        assert_eq!(dec.shift_cstring().unwrap(), "client_encoding");
        assert_eq!(dec.shift_cstring().unwrap(), "");
        assert!(dec.is_empty());
    }

    #[test]
    fn multi_cstring() {
        let cases: [&[&str]; 3] = [&[], &["SERROR"], &["SERROR", "C42601", "Msyntax error"]];
        for strings in cases {
            let mut dec = payload(|e| { e.push_multi_cstring(strings); });
            let found = dec.shift_multi_cstring().unwrap();
            assert_eq!(found, strings.iter().map(|s| s.as_bytes()).collect::<Vec<_>>());
            assert!(dec.is_empty());
        }
    }

    #[test]
    fn hash_layout() {
        let mut buf = BytesMut::new();
        let mut enc = Encoder::new(&mut buf, None);
        enc.push_hash([("user", "postgres"), ("database", "app")]);
        let len = enc.finalize();
        assert_eq!(&buf[LEN..], b"user\0postgres\0database\0app\0\0");
        assert_eq!(len as usize, buf.len());
    }

    #[test]
    fn tagged_length_excludes_tag() {
        let mut buf = BytesMut::new();
        let mut enc = Encoder::new(&mut buf, Some(b'Q'));
        enc.push_cstring("SELECT 1");
        assert_eq!(enc.finalize(), 4 + 9);
        assert_eq!(&buf[..], b"Q\0\0\0\x0dSELECT 1\0");
    }

    #[test]
    fn truncated() {
        let mut dec = Decoder::new(Bytes::from_static(b"\0\x01"));
        assert!(matches!(
            dec.shift_int32(),
            Err(ProtocolError::FrameTruncated { need: 4, remaining: 2 })
        ));
        // failed shift consume nothing
        assert_eq!(dec.shift_int16().unwrap(), 1);
        assert!(matches!(dec.shift_cstring(), Err(ProtocolError::FrameTruncated { .. })));
        assert!(matches!(dec.shift_raw_string(1), Err(ProtocolError::FrameTruncated { .. })));
    }

    #[test]
    fn unterminated_cstring() {
        let mut dec = Decoder::new(Bytes::from_static(b"abc"));
        assert!(matches!(dec.shift_cstring(), Err(ProtocolError::FrameTruncated { .. })));
        let mut dec = Decoder::new(Bytes::from_static(b"abc\0"));
        assert!(matches!(dec.shift_multi_cstring(), Err(ProtocolError::FrameTruncated { .. })));
    }

    #[test]
    fn split_partial_frame() {
        let mut buf = BytesMut::from(&b"Z\0\0\0"[..]);
        assert!(split_frame(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"\x05");
        assert!(split_frame(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 5);
        buf.extend_from_slice(b"IC\0\0\0\x04");
        let frame = split_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.tag, b'Z');
        assert_eq!(&frame.body[..], b"I");
        let frame = split_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.tag, b'C');
        assert!(frame.body.is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn split_invalid_length() {
        let mut buf = BytesMut::from(&b"Z\0\0\0\x03"[..]);
        assert!(matches!(split_frame(&mut buf), Err(ProtocolError::InvalidLength(3))));
    }

    #[test]
    fn split_oversized_length() {
        let mut buf = BytesMut::from(&b"D\x7f\xff\xff\xff"[..]);
        assert!(matches!(split_frame(&mut buf), Err(ProtocolError::InvalidLength(i32::MAX))));
        assert!(buf.capacity() < RESERVE_CHUNK * 2);

        let mut buf = BytesMut::from(&b"D\x40\0\0\x01"[..]);
        assert!(matches!(split_frame(&mut buf), Err(ProtocolError::InvalidLength(_))));
    }

    #[test]
    fn split_reserve_is_bounded() {
        let mut buf = BytesMut::from(&b"D\x3f\xff\xff\xff"[..]);
        assert!(split_frame(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 5);
        assert!(buf.capacity() <= 5 + RESERVE_CHUNK * 2);
    }
}
