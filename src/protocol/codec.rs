//! Byte-level encoding and decoding.
//!
//! All integers on the wire are big-endian.

use zerocopy::FromBytes;
use zerocopy::byteorder::big_endian::{I16 as I16BE, I32 as I32BE, U16 as U16BE, U32 as U32BE};

use crate::error::{Error, Result};

/// Largest backend message accepted before the stream is considered corrupt.
pub const MAX_MESSAGE_LEN: usize = 1 << 30;

/// Forward-only reader over a message payload.
#[derive(Debug, Clone, Copy)]
pub struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Bytes not yet consumed.
    pub fn rest(&self) -> &'a [u8] {
        self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Take `len` bytes.
    pub fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let (head, tail) = self.data.split_at_checked(len).ok_or_else(|| {
            Error::Protocol(format!(
                "message truncated: wanted {len} bytes, {} left",
                self.data.len()
            ))
        })?;
        self.data = tail;
        Ok(head)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn i16(&mut self) -> Result<i16> {
        Ok(I16BE::read_from_bytes(self.take(2)?)?.get())
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(U16BE::read_from_bytes(self.take(2)?)?.get())
    }

    pub fn i32(&mut self) -> Result<i32> {
        Ok(I32BE::read_from_bytes(self.take(4)?)?.get())
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(U32BE::read_from_bytes(self.take(4)?)?.get())
    }

    /// Null-terminated byte string, terminator consumed but not returned.
    pub fn cbytes(&mut self) -> Result<&'a [u8]> {
        let pos = memchr::memchr(0, self.data)
            .ok_or_else(|| Error::Protocol("string without null terminator".into()))?;
        let s = &self.data[..pos];
        self.data = &self.data[pos + 1..];
        Ok(s)
    }

    /// Null-terminated UTF-8 string.
    pub fn cstr(&mut self) -> Result<&'a str> {
        let bytes = self.cbytes()?;
        simdutf8::basic::from_utf8(bytes)
            .map_err(|_| Error::Protocol("string is not valid UTF-8".into()))
    }
}

/// Appends one framed message to an output buffer.
///
/// The length word is patched in by [`MessageBuilder::finish`].
pub struct MessageBuilder<'a> {
    buf: &'a mut Vec<u8>,
    len_at: usize,
}

impl<'a> MessageBuilder<'a> {
    /// Regular message: type byte followed by length.
    pub fn new(buf: &'a mut Vec<u8>, type_byte: u8) -> Self {
        buf.push(type_byte);
        Self::untyped(buf)
    }

    /// Startup-phase message: length only.
    pub fn untyped(buf: &'a mut Vec<u8>) -> Self {
        let len_at = buf.len();
        buf.extend_from_slice(&[0; 4]);
        Self { buf, len_at }
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn i16(&mut self, value: i16) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn i32(&mut self, value: i32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn bytes(&mut self, data: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(data);
        self
    }

    pub fn cstr(&mut self, s: &str) -> &mut Self {
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        self
    }

    /// Patch the length word (which counts itself but not the type byte).
    pub fn finish(self) {
        let len = (self.buf.len() - self.len_at) as u32;
        self.buf[self.len_at..self.len_at + 4].copy_from_slice(&len.to_be_bytes());
    }
}

/// Split one complete backend message off the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the message and
/// the number of bytes it occupied.
pub fn split_message(buf: &[u8]) -> Result<Option<(u8, &[u8], usize)>> {
    if buf.len() < 5 {
        return Ok(None);
    }
    let type_byte = buf[0];
    let len = U32BE::read_from_bytes(&buf[1..5])?.get() as usize;
    if !(4..=MAX_MESSAGE_LEN).contains(&len) {
        return Err(Error::Protocol(format!(
            "invalid length {len} for message type '{}'",
            type_byte as char
        )));
    }
    let total = 1 + len;
    if buf.len() < total {
        return Ok(None);
    }
    Ok(Some((type_byte, &buf[5..total], total)))
}
