//! Explicit little-endian byte writer/reader.
//!
//! All multi-byte fields on the wire are little-endian regardless of host
//! byte order, so every encode/decode goes through here rather than relying
//! on native memory layout (§9 "Endian-correct serialization").

use crate::status::{ErrorKind, Status, StatusResult};

/// Append-only little-endian byte writer, grounded on the original
/// `ByteFlattener` helper.
#[derive(Debug, Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        ByteWriter { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        ByteWriter {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i8(&mut self, v: i8) {
        self.buf.push(v as u8);
    }

    pub fn write_i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Writes a NUL-terminated UTF-8 string, preceded by its length
    /// (including the NUL) as a 32-bit count, as required by the string and
    /// field-name wire encodings.
    pub fn write_cstr_with_len(&mut self, s: &str) {
        let len_including_nul = s.len() as u32 + 1;
        self.write_u32(len_including_nul);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    /// Patches a previously-written 32-bit little-endian word in place.
    pub fn patch_u32(&mut self, offset: usize, v: u32) {
        self.buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
    }
}

/// Bounds-checked little-endian reader over a borrowed byte slice, grounded
/// on the original `CheckedDataFlattener` helper: every read rejects
/// attempts to move past the end of the buffer instead of panicking or
/// reading uninitialized memory.
#[derive(Debug, Clone, Copy)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        ByteReader { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> StatusResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(Status::new(ErrorKind::BadArgument));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn read_u8(&mut self) -> StatusResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u32(&mut self) -> StatusResult<u32> {
        let s = self.take(4)?;
        Ok(u32::from_le_bytes(s.try_into().unwrap()))
    }

    pub fn read_i8(&mut self) -> StatusResult<i8> {
        Ok(self.take(1)?[0] as i8)
    }

    pub fn read_i16(&mut self) -> StatusResult<i16> {
        let s = self.take(2)?;
        Ok(i16::from_le_bytes(s.try_into().unwrap()))
    }

    pub fn read_i32(&mut self) -> StatusResult<i32> {
        let s = self.take(4)?;
        Ok(i32::from_le_bytes(s.try_into().unwrap()))
    }

    pub fn read_i64(&mut self) -> StatusResult<i64> {
        let s = self.take(8)?;
        Ok(i64::from_le_bytes(s.try_into().unwrap()))
    }

    pub fn read_f32(&mut self) -> StatusResult<f32> {
        let s = self.take(4)?;
        Ok(f32::from_le_bytes(s.try_into().unwrap()))
    }

    pub fn read_f64(&mut self) -> StatusResult<f64> {
        let s = self.take(8)?;
        Ok(f64::from_le_bytes(s.try_into().unwrap()))
    }

    pub fn read_bytes(&mut self, n: usize) -> StatusResult<&'a [u8]> {
        self.take(n)
    }

    /// Reads a length-prefixed, NUL-terminated string (the length includes
    /// the terminator). An empty string is encoded as length 1, one NUL
    /// byte.
    pub fn read_cstr_with_len(&mut self) -> StatusResult<String> {
        let len_including_nul = self.read_u32()? as usize;
        if len_including_nul == 0 {
            return Err(Status::new(ErrorKind::BadArgument));
        }
        let bytes = self.take(len_including_nul)?;
        let (body, nul) = bytes.split_at(len_including_nul - 1);
        if nul != [0] {
            return Err(Status::new(ErrorKind::BadArgument));
        }
        String::from_utf8(body.to_vec()).map_err(|_| Status::new(ErrorKind::BadArgument))
    }
}
