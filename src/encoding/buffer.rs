//! Big-endian write buffer and reader used for page serialization. The
//! multi-byte fields of the file format are big-endian; everything
//! variable-length goes through the varint codec.

use eyre::{ensure, Result};

use super::varint::{decode_varint, encode_varint};

/// An append-only byte buffer with big-endian primitives. Wraps a plain
/// `Vec<u8>` so the commit path can pool and reuse the allocation.
#[derive(Debug, Default)]
pub struct WriteBuffer {
    data: Vec<u8>,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            data: Vec::with_capacity(cap),
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn put_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_varint(&mut self, v: u64) {
        encode_varint(v, &mut self.data);
    }

    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Extends the buffer with zeros up to `len`.
    pub fn pad_to(&mut self, len: usize) {
        debug_assert!(len >= self.data.len());
        self.data.resize(len, 0);
    }

    /// Overwrites previously written bytes in place.
    pub fn patch(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }
}

/// A cursor over a byte slice with big-endian primitives.
#[derive(Debug, Clone, Copy)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        ensure!(self.remaining() >= 1, "buffer underflow reading u8");
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        ensure!(self.remaining() >= 2, "buffer underflow reading u16");
        let v = u16::from_be_bytes(self.buf[self.pos..self.pos + 2].try_into().unwrap());
        self.pos += 2;
        Ok(v)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        ensure!(self.remaining() >= 4, "buffer underflow reading u32");
        let v = u32::from_be_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        ensure!(self.remaining() >= 8, "buffer underflow reading u64");
        let v = u64::from_be_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        Ok(self.get_u64()? as i64)
    }

    pub fn get_varint(&mut self) -> Result<u64> {
        let (value, read) = decode_varint(&self.buf[self.pos..])?;
        self.pos += read;
        Ok(value)
    }

    pub fn get_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        ensure!(
            self.remaining() >= len,
            "buffer underflow reading {} bytes",
            len
        );
        let s = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_round_trip() {
        let mut buf = WriteBuffer::new();
        buf.put_u8(7);
        buf.put_u16(0xBEEF);
        buf.put_u32(0xDEAD_BEEF);
        buf.put_u64(0x0102_0304_0506_0708);
        buf.put_i64(-42);
        buf.put_varint(70_000);
        buf.put_slice(b"tail");

        let mut r = ByteReader::new(buf.as_slice());
        assert_eq!(r.get_u8().unwrap(), 7);
        assert_eq!(r.get_u16().unwrap(), 0xBEEF);
        assert_eq!(r.get_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.get_u64().unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(r.get_i64().unwrap(), -42);
        assert_eq!(r.get_varint().unwrap(), 70_000);
        assert_eq!(r.get_slice(4).unwrap(), b"tail");
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn patch_overwrites_in_place() {
        let mut buf = WriteBuffer::new();
        buf.put_u32(0);
        buf.put_slice(b"rest");
        buf.patch(0, &9u32.to_be_bytes());

        let mut r = ByteReader::new(buf.as_slice());
        assert_eq!(r.get_u32().unwrap(), 9);
    }

    #[test]
    fn underflow_is_an_error() {
        let mut r = ByteReader::new(&[1, 2]);
        assert!(r.get_u32().is_err());
    }
}
