//! Low-level wire primitives shared by the batch formats and the envelope.
//!
//! Integers are LEB128 varints (signed values zigzag encoded), floats are
//! little-endian IEEE 754, strings and byte blobs are varint length-prefixed.
//! [`WireReader`] never panics on short input; every read is bounds checked
//! and reports [`QueueError::Corrupt`].

use crate::error::{QueueError, Result};
use bytes::{Buf, BufMut};

/// Upper bound on a varint's encoded length.
const MAX_VARINT_LEN: usize = 10;

/// Writes an unsigned LEB128 varint.
pub fn put_uvarint<B: BufMut>(buf: &mut B, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Writes a zigzag encoded signed varint.
pub fn put_varint<B: BufMut>(buf: &mut B, value: i64) {
    put_uvarint(buf, ((value << 1) ^ (value >> 63)) as u64);
}

/// Writes a little-endian f64.
pub fn put_f64<B: BufMut>(buf: &mut B, value: f64) {
    buf.put_f64_le(value);
}

/// Writes a length-prefixed byte slice.
pub fn put_bytes<B: BufMut>(buf: &mut B, data: &[u8]) {
    put_uvarint(buf, data.len() as u64);
    buf.put_slice(data);
}

/// Writes a length-prefixed UTF-8 string.
pub fn put_str<B: BufMut>(buf: &mut B, s: &str) {
    put_bytes(buf, s.as_bytes());
}

/// Bounds-checked cursor over an encoded buffer.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    /// Creates a reader over `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(QueueError::Corrupt(format!(
                "truncated {}: need {} bytes, have {}",
                what,
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    /// Reads one byte.
    pub fn u8(&mut self) -> Result<u8> {
        self.need(1, "byte")?;
        Ok(self.buf.get_u8())
    }

    /// Reads an unsigned varint.
    pub fn uvarint(&mut self) -> Result<u64> {
        let mut value: u64 = 0;
        for i in 0..MAX_VARINT_LEN {
            self.need(1, "varint")?;
            let byte = self.buf.get_u8();
            if i == MAX_VARINT_LEN - 1 && byte > 1 {
                return Err(QueueError::Corrupt("varint overflows u64".to_string()));
            }
            value |= u64::from(byte & 0x7f) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(QueueError::Corrupt("varint too long".to_string()))
    }

    /// Reads a zigzag encoded signed varint.
    pub fn varint(&mut self) -> Result<i64> {
        let raw = self.uvarint()?;
        Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
    }

    /// Reads an unsigned varint that must fit in a u32.
    pub fn uvarint_u32(&mut self) -> Result<u32> {
        let raw = self.uvarint()?;
        u32::try_from(raw).map_err(|_| QueueError::Corrupt(format!("value {} overflows u32", raw)))
    }

    /// Reads a signed varint that must fit in an i32.
    pub fn varint_i32(&mut self) -> Result<i32> {
        let raw = self.varint()?;
        i32::try_from(raw).map_err(|_| QueueError::Corrupt(format!("value {} overflows i32", raw)))
    }

    /// Reads a length prefix, rejecting lengths larger than the remaining input.
    ///
    /// `min_item_size` is the smallest encoding of one counted item, so that
    /// a corrupt count cannot trigger a huge allocation.
    pub fn len_prefix(&mut self, min_item_size: usize) -> Result<usize> {
        let raw = self.uvarint()?;
        let len = usize::try_from(raw)
            .map_err(|_| QueueError::Corrupt(format!("length {} overflows usize", raw)))?;
        if len.saturating_mul(min_item_size.max(1)) > self.remaining() {
            return Err(QueueError::Corrupt(format!(
                "length {} exceeds remaining {} bytes",
                len,
                self.remaining()
            )));
        }
        Ok(len)
    }

    /// Reads a little-endian f64.
    pub fn f64(&mut self) -> Result<f64> {
        self.need(8, "f64")?;
        Ok(self.buf.get_f64_le())
    }

    /// Reads a length-prefixed byte slice without copying.
    pub fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.len_prefix(1)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn string(&mut self) -> Result<String> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| QueueError::Corrupt(format!("invalid UTF-8 string: {}", e)))
    }

    /// Fails if any input is left over.
    pub fn finish(&self) -> Result<()> {
        if self.buf.has_remaining() {
            return Err(QueueError::Corrupt(format!(
                "{} trailing bytes",
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}
