//! On-disk envelope for one committed file.
//!
//! ```text
//! +-------+---------+--------+------------------------------------------+
//! | magic | version | crc32  | body                                     |
//! | WALQ  | u16 LE  | u32 LE | meta count, (key, value)*, data          |
//! +-------+---------+--------+------------------------------------------+
//! ```
//!
//! Keys, values and data are varint length-prefixed. Meta pairs are written
//! in key order so identical inputs produce identical files.

use crate::codec::wire::{put_bytes, put_str, put_uvarint, WireReader};
use crate::error::{QueueError, Result};
use bytes::BufMut;
use std::collections::HashMap;

/// Envelope magic bytes.
pub const ENVELOPE_MAGIC: [u8; 4] = *b"WALQ";

/// Envelope format version.
pub const ENVELOPE_VERSION: u16 = 1;

/// Header size: magic + version + checksum.
const HEADER_SIZE: usize = 10;

/// Smallest encoded meta pair: two empty strings.
const MIN_PAIR_SIZE: usize = 2;

/// Serializes `meta` and `data` into a complete envelope.
pub fn encode(meta: &HashMap<String, String>, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(data.len() + 16 * meta.len() + 8);
    let mut pairs: Vec<(&String, &String)> = meta.iter().collect();
    pairs.sort();
    put_uvarint(&mut body, pairs.len() as u64);
    for (k, v) in pairs {
        put_str(&mut body, k);
        put_str(&mut body, v);
    }
    put_bytes(&mut body, data);

    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.put_slice(&ENVELOPE_MAGIC);
    out.put_u16_le(ENVELOPE_VERSION);
    out.put_u32_le(crc32fast::hash(&body));
    out.put_slice(&body);
    out
}

/// Parses an envelope, verifying magic, version and checksum.
pub fn decode(buf: &[u8]) -> Result<(HashMap<String, String>, Vec<u8>)> {
    if buf.len() < HEADER_SIZE {
        return Err(QueueError::Corrupt(format!(
            "envelope too short: {} bytes",
            buf.len()
        )));
    }
    let (header, body) = buf.split_at(HEADER_SIZE);

    let magic = [header[0], header[1], header[2], header[3]];
    if magic != ENVELOPE_MAGIC {
        return Err(QueueError::InvalidMagic(magic));
    }

    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != ENVELOPE_VERSION {
        return Err(QueueError::UnsupportedVersion(version));
    }

    let expected = u32::from_le_bytes([header[6], header[7], header[8], header[9]]);
    let actual = crc32fast::hash(body);
    if actual != expected {
        return Err(QueueError::ChecksumMismatch { expected, actual });
    }

    let mut reader = WireReader::new(body);
    let n = reader.len_prefix(MIN_PAIR_SIZE)?;
    let mut meta = HashMap::with_capacity(n);
    for _ in 0..n {
        let key = reader.string()?;
        let value = reader.string()?;
        meta.insert(key, value);
    }
    let data = reader.bytes()?.to_vec();
    reader.finish()?;

    Ok((meta, data))
}
