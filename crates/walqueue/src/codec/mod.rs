//! Batch codecs: interned, compact encoding of samples and metadata.
//!
//! A batch is encoded once per flush. Every label name and value that appears
//! in the batch is stored exactly once in a string table; samples refer to
//! strings by table index.
//!
//! # Formats
//!
//! - [`FileFormat::V1`]: samples and native histograms only.
//! - [`FileFormat::V2`]: adds one exemplar per sample and metadata entries.
//!
//! The format is picked by configuration and recorded in the batch metadata
//! under [`META_VERSION`], so a reader can call [`decode_batch`] without
//! knowing which writer produced the file.
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_walqueue::codec::{self, FileFormat};
//!
//! let mut marshaller = codec::new_marshaller(FileFormat::V2);
//! marshaller.add_sample(&sample, &external_labels);
//! let (meta, buf) = marshaller.marshal()?;
//! let records = codec::unmarshal(FileFormat::V2, &buf)?;
//! ```

mod histogram;
pub mod v1;
pub mod v2;
pub mod wire;

use crate::error::{QueueError, Result};
use crate::labels::{Label, Labels};
use crate::sample::{Exemplar, HistogramValue, Metadata, Sample};
use bytes::BufMut;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use wire::{put_uvarint, WireReader};

/// Metadata key holding the batch format.
pub const META_VERSION: &str = "version";
/// Metadata key holding the compression scheme.
pub const META_COMPRESSION: &str = "compression";
/// Metadata key holding the number of encoded series.
pub const META_SERIES_COUNT: &str = "series_count";
/// Metadata key holding the number of encoded metadata entries.
pub const META_META_COUNT: &str = "meta_count";
/// Metadata key holding the number of interned strings.
pub const META_STRINGS_COUNT: &str = "strings_count";
/// Metadata key holding series plus metadata entries.
pub const META_RECORD_COUNT: &str = "record_count";

/// Default zstd level used for batches.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 1;

/// Encoded batch format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileFormat {
    /// Samples and histograms, no exemplars or metadata.
    V1,
    /// Samples, histograms, exemplars and metadata.
    #[default]
    V2,
}

impl FileFormat {
    /// Version string written to [`META_VERSION`].
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V1 => "walqueue.v1",
            Self::V2 => "walqueue.v2",
        }
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileFormat {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "walqueue.v1" => Ok(Self::V1),
            "walqueue.v2" => Ok(Self::V2),
            other => Err(QueueError::UnknownFormat(other.to_string())),
        }
    }
}

/// Compression applied to an encoded batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// zstd frame (written by this crate).
    #[default]
    Zstd,
    /// Raw snappy block (read-only support for older files).
    Snappy,
}

impl Compression {
    /// Tag written to [`META_COMPRESSION`].
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zstd => "zstd",
            Self::Snappy => "snappy",
        }
    }
}

impl FromStr for Compression {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "zstd" => Ok(Self::Zstd),
            "snappy" => Ok(Self::Snappy),
            other => Err(QueueError::UnknownCompression(other.to_string())),
        }
    }
}

/// Compresses `data`. `level` only applies to zstd.
pub fn compress(data: &[u8], compression: Compression, level: i32) -> Result<Vec<u8>> {
    match compression {
        Compression::Zstd => {
            zstd::encode_all(data, level).map_err(|e| QueueError::CompressionError(e.to_string()))
        }
        Compression::Snappy => snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(|e| QueueError::CompressionError(e.to_string())),
    }
}

/// Decompresses `data`.
pub fn decompress(data: &[u8], compression: Compression) -> Result<Vec<u8>> {
    match compression {
        Compression::Zstd => {
            zstd::decode_all(data).map_err(|e| QueueError::DecompressionError(e.to_string()))
        }
        Compression::Snappy => snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| QueueError::DecompressionError(e.to_string())),
    }
}

/// A decoded series sample.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesRecord {
    /// Series labels merged with the external labels.
    pub labels: Labels,
    /// Hash of the series' own labels at encode time.
    pub hash: u64,
    /// Timestamp in milliseconds.
    pub timestamp: i64,
    /// Scalar value. Meaningless when `histogram` is set.
    pub value: f64,
    /// Native histogram, if this is a histogram sample.
    pub histogram: Option<HistogramValue>,
    /// Attached exemplar (format v2 only).
    pub exemplar: Option<Exemplar>,
}

/// A decoded metadata entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRecord {
    /// Metric family name.
    pub metric_family_name: String,
    /// Unit.
    pub unit: String,
    /// Help text.
    pub help: String,
    /// Type string.
    pub kind: String,
}

/// One decoded entry of a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// A series sample.
    Series(SeriesRecord),
    /// A metadata entry.
    Metadata(MetadataRecord),
}

/// A fully decoded batch, including its string table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DecodedBatch {
    /// Interned strings in index order.
    pub strings: Vec<String>,
    /// Series records followed by metadata records.
    pub records: Vec<Record>,
}

/// Accumulates samples and metadata and encodes them into one buffer.
///
/// `marshal` must not run concurrently with `add_*` on the same instance;
/// callers hold it behind a lock.
pub trait Marshaller: Send {
    /// Format this marshaller writes.
    fn format(&self) -> FileFormat;

    /// Appends one sample, interning its labels merged with `external_labels`.
    fn add_sample(&mut self, sample: &Sample, external_labels: &Labels);

    /// Appends one metadata entry.
    fn add_metadata(&mut self, metadata: &Metadata);

    /// Encodes everything added since the last call and resets the batch.
    ///
    /// Returns the batch metadata map and the encoded buffer.
    fn marshal(&mut self) -> Result<(HashMap<String, String>, Vec<u8>)>;
}

/// Creates a marshaller for `format`.
pub fn new_marshaller(format: FileFormat) -> Box<dyn Marshaller> {
    match format {
        FileFormat::V1 => Box::new(v1::V1Marshaller::new()),
        FileFormat::V2 => Box::new(v2::V2Marshaller::new()),
    }
}

/// Decodes an uncompressed buffer written in `format`.
pub fn decode(format: FileFormat, buf: &[u8]) -> Result<DecodedBatch> {
    match format {
        FileFormat::V1 => v1::decode(buf),
        FileFormat::V2 => v2::decode(buf),
    }
}

/// Decodes an uncompressed buffer written in `format` into records.
pub fn unmarshal(format: FileFormat, buf: &[u8]) -> Result<Vec<Record>> {
    decode(format, buf).map(|batch| batch.records)
}

/// Decodes a batch popped from the file queue.
///
/// Decompresses according to [`META_COMPRESSION`] (snappy when absent, for
/// files written before the tag existed) and dispatches on [`META_VERSION`].
pub fn decode_batch(meta: &HashMap<String, String>, buf: &[u8]) -> Result<Vec<Record>> {
    let format = meta
        .get(META_VERSION)
        .ok_or_else(|| QueueError::UnknownFormat(String::new()))?
        .parse::<FileFormat>()?;
    let compression = match meta.get(META_COMPRESSION) {
        Some(tag) => tag.parse::<Compression>()?,
        None => Compression::Snappy,
    };
    let raw = decompress(buf, compression)?;
    unmarshal(format, &raw)
}

/// Builds the metadata map returned by `marshal`.
pub(crate) fn batch_meta(
    series_count: usize,
    meta_count: usize,
    strings_count: usize,
) -> HashMap<String, String> {
    HashMap::from([
        (META_SERIES_COUNT.to_string(), series_count.to_string()),
        (META_META_COUNT.to_string(), meta_count.to_string()),
        (META_STRINGS_COUNT.to_string(), strings_count.to_string()),
        (
            META_RECORD_COUNT.to_string(),
            (series_count + meta_count).to_string(),
        ),
    ])
}

/// Per-batch string table.
#[derive(Debug, Default)]
pub(crate) struct StringInterner {
    index: HashMap<String, u32>,
    table: Vec<String>,
}

impl StringInterner {
    /// Returns the index of `s`, adding it on first sight.
    pub(crate) fn intern(&mut self, s: &str) -> u32 {
        if let Some(&idx) = self.index.get(s) {
            return idx;
        }
        let idx = self.table.len() as u32;
        self.index.insert(s.to_string(), idx);
        self.table.push(s.to_string());
        idx
    }

    /// Takes the table in index order and clears the interner.
    pub(crate) fn take_table(&mut self) -> Vec<String> {
        self.index.clear();
        std::mem::take(&mut self.table)
    }
}

/// Interns `labels` and writes them as a count plus `(name, value)` index pairs.
pub(crate) fn put_labels<'a, B: BufMut>(
    buf: &mut B,
    strings: &mut StringInterner,
    scratch: &mut Vec<u32>,
    labels: impl Iterator<Item = &'a Label>,
) {
    scratch.clear();
    for label in labels {
        scratch.push(strings.intern(&label.name));
        scratch.push(strings.intern(&label.value));
    }
    put_uvarint(buf, (scratch.len() / 2) as u64);
    for idx in scratch.iter() {
        put_uvarint(buf, u64::from(*idx));
    }
}

pub(crate) fn put_string_table<B: BufMut>(buf: &mut B, table: &[String]) {
    put_uvarint(buf, table.len() as u64);
    for s in table {
        wire::put_str(buf, s);
    }
}

pub(crate) fn read_string_table(reader: &mut WireReader<'_>) -> Result<Vec<String>> {
    let n = reader.len_prefix(1)?;
    let mut table = Vec::with_capacity(n);
    for _ in 0..n {
        table.push(reader.string()?);
    }
    Ok(table)
}

pub(crate) fn lookup<'t>(table: &'t [String], reader: &mut WireReader<'_>) -> Result<&'t str> {
    let index = reader.uvarint_u32()?;
    table
        .get(index as usize)
        .map(String::as_str)
        .ok_or(QueueError::InvalidStringIndex {
            index,
            len: table.len(),
        })
}

pub(crate) fn read_labels(reader: &mut WireReader<'_>, table: &[String]) -> Result<Labels> {
    let n = reader.len_prefix(2)?;
    let mut labels = Vec::with_capacity(n);
    for _ in 0..n {
        let name = lookup(table, reader)?;
        let value = lookup(table, reader)?;
        labels.push(Label::new(name, value));
    }
    Ok(Labels::new(labels))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interner_dedups() {
        let mut strings = StringInterner::default();
        assert_eq!(strings.intern("job"), 0);
        assert_eq!(strings.intern("api"), 1);
        assert_eq!(strings.intern("job"), 0);
        assert_eq!(strings.take_table(), vec!["job", "api"]);
        assert_eq!(strings.intern("api"), 0);
    }

    #[test]
    fn test_format_parse() {
        assert_eq!("walqueue.v1".parse::<FileFormat>().unwrap(), FileFormat::V1);
        assert_eq!(FileFormat::default().as_str(), "walqueue.v2");
        assert!(matches!(
            "prometheus.v9".parse::<FileFormat>(),
            Err(QueueError::UnknownFormat(_))
        ));
    }

    #[test]
    fn test_compression_roundtrip() {
        let data = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaabbbbbbbbbbbbbbbb".repeat(16);
        for compression in [Compression::Zstd, Compression::Snappy] {
            let packed = compress(&data, compression, DEFAULT_COMPRESSION_LEVEL).unwrap();
            assert!(packed.len() < data.len());
            assert_eq!(decompress(&packed, compression).unwrap(), data);
        }
    }

    #[test]
    fn test_decode_batch_requires_version() {
        let meta = HashMap::new();
        assert!(matches!(
            decode_batch(&meta, &[]),
            Err(QueueError::UnknownFormat(_))
        ));
    }

    #[test]
    fn test_decode_batch_rejects_unknown_compression() {
        let meta = HashMap::from([
            (META_VERSION.to_string(), "walqueue.v2".to_string()),
            (META_COMPRESSION.to_string(), "brotli".to_string()),
        ]);
        assert!(matches!(
            decode_batch(&meta, &[]),
            Err(QueueError::UnknownCompression(_))
        ));
    }

    #[test]
    fn test_decode_batch_defaults_to_snappy() {
        let mut marshaller = new_marshaller(FileFormat::V2);
        marshaller.add_sample(
            &Sample::new(Labels::from_pairs([("__name__", "up")]), 1_000, 1.0),
            &Labels::empty(),
        );
        let (_, raw) = marshaller.marshal().unwrap();
        let packed = compress(&raw, Compression::Snappy, 0).unwrap();

        let meta = HashMap::from([(META_VERSION.to_string(), "walqueue.v2".to_string())]);
        let records = decode_batch(&meta, &packed).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_lookup_out_of_range() {
        let table = vec!["a".to_string()];
        let mut buf = Vec::new();
        put_uvarint(&mut buf, 5);
        let mut reader = WireReader::new(&buf);
        assert!(matches!(
            lookup(&table, &mut reader),
            Err(QueueError::InvalidStringIndex { index: 5, len: 1 })
        ));
    }
}
