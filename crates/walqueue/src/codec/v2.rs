//! Batch format `walqueue.v2`.
//!
//! ```text
//! string table | series count | series... | metadata count | metadata...
//!
//! series   := labels | hash (u64 LE) | timestamp (varint) | value (f64)
//!             | histogram | exemplar tag (u8) [labels | value | has_ts (u8) | ts]
//! metadata := name idx | unit idx | help idx | type idx
//! ```
//!
//! Exemplar labels and metadata strings share the batch string table.

use super::histogram::{put_histogram, read_histogram};
use super::wire::{put_f64, put_uvarint, put_varint, WireReader};
use super::{
    batch_meta, lookup, put_labels, put_string_table, read_labels, read_string_table,
    DecodedBatch, FileFormat, Marshaller, MetadataRecord, Record, SeriesRecord, StringInterner,
};
use crate::error::{QueueError, Result};
use crate::labels::Labels;
use crate::sample::{Exemplar, Metadata, Sample};
use bytes::{BufMut, BytesMut};
use std::collections::HashMap;

/// Smallest possible encoded series entry.
const MIN_SERIES_SIZE: usize = 20;

/// Smallest possible encoded metadata entry.
const MIN_METADATA_SIZE: usize = 4;

/// Marshaller for [`FileFormat::V2`].
#[derive(Debug, Default)]
pub struct V2Marshaller {
    strings: StringInterner,
    series: BytesMut,
    metadata: BytesMut,
    series_count: usize,
    meta_count: usize,
    scratch: Vec<u32>,
}

impl V2Marshaller {
    /// Creates an empty marshaller.
    pub fn new() -> Self {
        Self::default()
    }

    fn put_exemplar(&mut self, exemplar: Option<&Exemplar>) {
        match exemplar {
            None => self.series.put_u8(0),
            Some(ex) => {
                self.series.put_u8(1);
                put_labels(
                    &mut self.series,
                    &mut self.strings,
                    &mut self.scratch,
                    ex.labels.iter(),
                );
                put_f64(&mut self.series, ex.value);
                match ex.timestamp {
                    Some(ts) => {
                        self.series.put_u8(1);
                        put_varint(&mut self.series, ts);
                    }
                    None => self.series.put_u8(0),
                }
            }
        }
    }
}

impl Marshaller for V2Marshaller {
    fn format(&self) -> FileFormat {
        FileFormat::V2
    }

    fn add_sample(&mut self, sample: &Sample, external_labels: &Labels) {
        put_labels(
            &mut self.series,
            &mut self.strings,
            &mut self.scratch,
            sample.labels.merged_with(external_labels),
        );
        self.series.put_u64_le(sample.labels.hash());
        put_varint(&mut self.series, sample.timestamp);
        put_f64(&mut self.series, sample.value);
        put_histogram(&mut self.series, sample.histogram.as_ref());
        self.put_exemplar(sample.exemplar.as_ref());
        self.series_count += 1;
    }

    fn add_metadata(&mut self, metadata: &Metadata) {
        for s in [
            &metadata.name,
            &metadata.unit,
            &metadata.help,
            &metadata.metric_type,
        ] {
            let idx = self.strings.intern(s);
            put_uvarint(&mut self.metadata, u64::from(idx));
        }
        self.meta_count += 1;
    }

    fn marshal(&mut self) -> Result<(HashMap<String, String>, Vec<u8>)> {
        let table = self.strings.take_table();
        let meta = batch_meta(self.series_count, self.meta_count, table.len());

        let mut out = Vec::with_capacity(self.series.len() + self.metadata.len() + 64);
        put_string_table(&mut out, &table);
        put_uvarint(&mut out, self.series_count as u64);
        out.put_slice(&self.series);
        put_uvarint(&mut out, self.meta_count as u64);
        out.put_slice(&self.metadata);

        self.series.clear();
        self.metadata.clear();
        self.series_count = 0;
        self.meta_count = 0;
        Ok((meta, out))
    }
}

/// Decodes a `walqueue.v2` buffer.
///
/// Either the whole buffer decodes or an error is returned; no partial
/// batch is ever produced.
pub fn decode(buf: &[u8]) -> Result<DecodedBatch> {
    let mut reader = WireReader::new(buf);
    let strings = read_string_table(&mut reader)?;

    let series_count = reader.len_prefix(MIN_SERIES_SIZE)?;
    let mut records = Vec::with_capacity(series_count);
    for _ in 0..series_count {
        records.push(Record::Series(read_series(&mut reader, &strings)?));
    }

    let meta_count = reader.len_prefix(MIN_METADATA_SIZE)?;
    records.reserve(meta_count);
    for _ in 0..meta_count {
        records.push(Record::Metadata(MetadataRecord {
            metric_family_name: lookup(&strings, &mut reader)?.to_string(),
            unit: lookup(&strings, &mut reader)?.to_string(),
            help: lookup(&strings, &mut reader)?.to_string(),
            kind: lookup(&strings, &mut reader)?.to_string(),
        }));
    }

    reader.finish()?;
    Ok(DecodedBatch { strings, records })
}

fn read_series(reader: &mut WireReader<'_>, strings: &[String]) -> Result<SeriesRecord> {
    let labels = read_labels(reader, strings)?;
    let hash = read_u64_le(reader)?;
    let timestamp = reader.varint()?;
    let value = reader.f64()?;
    let histogram = read_histogram(reader)?;
    let exemplar = match reader.u8()? {
        0 => None,
        1 => {
            let labels = read_labels(reader, strings)?;
            let value = reader.f64()?;
            let timestamp = match reader.u8()? {
                0 => None,
                1 => Some(reader.varint()?),
                tag => {
                    return Err(QueueError::Corrupt(format!(
                        "invalid exemplar timestamp tag {}",
                        tag
                    )))
                }
            };
            Some(Exemplar {
                labels,
                value,
                timestamp,
            })
        }
        tag => return Err(QueueError::Corrupt(format!("invalid exemplar tag {}", tag))),
    };
    Ok(SeriesRecord {
        labels,
        hash,
        timestamp,
        value,
        histogram,
        exemplar,
    })
}

pub(super) fn read_u64_le(reader: &mut WireReader<'_>) -> Result<u64> {
    let mut raw = [0u8; 8];
    for byte in raw.iter_mut() {
        *byte = reader.u8()?;
    }
    Ok(u64::from_le_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{Histogram, HistogramValue};

    fn sample(name: &str, job: &str, ts: i64, value: f64) -> Sample {
        Sample::new(Labels::from_pairs([("__name__", name), ("job", job)]), ts, value)
    }

    #[test]
    fn test_marshal_counts_and_interning() {
        let mut m = V2Marshaller::new();
        m.add_sample(&sample("up", "api", 1, 1.0), &Labels::empty());
        m.add_sample(&sample("up", "db", 2, 0.0), &Labels::empty());
        m.add_metadata(&Metadata::new("up", "", "Target is up", "gauge"));

        let (meta, buf) = m.marshal().unwrap();
        assert_eq!(meta["series_count"], "2");
        assert_eq!(meta["meta_count"], "1");
        assert_eq!(meta["record_count"], "3");
        // __name__, up, job, api, db, "", Target is up, gauge
        assert_eq!(meta["strings_count"], "8");

        let batch = decode(&buf).unwrap();
        assert_eq!(batch.strings.len(), 8);
        assert_eq!(batch.records.len(), 3);
        match &batch.records[2] {
            Record::Metadata(md) => {
                assert_eq!(md.metric_family_name, "up");
                assert_eq!(md.help, "Target is up");
                assert_eq!(md.kind, "gauge");
            }
            other => panic!("expected metadata, got {:?}", other),
        }
    }

    #[test]
    fn test_marshal_resets_batch() {
        let mut m = V2Marshaller::new();
        m.add_sample(&sample("up", "api", 1, 1.0), &Labels::empty());
        m.marshal().unwrap();

        let (meta, buf) = m.marshal().unwrap();
        assert_eq!(meta["series_count"], "0");
        assert_eq!(meta["strings_count"], "0");
        assert!(decode(&buf).unwrap().records.is_empty());
    }

    #[test]
    fn test_external_labels_merged() {
        let mut m = V2Marshaller::new();
        let external = Labels::from_pairs([("cluster", "eu-1"), ("job", "ignored")]);
        let s = sample("up", "api", 10, 1.0);
        let hash = s.hash();
        m.add_sample(&s, &external);

        let (_, buf) = m.marshal().unwrap();
        let batch = decode(&buf).unwrap();
        let Record::Series(series) = &batch.records[0] else {
            panic!("expected series");
        };
        assert_eq!(series.labels.get("cluster"), Some("eu-1"));
        assert_eq!(series.labels.get("job"), Some("api"));
        assert_eq!(series.labels.len(), 3);
        assert_eq!(series.hash, hash);
    }

    #[test]
    fn test_exemplar_and_histogram_preserved() {
        let mut s = sample("rpc_seconds", "api", 5, 0.0);
        s.histogram = Some(HistogramValue::Int(Histogram {
            count: 4,
            sum: 1.5,
            ..Default::default()
        }));
        s.exemplar = Some(Exemplar {
            labels: Labels::from_pairs([("trace_id", "api")]),
            value: 0.25,
            timestamp: None,
        });

        let mut m = V2Marshaller::new();
        m.add_sample(&s, &Labels::empty());
        let (meta, buf) = m.marshal().unwrap();
        // exemplar value "api" reuses the series' interned string
        assert_eq!(meta["strings_count"], "5");

        let batch = decode(&buf).unwrap();
        let Record::Series(series) = &batch.records[0] else {
            panic!("expected series");
        };
        assert_eq!(series.histogram, s.histogram);
        assert_eq!(series.exemplar, s.exemplar);
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut m = V2Marshaller::new();
        m.add_sample(&sample("up", "api", 1, 1.0), &Labels::empty());
        let (_, mut buf) = m.marshal().unwrap();
        buf.push(0);
        assert!(matches!(decode(&buf), Err(QueueError::Corrupt(_))));
    }

    #[test]
    fn test_decode_rejects_bad_string_index() {
        let mut buf = Vec::new();
        put_string_table(&mut buf, &["only".to_string()]);
        put_uvarint(&mut buf, 1); // one series
        put_uvarint(&mut buf, 1); // one label
        put_uvarint(&mut buf, 0);
        put_uvarint(&mut buf, 7); // out of range
        buf.extend_from_slice(&[0u8; 24]);

        assert!(matches!(
            decode(&buf),
            Err(QueueError::InvalidStringIndex { index: 7, len: 1 })
        ));
    }

    #[test]
    fn test_decode_truncated_is_error() {
        let mut m = V2Marshaller::new();
        m.add_sample(&sample("up", "api", 1, 1.0), &Labels::empty());
        let (_, buf) = m.marshal().unwrap();
        for cut in 1..buf.len() {
            assert!(decode(&buf[..cut]).is_err(), "cut at {}", cut);
        }
    }
}
