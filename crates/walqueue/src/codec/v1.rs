//! Batch format `walqueue.v1`.
//!
//! The original layout: a string table followed by series entries.
//! Exemplars are dropped and metadata is never written.
//!
//! ```text
//! string table | series count | series...
//!
//! series := labels | hash (u64 LE) | timestamp (varint) | value (f64) | histogram
//! ```

use super::histogram::{put_histogram, read_histogram};
use super::v2::read_u64_le;
use super::wire::{put_f64, put_uvarint, put_varint, WireReader};
use super::{
    batch_meta, put_labels, put_string_table, read_labels, read_string_table, DecodedBatch,
    FileFormat, Marshaller, Record, SeriesRecord, StringInterner,
};
use crate::error::Result;
use crate::labels::Labels;
use crate::sample::{Metadata, Sample};
use bytes::{BufMut, BytesMut};
use std::collections::HashMap;

const MIN_SERIES_SIZE: usize = 19;

/// Marshaller for [`FileFormat::V1`].
#[derive(Debug, Default)]
pub struct V1Marshaller {
    strings: StringInterner,
    series: BytesMut,
    series_count: usize,
    scratch: Vec<u32>,
}

impl V1Marshaller {
    /// Creates an empty marshaller.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Marshaller for V1Marshaller {
    fn format(&self) -> FileFormat {
        FileFormat::V1
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
        self.series_count += 1;
    }

    fn add_metadata(&mut self, _metadata: &Metadata) {}

    fn marshal(&mut self) -> Result<(HashMap<String, String>, Vec<u8>)> {
        let table = self.strings.take_table();
        let meta = batch_meta(self.series_count, 0, table.len());

        let mut out = Vec::with_capacity(self.series.len() + 32);
        put_string_table(&mut out, &table);
        put_uvarint(&mut out, self.series_count as u64);
        out.put_slice(&self.series);

        self.series.clear();
        self.series_count = 0;
        Ok((meta, out))
    }
}

/// Decodes a `walqueue.v1` buffer.
pub fn decode(buf: &[u8]) -> Result<DecodedBatch> {
    let mut reader = WireReader::new(buf);
    let strings = read_string_table(&mut reader)?;

    let series_count = reader.len_prefix(MIN_SERIES_SIZE)?;
    let mut records = Vec::with_capacity(series_count);
    for _ in 0..series_count {
        let labels = read_labels(&mut reader, &strings)?;
        let hash = read_u64_le(&mut reader)?;
        let timestamp = reader.varint()?;
        let value = reader.f64()?;
        let histogram = read_histogram(&mut reader)?;
        records.push(Record::Series(SeriesRecord {
            labels,
            hash,
            timestamp,
            value,
            histogram,
            exemplar: None,
        }));
    }

    reader.finish()?;
    Ok(DecodedBatch { strings, records })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::Exemplar;

    #[test]
    fn test_v1_drops_exemplars_and_metadata() {
        let mut s = Sample::new(Labels::from_pairs([("__name__", "up")]), 7, 1.0);
        s.exemplar = Some(Exemplar {
            labels: Labels::from_pairs([("trace_id", "t1")]),
            value: 1.0,
            timestamp: Some(7),
        });

        let mut m = V1Marshaller::new();
        m.add_sample(&s, &Labels::empty());
        m.add_metadata(&Metadata::new("up", "", "help", "gauge"));
        let (meta, buf) = m.marshal().unwrap();

        assert_eq!(meta["series_count"], "1");
        assert_eq!(meta["meta_count"], "0");
        assert_eq!(meta["strings_count"], "2");

        let batch = decode(&buf).unwrap();
        assert_eq!(batch.records.len(), 1);
        let Record::Series(series) = &batch.records[0] else {
            panic!("expected series");
        };
        assert!(series.exemplar.is_none());
        assert_eq!(series.timestamp, 7);
        assert_eq!(series.value, 1.0);
    }

    #[test]
    fn test_v1_reader_rejects_v2_payload() {
        let mut m = super::super::v2::V2Marshaller::new();
        m.add_sample(
            &Sample::new(Labels::from_pairs([("__name__", "up")]), 7, 1.0),
            &Labels::empty(),
        );
        let (_, buf) = m.marshal().unwrap();
        // v2 carries an exemplar tag and a metadata count v1 does not expect
        assert!(decode(&buf).is_err());
    }
}
