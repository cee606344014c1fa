//! Native histogram encoding shared by every batch format.
//!
//! Layout after the one-byte tag:
//!
//! ```text
//! schema (varint) | zero_threshold (f64) | zero_count | count | sum (f64)
//! positive spans | positive buckets | negative spans | negative buckets
//! reset_hint (u8)
//! ```
//!
//! Integer histograms store `zero_count`/`count` as uvarints and buckets as
//! zigzag deltas; float histograms store all of them as f64.

use super::wire::{put_f64, put_uvarint, put_varint, WireReader};
use crate::error::{QueueError, Result};
use crate::sample::{BucketSpan, FloatHistogram, Histogram, HistogramValue, ResetHint};
use bytes::BufMut;

const TAG_NONE: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_FLOAT: u8 = 2;

/// Smallest encoding of one span: two single-byte varints.
const MIN_SPAN_SIZE: usize = 2;

pub(crate) fn put_histogram<B: BufMut>(buf: &mut B, histogram: Option<&HistogramValue>) {
    match histogram {
        None => buf.put_u8(TAG_NONE),
        Some(HistogramValue::Int(h)) => {
            buf.put_u8(TAG_INT);
            put_varint(buf, i64::from(h.schema));
            put_f64(buf, h.zero_threshold);
            put_uvarint(buf, h.zero_count);
            put_uvarint(buf, h.count);
            put_f64(buf, h.sum);
            put_spans(buf, &h.positive_spans);
            put_uvarint(buf, h.positive_deltas.len() as u64);
            for d in &h.positive_deltas {
                put_varint(buf, *d);
            }
            put_spans(buf, &h.negative_spans);
            put_uvarint(buf, h.negative_deltas.len() as u64);
            for d in &h.negative_deltas {
                put_varint(buf, *d);
            }
            buf.put_u8(h.reset_hint as u8);
        }
        Some(HistogramValue::Float(h)) => {
            buf.put_u8(TAG_FLOAT);
            put_varint(buf, i64::from(h.schema));
            put_f64(buf, h.zero_threshold);
            put_f64(buf, h.zero_count);
            put_f64(buf, h.count);
            put_f64(buf, h.sum);
            put_spans(buf, &h.positive_spans);
            put_uvarint(buf, h.positive_counts.len() as u64);
            for c in &h.positive_counts {
                put_f64(buf, *c);
            }
            put_spans(buf, &h.negative_spans);
            put_uvarint(buf, h.negative_counts.len() as u64);
            for c in &h.negative_counts {
                put_f64(buf, *c);
            }
            buf.put_u8(h.reset_hint as u8);
        }
    }
}

fn put_spans<B: BufMut>(buf: &mut B, spans: &[BucketSpan]) {
    put_uvarint(buf, spans.len() as u64);
    for span in spans {
        put_varint(buf, i64::from(span.offset));
        put_uvarint(buf, u64::from(span.length));
    }
}

pub(crate) fn read_histogram(reader: &mut WireReader<'_>) -> Result<Option<HistogramValue>> {
    match reader.u8()? {
        TAG_NONE => Ok(None),
        TAG_INT => {
            let schema = reader.varint_i32()?;
            let zero_threshold = reader.f64()?;
            let zero_count = reader.uvarint()?;
            let count = reader.uvarint()?;
            let sum = reader.f64()?;
            let positive_spans = read_spans(reader)?;
            let positive_deltas = read_deltas(reader)?;
            let negative_spans = read_spans(reader)?;
            let negative_deltas = read_deltas(reader)?;
            let reset_hint = read_reset_hint(reader)?;
            Ok(Some(HistogramValue::Int(Histogram {
                schema,
                zero_threshold,
                zero_count,
                count,
                sum,
                positive_spans,
                positive_deltas,
                negative_spans,
                negative_deltas,
                reset_hint,
            })))
        }
        TAG_FLOAT => {
            let schema = reader.varint_i32()?;
            let zero_threshold = reader.f64()?;
            let zero_count = reader.f64()?;
            let count = reader.f64()?;
            let sum = reader.f64()?;
            let positive_spans = read_spans(reader)?;
            let positive_counts = read_counts(reader)?;
            let negative_spans = read_spans(reader)?;
            let negative_counts = read_counts(reader)?;
            let reset_hint = read_reset_hint(reader)?;
            Ok(Some(HistogramValue::Float(FloatHistogram {
                schema,
                zero_threshold,
                zero_count,
                count,
                sum,
                positive_spans,
                positive_counts,
                negative_spans,
                negative_counts,
                reset_hint,
            })))
        }
        tag => Err(QueueError::Corrupt(format!("unknown histogram tag {}", tag))),
    }
}

fn read_spans(reader: &mut WireReader<'_>) -> Result<Vec<BucketSpan>> {
    let n = reader.len_prefix(MIN_SPAN_SIZE)?;
    let mut spans = Vec::with_capacity(n);
    for _ in 0..n {
        let offset = reader.varint_i32()?;
        let length = reader.uvarint_u32()?;
        spans.push(BucketSpan { offset, length });
    }
    Ok(spans)
}

fn read_deltas(reader: &mut WireReader<'_>) -> Result<Vec<i64>> {
    let n = reader.len_prefix(1)?;
    let mut deltas = Vec::with_capacity(n);
    for _ in 0..n {
        deltas.push(reader.varint()?);
    }
    Ok(deltas)
}

fn read_counts(reader: &mut WireReader<'_>) -> Result<Vec<f64>> {
    let n = reader.len_prefix(8)?;
    let mut counts = Vec::with_capacity(n);
    for _ in 0..n {
        counts.push(reader.f64()?);
    }
    Ok(counts)
}

fn read_reset_hint(reader: &mut WireReader<'_>) -> Result<ResetHint> {
    let raw = reader.u8()?;
    ResetHint::from_u8(raw).ok_or_else(|| QueueError::Corrupt(format!("unknown reset hint {}", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_histogram() -> HistogramValue {
        HistogramValue::Int(Histogram {
            schema: 3,
            zero_threshold: 1e-128,
            zero_count: 2,
            count: 19,
            sum: 2.7,
            positive_spans: vec![BucketSpan::new(0, 4), BucketSpan::new(2, 1)],
            positive_deltas: vec![1, 1, -1, 0, 3],
            negative_spans: vec![BucketSpan::new(-2, 2)],
            negative_deltas: vec![2, -1],
            reset_hint: ResetHint::No,
        })
    }

    fn float_histogram() -> HistogramValue {
        HistogramValue::Float(FloatHistogram {
            schema: -1,
            zero_threshold: 0.001,
            zero_count: 0.5,
            count: 10.5,
            sum: -3.25,
            positive_spans: vec![BucketSpan::new(1, 2)],
            positive_counts: vec![4.0, 6.0],
            negative_spans: Vec::new(),
            negative_counts: Vec::new(),
            reset_hint: ResetHint::Gauge,
        })
    }

    #[test]
    fn test_histogram_kinds_preserved() {
        for histogram in [int_histogram(), float_histogram()] {
            let mut buf = Vec::new();
            put_histogram(&mut buf, Some(&histogram));
            let mut reader = WireReader::new(&buf);
            let decoded = read_histogram(&mut reader).unwrap();
            reader.finish().unwrap();
            assert_eq!(decoded, Some(histogram));
        }
    }

    #[test]
    fn test_no_histogram_is_single_byte() {
        let mut buf = Vec::new();
        put_histogram(&mut buf, None);
        assert_eq!(buf, vec![TAG_NONE]);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut reader = WireReader::new(&[9]);
        assert!(matches!(
            read_histogram(&mut reader),
            Err(QueueError::Corrupt(_))
        ));
    }

    #[test]
    fn test_bad_reset_hint_rejected() {
        let mut buf = Vec::new();
        put_histogram(&mut buf, Some(&float_histogram()));
        let last = buf.len() - 1;
        buf[last] = 42;
        let mut reader = WireReader::new(&buf);
        assert!(read_histogram(&mut reader).is_err());
    }
}
