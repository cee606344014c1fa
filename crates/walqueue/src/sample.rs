//! Samples, exemplars, metadata and native histograms.
//!
//! These are the values producers hand to the [`Serializer`](crate::Serializer).
//! [`SamplePool`] recycles [`Sample`] structs between ingestion transactions
//! so the hot path does not allocate a fresh label vector per series.

use crate::labels::Labels;
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Default number of idle samples kept by a [`SamplePool`].
pub const DEFAULT_POOL_SIZE: usize = 4096;

/// A contiguous run of populated buckets in a native histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BucketSpan {
    /// Gap to the previous span (or the starting bucket index for the first span).
    pub offset: i32,
    /// Number of consecutive buckets in this span.
    pub length: u32,
}

impl BucketSpan {
    /// Creates a bucket span.
    pub fn new(offset: i32, length: u32) -> Self {
        Self { offset, length }
    }
}

/// Counter reset hint carried by native histograms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ResetHint {
    /// Unknown whether a reset happened.
    #[default]
    Unknown = 0,
    /// A counter reset happened.
    Yes = 1,
    /// No counter reset happened.
    No = 2,
    /// The histogram is a gauge histogram.
    Gauge = 3,
}

impl ResetHint {
    /// Creates a ResetHint from a u8 value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Unknown),
            1 => Some(Self::Yes),
            2 => Some(Self::No),
            3 => Some(Self::Gauge),
            _ => None,
        }
    }
}

/// Native histogram with integer counters. Bucket values are deltas.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Histogram {
    /// Resolution schema.
    pub schema: i32,
    /// Width of the zero bucket.
    pub zero_threshold: f64,
    /// Observations in the zero bucket.
    pub zero_count: u64,
    /// Total number of observations.
    pub count: u64,
    /// Sum of observations.
    pub sum: f64,
    /// Spans of populated positive buckets.
    pub positive_spans: Vec<BucketSpan>,
    /// Delta-encoded positive bucket counts.
    pub positive_deltas: Vec<i64>,
    /// Spans of populated negative buckets.
    pub negative_spans: Vec<BucketSpan>,
    /// Delta-encoded negative bucket counts.
    pub negative_deltas: Vec<i64>,
    /// Counter reset hint.
    pub reset_hint: ResetHint,
}

/// Native histogram with float counters. Bucket values are absolute counts.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FloatHistogram {
    /// Resolution schema.
    pub schema: i32,
    /// Width of the zero bucket.
    pub zero_threshold: f64,
    /// Observations in the zero bucket.
    pub zero_count: f64,
    /// Total number of observations.
    pub count: f64,
    /// Sum of observations.
    pub sum: f64,
    /// Spans of populated positive buckets.
    pub positive_spans: Vec<BucketSpan>,
    /// Absolute positive bucket counts.
    pub positive_counts: Vec<f64>,
    /// Spans of populated negative buckets.
    pub negative_spans: Vec<BucketSpan>,
    /// Absolute negative bucket counts.
    pub negative_counts: Vec<f64>,
    /// Counter reset hint.
    pub reset_hint: ResetHint,
}

/// A counter field that is either integer or float depending on the histogram kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HistogramCount {
    /// Integer counter.
    Int(u64),
    /// Float counter.
    Float(f64),
}

impl HistogramCount {
    /// Returns true for integer counters.
    pub fn is_int(&self) -> bool {
        matches!(self, Self::Int(_))
    }

    /// Returns true for float counters.
    pub fn is_float(&self) -> bool {
        matches!(self, Self::Float(_))
    }
}

/// Either flavour of native histogram.
#[derive(Debug, Clone, PartialEq)]
pub enum HistogramValue {
    /// Integer histogram.
    Int(Histogram),
    /// Float histogram.
    Float(FloatHistogram),
}

impl HistogramValue {
    /// Total observation count with its integer/float discriminator.
    pub fn count(&self) -> HistogramCount {
        match self {
            Self::Int(h) => HistogramCount::Int(h.count),
            Self::Float(h) => HistogramCount::Float(h.count),
        }
    }

    /// Zero bucket count with its integer/float discriminator.
    pub fn zero_count(&self) -> HistogramCount {
        match self {
            Self::Int(h) => HistogramCount::Int(h.zero_count),
            Self::Float(h) => HistogramCount::Float(h.zero_count),
        }
    }

    /// Sum of observations.
    pub fn sum(&self) -> f64 {
        match self {
            Self::Int(h) => h.sum,
            Self::Float(h) => h.sum,
        }
    }
}

/// A raw sample attached to a series for trace correlation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Exemplar {
    /// Exemplar labels (typically a trace id).
    pub labels: Labels,
    /// Exemplar value.
    pub value: f64,
    /// Timestamp in milliseconds, if the exemplar carried one.
    pub timestamp: Option<i64>,
}

/// Metric family metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Metadata {
    /// Metric family name.
    pub name: String,
    /// Unit, e.g. `seconds`.
    pub unit: String,
    /// Help text.
    pub help: String,
    /// Type string, e.g. `counter` or `gauge`.
    pub metric_type: String,
}

impl Metadata {
    /// Creates a metadata entry.
    pub fn new(
        name: impl Into<String>,
        unit: impl Into<String>,
        help: impl Into<String>,
        metric_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            help: help.into(),
            metric_type: metric_type.into(),
        }
    }
}

/// One measurement for one series.
///
/// `value` is ignored when `histogram` is set.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Sample {
    /// Series labels.
    pub labels: Labels,
    /// Timestamp in milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Scalar value.
    pub value: f64,
    /// Native histogram, for histogram samples.
    pub histogram: Option<HistogramValue>,
    /// Exemplar attached within the same transaction.
    pub exemplar: Option<Exemplar>,
}

impl Sample {
    /// Creates a scalar sample.
    pub fn new(labels: Labels, timestamp: i64, value: f64) -> Self {
        Self {
            labels,
            timestamp,
            value,
            histogram: None,
            exemplar: None,
        }
    }

    /// Creates a histogram sample.
    pub fn with_histogram(labels: Labels, timestamp: i64, histogram: HistogramValue) -> Self {
        let mut sample = Self::new(labels, timestamp, 0.0);
        sample.histogram = Some(histogram);
        sample
    }

    /// Series hash, always derived from the current `labels`.
    pub fn hash(&self) -> u64 {
        self.labels.hash()
    }

    /// Returns true if this sample carries a native histogram.
    pub fn is_histogram(&self) -> bool {
        self.histogram.is_some()
    }

    /// Clears every field so the struct can be handed out again.
    pub(crate) fn reset(&mut self) {
        self.labels.clear();
        self.timestamp = 0;
        self.value = 0.0;
        self.histogram = None;
        self.exemplar = None;
    }
}

/// Counters describing pool behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Samples allocated because the pool was empty.
    pub created: usize,
    /// Samples handed out from the pool.
    pub recycled: usize,
    /// Samples discarded because the pool was full.
    pub dropped: usize,
}

#[derive(Debug, Default)]
struct PoolCounters {
    created: AtomicUsize,
    recycled: AtomicUsize,
    dropped: AtomicUsize,
}

/// Bounded free list of [`Sample`] structs.
///
/// Samples returned with [`SamplePool::put`] are fully reset before they are
/// stored, so nothing from a previous transaction is visible to the next one.
#[derive(Debug)]
pub struct SamplePool {
    recycler: Sender<Sample>,
    receiver: Receiver<Sample>,
    counters: PoolCounters,
}

impl SamplePool {
    /// Creates a pool holding at most `max_idle` unused samples.
    pub fn new(max_idle: usize) -> Self {
        let (recycler, receiver) = bounded(max_idle.max(1));
        Self {
            recycler,
            receiver,
            counters: PoolCounters::default(),
        }
    }

    /// Takes a cleared sample from the pool, allocating if none are idle.
    pub fn get(&self) -> Sample {
        match self.receiver.try_recv() {
            Ok(sample) => {
                self.counters.recycled.fetch_add(1, Ordering::Relaxed);
                sample
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                self.counters.created.fetch_add(1, Ordering::Relaxed);
                Sample::default()
            }
        }
    }

    /// Resets `sample` and returns it to the pool.
    pub fn put(&self, mut sample: Sample) {
        sample.reset();
        match self.recycler.try_send(sample) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Returns every sample in `samples` to the pool.
    pub fn put_all(&self, samples: impl IntoIterator<Item = Sample>) {
        for sample in samples {
            self.put(sample);
        }
    }

    /// Number of idle samples currently held.
    pub fn idle(&self) -> usize {
        self.receiver.len()
    }

    /// Returns a snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.counters.created.load(Ordering::Relaxed),
            recycled: self.counters.recycled.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for SamplePool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE)
    }
}
