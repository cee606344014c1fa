//! Batching serializer: accumulates samples and flushes them to storage.
//!
//! Samples and metadata are added to the active [`Marshaller`] under one
//! async mutex. A flush encodes the batch, compresses it with zstd, tags the
//! metadata map with format and compression, and hands it to a
//! [`FileStorage`] (normally the [`FileQueue`]).
//!
//! # Flush triggers
//!
//! - **Size**: after each insert, if `series + metadata > max_signals_in_batch`.
//! - **Time**: a background timer ticking every `check_interval` flushes when
//!   the batch is non-empty and the last flush is older than `flush_interval`.
//!
//! Flushing happens inside the same critical section as inserts, so its
//! latency is seen by concurrent producers as insert latency.
//!
//! Delivery is best effort: a batch whose store fails is logged, counted in
//! [`SerializerStats::errors`] and dropped.

use crate::codec::{self, Compression, FileFormat, Marshaller, META_COMPRESSION, META_VERSION};
use crate::error::{QueueError, Result};
use crate::filequeue::FileQueue;
use crate::labels::Labels;
use crate::sample::{Metadata, Sample};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// Default number of signals (series plus metadata) per batch.
pub const DEFAULT_MAX_SIGNALS_IN_BATCH: usize = 10_000;

/// Default maximum age of a non-empty batch.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Default sample age beyond which samples are dropped on arrival.
pub const DEFAULT_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// Default period of the flush timer.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Destination of flushed batches.
#[async_trait]
pub trait FileStorage: Send + Sync {
    /// Stores one compressed batch with its metadata.
    async fn store(&self, meta: HashMap<String, String>, data: Vec<u8>) -> Result<()>;
}

#[async_trait]
impl FileStorage for FileQueue {
    async fn store(&self, meta: HashMap<String, String>, data: Vec<u8>) -> Result<()> {
        FileQueue::store(self, meta, data).await
    }
}

/// Serializer configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SerializerConfig {
    /// Flush once series plus metadata in the batch exceed this.
    pub max_signals_in_batch: usize,
    /// Flush a non-empty batch older than this.
    pub flush_interval: Duration,
    /// Drop samples older than `now - ttl`. Zero disables the check.
    pub ttl: Duration,
    /// Period of the flush timer.
    pub check_interval: Duration,
    /// Batch format, fixed for the serializer's lifetime.
    pub format: FileFormat,
    /// zstd compression level.
    pub compression_level: i32,
}

impl Default for SerializerConfig {
    fn default() -> Self {
        Self {
            max_signals_in_batch: DEFAULT_MAX_SIGNALS_IN_BATCH,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            ttl: DEFAULT_TTL,
            check_interval: DEFAULT_CHECK_INTERVAL,
            format: FileFormat::default(),
            compression_level: codec::DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

impl SerializerConfig {
    /// Checks the configuration for values the serializer cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_signals_in_batch == 0 {
            return Err(QueueError::Config(
                "max_signals_in_batch must be greater than 0".to_string(),
            ));
        }
        if self.flush_interval.is_zero() {
            return Err(QueueError::Config(
                "flush_interval must be greater than 0".to_string(),
            ));
        }
        if self.check_interval.is_zero() {
            return Err(QueueError::Config(
                "check_interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Counters reported once per flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SerializerStats {
    /// Series in the flushed batch.
    pub series_stored: usize,
    /// Metadata entries in the flushed batch.
    pub metadata_stored: usize,
    /// Exemplars in the flushed batch.
    pub exemplars_stored: usize,
    /// 1 if the batch could not be encoded or stored, else 0.
    pub errors: usize,
    /// Newest sample timestamp in the batch, in seconds.
    pub newest_timestamp_seconds: i64,
    /// Encoded size before compression.
    pub uncompressed_bytes: usize,
    /// Size handed to storage.
    pub compressed_bytes: usize,
}

/// Callback receiving [`SerializerStats`] after every flush.
pub type StatsSink = Arc<dyn Fn(SerializerStats) + Send + Sync>;

/// Returns a stats sink that discards everything.
pub fn noop_stats() -> StatsSink {
    Arc::new(|_: SerializerStats| {})
}

/// The in-progress batch. Only touched with the batch lock held.
struct Batch {
    marshaller: Box<dyn Marshaller>,
    series_count: usize,
    meta_count: usize,
    exemplar_count: usize,
    newest_ts: i64,
    last_flush: Instant,
}

impl Batch {
    fn signals(&self) -> usize {
        self.series_count + self.meta_count
    }

    fn reset(&mut self) {
        self.series_count = 0;
        self.meta_count = 0;
        self.exemplar_count = 0;
        self.newest_ts = 0;
        self.last_flush = Instant::now();
    }
}

struct Inner {
    batch: Mutex<Batch>,
    config: RwLock<SerializerConfig>,
    storage: Arc<dyn FileStorage>,
    stats: StatsSink,
    /// Graceful stop: rejects new sends, ends the timer.
    shutdown: CancellationToken,
    /// Hard stop passed to `start`: abandons an in-flight store.
    abort: parking_lot::Mutex<CancellationToken>,
    timer: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Batching serializer. Cheap to clone; clones share one batch.
#[derive(Clone)]
pub struct Serializer {
    inner: Arc<Inner>,
}

impl fmt::Debug for Serializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Serializer")
            .field("config", &*self.inner.config.read())
            .finish()
    }
}

impl Serializer {
    /// Creates a serializer writing to `storage` and reporting to `stats`.
    pub fn new(
        config: SerializerConfig,
        storage: Arc<dyn FileStorage>,
        stats: StatsSink,
    ) -> Result<Self> {
        config.validate()?;
        let batch = Batch {
            marshaller: codec::new_marshaller(config.format),
            series_count: 0,
            meta_count: 0,
            exemplar_count: 0,
            newest_ts: 0,
            last_flush: Instant::now(),
        };
        Ok(Self {
            inner: Arc::new(Inner {
                batch: Mutex::new(batch),
                config: RwLock::new(config),
                storage,
                stats,
                shutdown: CancellationToken::new(),
                abort: parking_lot::Mutex::new(CancellationToken::new()),
                timer: parking_lot::Mutex::new(None),
            }),
        })
    }

    /// Returns a copy of the active configuration.
    pub fn config(&self) -> SerializerConfig {
        self.inner.config.read().clone()
    }

    /// Spawns the flush timer.
    ///
    /// Cancelling `token` stops the timer promptly without a final flush and
    /// abandons a store in progress; use [`stop`](Self::stop) for a graceful
    /// shutdown.
    pub fn start(&self, token: CancellationToken) -> Result<()> {
        let mut timer = self.inner.timer.lock();
        if timer.is_some() {
            return Err(QueueError::AlreadyStarted("serializer"));
        }
        *self.inner.abort.lock() = token.clone();
        let inner = Arc::clone(&self.inner);
        *timer = Some(tokio::spawn(async move { inner.run_flush_timer(token).await }));
        Ok(())
    }

    /// Adds samples to the batch, flushing whenever the batch grows past
    /// `max_signals_in_batch`. One call may flush several times.
    ///
    /// Samples older than `now - ttl` are dropped silently.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] after [`stop`](Self::stop). Storage
    /// failures during a flush are logged and reported through the stats
    /// sink, not returned.
    pub async fn send_samples(&self, samples: &[Sample], external_labels: &Labels) -> Result<()> {
        self.inner.ensure_open()?;
        let (max_signals, ttl) = {
            let config = self.inner.config.read();
            (config.max_signals_in_batch, config.ttl)
        };
        let oldest_allowed = oldest_allowed(ttl);

        let mut batch = self.inner.batch.lock().await;
        let keeps_exemplars = batch.marshaller.format() == FileFormat::V2;
        let mut expired = 0usize;
        for sample in samples {
            if sample.timestamp < oldest_allowed {
                expired += 1;
                continue;
            }
            batch.marshaller.add_sample(sample, external_labels);
            batch.series_count += 1;
            if keeps_exemplars && sample.exemplar.is_some() {
                batch.exemplar_count += 1;
            }
            batch.newest_ts = batch.newest_ts.max(sample.timestamp);

            if batch.signals() > max_signals {
                self.inner.flush_locked(&mut batch).await;
            }
        }

        if expired > 0 {
            debug!(expired, ttl = ?ttl, "Dropped samples older than ttl");
        }
        Ok(())
    }

    /// Adds one metadata entry to the batch. Never triggers a flush.
    pub async fn send_metadata(&self, metadata: &Metadata) -> Result<()> {
        self.inner.ensure_open()?;
        let mut batch = self.inner.batch.lock().await;
        batch.marshaller.add_metadata(metadata);
        if batch.marshaller.format() == FileFormat::V2 {
            batch.meta_count += 1;
        } else {
            trace!(name = %metadata.name, "Metadata ignored by format v1");
        }
        Ok(())
    }

    /// Swaps in new thresholds. Takes effect on the next insert or tick.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Config`] if `config` is invalid or changes the
    /// batch format.
    pub fn update_config(&self, config: SerializerConfig) -> Result<()> {
        config.validate()?;
        let mut current = self.inner.config.write();
        if config.format != current.format {
            return Err(QueueError::Config(format!(
                "batch format cannot change from {} to {}",
                current.format, config.format
            )));
        }
        if config.check_interval != current.check_interval {
            warn!("check_interval change applies after restart");
        }
        *current = config;
        Ok(())
    }

    /// Flushes the current batch now, if it has anything in it.
    pub async fn flush(&self) {
        let mut batch = self.inner.batch.lock().await;
        if batch.signals() > 0 {
            self.inner.flush_locked(&mut batch).await;
        }
    }

    /// Stops the timer and flushes whatever is pending.
    ///
    /// A flush already storing a batch is allowed to finish. Further sends
    /// fail with [`QueueError::Closed`].
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        let timer = self.inner.timer.lock().take();
        if let Some(timer) = timer {
            if let Err(e) = timer.await {
                error!(error = %e, "Flush timer failed");
            }
        }
        self.flush().await;
    }
}

impl Inner {
    fn ensure_open(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    /// Background flush timer. Ensures data is not held indefinitely during
    /// low traffic.
    async fn run_flush_timer(&self, token: CancellationToken) {
        let check_interval = self.config.read().check_interval;
        let mut interval = tokio::time::interval(check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!("Flush timer cancelled");
                    break;
                }
                _ = self.shutdown.cancelled() => {
                    debug!("Flush timer shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let flush_interval = self.config.read().flush_interval;
                    let mut batch = self.batch.lock().await;
                    if batch.signals() > 0 && batch.last_flush.elapsed() > flush_interval {
                        self.flush_locked(&mut batch).await;
                    }
                }
            }
        }
    }

    /// Encodes, compresses and stores the batch, then reports stats and
    /// resets the counters whether or not the store succeeded.
    async fn flush_locked(&self, batch: &mut Batch) {
        let mut stats = SerializerStats {
            series_stored: batch.series_count,
            metadata_stored: batch.meta_count,
            exemplars_stored: batch.exemplar_count,
            newest_timestamp_seconds: batch.newest_ts / 1000,
            ..Default::default()
        };

        match self.encode_and_store(batch).await {
            Ok((uncompressed, compressed)) => {
                stats.uncompressed_bytes = uncompressed;
                stats.compressed_bytes = compressed;
                debug!(
                    "Flushed {} series and {} metadata ({} bytes compressed)",
                    stats.series_stored, stats.metadata_stored, compressed
                );
            }
            Err(e) => {
                stats.errors = 1;
                error!(
                    series = stats.series_stored,
                    metadata = stats.metadata_stored,
                    error = %e,
                    "Failed to store batch, dropping it"
                );
            }
        }

        batch.reset();
        (self.stats)(stats);
    }

    async fn encode_and_store(&self, batch: &mut Batch) -> Result<(usize, usize)> {
        let (mut meta, raw) = batch.marshaller.marshal()?;
        let level = self.config.read().compression_level;
        let compressed = codec::compress(&raw, Compression::Zstd, level)?;
        let sizes = (raw.len(), compressed.len());

        meta.insert(
            META_VERSION.to_string(),
            batch.marshaller.format().as_str().to_string(),
        );
        meta.insert(
            META_COMPRESSION.to_string(),
            Compression::Zstd.as_str().to_string(),
        );

        let abort = self.abort.lock().clone();
        tokio::select! {
            biased;
            _ = abort.cancelled() => Err(QueueError::Cancelled),
            result = self.storage.store(meta, compressed) => result.map(|()| sizes),
        }
    }
}

/// Oldest timestamp still inside `ttl`. A zero ttl keeps everything.
pub(crate) fn oldest_allowed(ttl: Duration) -> i64 {
    if ttl.is_zero() {
        i64::MIN
    } else {
        now_millis().saturating_sub(ttl.as_millis() as i64)
    }
}

/// Wall clock in milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MemoryStorage {
        batches: parking_lot::Mutex<Vec<(HashMap<String, String>, Vec<u8>)>>,
    }

    #[async_trait]
    impl FileStorage for MemoryStorage {
        async fn store(&self, meta: HashMap<String, String>, data: Vec<u8>) -> Result<()> {
            self.batches.lock().push((meta, data));
            Ok(())
        }
    }

    struct FailingStorage;

    /// Holds every store for a while before accepting it.
    struct SlowStorage {
        delay: Duration,
        stored: parking_lot::Mutex<usize>,
    }

    #[async_trait]
    impl FileStorage for SlowStorage {
        async fn store(&self, _: HashMap<String, String>, _: Vec<u8>) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            *self.stored.lock() += 1;
            Ok(())
        }
    }

    #[async_trait]
    impl FileStorage for FailingStorage {
        async fn store(&self, _: HashMap<String, String>, _: Vec<u8>) -> Result<()> {
            Err(QueueError::Closed)
        }
    }

    fn recording_stats() -> (StatsSink, Arc<parking_lot::Mutex<Vec<SerializerStats>>>) {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::<SerializerStats>::new()));
        let sink_seen = Arc::clone(&seen);
        let sink: StatsSink = Arc::new(move |s: SerializerStats| sink_seen.lock().push(s));
        (sink, seen)
    }

    fn samples(n: usize) -> Vec<Sample> {
        let now = now_millis();
        (0..n)
            .map(|i| {
                Sample::new(
                    Labels::from_pairs([("__name__", "test"), ("i", &*i.to_string())]),
                    now,
                    i as f64,
                )
            })
            .collect()
    }

    #[test]
    fn test_config_validation() {
        assert!(SerializerConfig::default().validate().is_ok());
        let config = SerializerConfig {
            max_signals_in_batch: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_size_flush_splits_batches() {
        let storage = Arc::new(MemoryStorage {
            batches: parking_lot::Mutex::new(Vec::new()),
        });
        let (stats, seen) = recording_stats();
        let config = SerializerConfig {
            max_signals_in_batch: 3,
            ..Default::default()
        };
        let serializer = Serializer::new(config, storage.clone(), stats).unwrap();

        serializer
            .send_samples(&samples(9), &Labels::empty())
            .await
            .unwrap();

        // flushes after the 4th and 8th sample
        let seen = seen.lock().clone();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|s| s.series_stored == 4 && s.errors == 0));

        let batches = storage.batches.lock();
        assert_eq!(batches[0].0[META_VERSION], "walqueue.v2");
        assert_eq!(batches[0].0[META_COMPRESSION], "zstd");
        let records = codec::decode_batch(&batches[0].0, &batches[0].1).unwrap();
        assert_eq!(records.len(), 4);
    }

    #[tokio::test]
    async fn test_store_failure_resets_counters() {
        let (stats, seen) = recording_stats();
        let serializer =
            Serializer::new(SerializerConfig::default(), Arc::new(FailingStorage), stats).unwrap();

        serializer
            .send_samples(&samples(2), &Labels::empty())
            .await
            .unwrap();
        serializer.flush().await;
        serializer.flush().await;

        let seen = seen.lock().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].errors, 1);
        assert_eq!(seen[0].series_stored, 2);
    }

    #[tokio::test]
    async fn test_metadata_does_not_trigger_flush() {
        let (stats, seen) = recording_stats();
        let config = SerializerConfig {
            max_signals_in_batch: 1,
            ..Default::default()
        };
        let serializer = Serializer::new(config, Arc::new(FailingStorage), stats).unwrap();
        for _ in 0..5 {
            serializer
                .send_metadata(&Metadata::new("up", "", "", "gauge"))
                .await
                .unwrap();
        }
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_update_config_rejects_format_change() {
        let serializer = Serializer::new(
            SerializerConfig::default(),
            Arc::new(FailingStorage),
            noop_stats(),
        )
        .unwrap();
        let config = SerializerConfig {
            format: FileFormat::V1,
            ..Default::default()
        };
        assert!(matches!(
            serializer.update_config(config),
            Err(QueueError::Config(_))
        ));

        let config = SerializerConfig {
            max_signals_in_batch: 5,
            ..Default::default()
        };
        serializer.update_config(config).unwrap();
        assert_eq!(serializer.config().max_signals_in_batch, 5);
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_store() {
        let storage = Arc::new(SlowStorage {
            delay: Duration::from_millis(200),
            stored: parking_lot::Mutex::new(0),
        });
        let (stats, seen) = recording_stats();
        let config = SerializerConfig {
            max_signals_in_batch: 1,
            ..Default::default()
        };
        let serializer = Serializer::new(config, storage.clone(), stats).unwrap();
        serializer.start(CancellationToken::new()).unwrap();

        let sender = serializer.clone();
        let send = tokio::spawn(async move {
            sender.send_samples(&samples(2), &Labels::empty()).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        serializer.stop().await;
        send.await.unwrap().unwrap();

        let seen = seen.lock().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].series_stored, 2);
        assert_eq!(seen[0].errors, 0);
        assert_eq!(*storage.stored.lock(), 1);
    }

    #[tokio::test]
    async fn test_start_token_abandons_in_flight_store() {
        let storage = Arc::new(SlowStorage {
            delay: Duration::from_secs(3600),
            stored: parking_lot::Mutex::new(0),
        });
        let (stats, seen) = recording_stats();
        let config = SerializerConfig {
            max_signals_in_batch: 1,
            ..Default::default()
        };
        let serializer = Serializer::new(config, storage.clone(), stats).unwrap();
        let token = CancellationToken::new();
        serializer.start(token.clone()).unwrap();

        let sender = serializer.clone();
        let send = tokio::spawn(async move {
            sender.send_samples(&samples(2), &Labels::empty()).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        send.await.unwrap().unwrap();

        let seen = seen.lock().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].errors, 1);
        assert_eq!(*storage.stored.lock(), 0);
    }

    #[tokio::test]
    async fn test_send_after_stop_is_closed() {
        let serializer = Serializer::new(
            SerializerConfig::default(),
            Arc::new(FailingStorage),
            noop_stats(),
        )
        .unwrap();
        serializer.start(CancellationToken::new()).unwrap();
        serializer.stop().await;
        assert!(matches!(
            serializer.send_samples(&samples(1), &Labels::empty()).await,
            Err(QueueError::Closed)
        ));
    }
}
