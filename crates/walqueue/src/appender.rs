//! Transactional ingestion adapter in front of the [`Serializer`].
//!
//! An [`Appender`] collects one scrape or push worth of samples, histograms,
//! exemplars and metadata. Nothing reaches the serializer until
//! [`Appender::commit`], which sends every sample in a single
//! [`Serializer::send_samples`] call. Sample structs come from a shared
//! [`SamplePool`] and go back to it after commit or rollback.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut app = queue.appender();
//! app.append(&labels, ts, 1.0)?;
//! app.append_exemplar(&labels, exemplar)?;
//! app.commit().await?;
//! ```

use crate::error::{QueueError, Result};
use crate::labels::Labels;
use crate::sample::{Exemplar, HistogramValue, Metadata, Sample, SamplePool};
use crate::serializer::Serializer;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Collects one transaction of samples for the serializer.
pub struct Appender {
    serializer: Serializer,
    pool: Arc<SamplePool>,
    external_labels: Arc<Labels>,
    samples: Vec<Sample>,
    /// Series hash to the index of that series' latest sample.
    by_hash: HashMap<u64, usize>,
    metadata: Vec<Metadata>,
}

impl Appender {
    /// Creates an empty transaction.
    pub fn new(serializer: Serializer, pool: Arc<SamplePool>, external_labels: Arc<Labels>) -> Self {
        Self {
            serializer,
            pool,
            external_labels,
            samples: Vec::new(),
            by_hash: HashMap::new(),
            metadata: Vec::new(),
        }
    }

    /// Number of samples in the transaction.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns true if nothing has been appended.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty() && self.metadata.is_empty()
    }

    /// Appends a scalar sample. Returns the series hash.
    pub fn append(&mut self, labels: &Labels, timestamp: i64, value: f64) -> Result<u64> {
        Ok(self.push(labels, timestamp, value, None))
    }

    /// Appends a native histogram sample. Returns the series hash.
    pub fn append_histogram(
        &mut self,
        labels: &Labels,
        timestamp: i64,
        histogram: HistogramValue,
    ) -> Result<u64> {
        Ok(self.push(labels, timestamp, 0.0, Some(histogram)))
    }

    /// Attaches `exemplar` to the latest sample appended for `labels`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::OrphanExemplar`] if no sample for this series
    /// was appended in the transaction.
    pub fn append_exemplar(&mut self, labels: &Labels, exemplar: Exemplar) -> Result<u64> {
        let hash = labels.hash();
        let idx = *self
            .by_hash
            .get(&hash)
            .ok_or(QueueError::OrphanExemplar(hash))?;
        self.samples[idx].exemplar = Some(exemplar);
        Ok(hash)
    }

    /// Queues a metadata entry for the transaction.
    pub fn update_metadata(&mut self, metadata: Metadata) {
        self.metadata.push(metadata);
    }

    /// Sends the transaction to the serializer and recycles its samples.
    ///
    /// Samples go out in one `send_samples` call, then metadata. The
    /// appender is empty afterwards and can be reused.
    pub async fn commit(&mut self) -> Result<()> {
        let result = self.send().await;
        self.recycle();
        result
    }

    /// Discards the transaction.
    pub fn rollback(&mut self) {
        debug!(
            samples = self.samples.len(),
            metadata = self.metadata.len(),
            "Rolling back appender"
        );
        self.recycle();
    }

    async fn send(&self) -> Result<()> {
        if !self.samples.is_empty() {
            self.serializer
                .send_samples(&self.samples, &self.external_labels)
                .await?;
        }
        for metadata in &self.metadata {
            self.serializer.send_metadata(metadata).await?;
        }
        Ok(())
    }

    fn push(
        &mut self,
        labels: &Labels,
        timestamp: i64,
        value: f64,
        histogram: Option<HistogramValue>,
    ) -> u64 {
        let hash = labels.hash();
        let mut sample = self.pool.get();
        sample.labels.copy_from(labels);
        sample.timestamp = timestamp;
        sample.value = value;
        sample.histogram = histogram;

        self.by_hash.insert(hash, self.samples.len());
        self.samples.push(sample);
        hash
    }

    fn recycle(&mut self) {
        self.pool.put_all(self.samples.drain(..));
        self.by_hash.clear();
        self.metadata.clear();
    }
}

impl Drop for Appender {
    fn drop(&mut self) {
        self.pool.put_all(self.samples.drain(..));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::{noop_stats, FileStorage, SerializerConfig};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CountingStorage {
        stored: Mutex<usize>,
    }

    #[async_trait]
    impl FileStorage for CountingStorage {
        async fn store(&self, _: HashMap<String, String>, _: Vec<u8>) -> Result<()> {
            *self.stored.lock() += 1;
            Ok(())
        }
    }

    fn appender() -> (Appender, Arc<SamplePool>, Arc<CountingStorage>) {
        let storage = Arc::new(CountingStorage::default());
        let serializer = Serializer::new(
            SerializerConfig::default(),
            storage.clone(),
            noop_stats(),
        )
        .unwrap();
        let pool = Arc::new(SamplePool::new(16));
        let app = Appender::new(serializer, Arc::clone(&pool), Arc::new(Labels::empty()));
        (app, pool, storage)
    }

    #[tokio::test]
    async fn test_orphan_exemplar_rejected() {
        let (mut app, _, _) = appender();
        let seen = Labels::from_pairs([("__name__", "a")]);
        let unseen = Labels::from_pairs([("__name__", "b")]);
        app.append(&seen, 1, 1.0).unwrap();

        let exemplar = Exemplar {
            labels: Labels::from_pairs([("trace_id", "x")]),
            value: 1.0,
            timestamp: None,
        };
        assert!(app.append_exemplar(&seen, exemplar.clone()).is_ok());
        assert!(matches!(
            app.append_exemplar(&unseen, exemplar),
            Err(QueueError::OrphanExemplar(_))
        ));
    }

    #[tokio::test]
    async fn test_commit_recycles_samples() {
        let (mut app, pool, storage) = appender();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64;
        for i in 0..3 {
            let labels = Labels::from_pairs([("i", i.to_string())]);
            app.append(&labels, now, 1.0).unwrap();
        }
        app.commit().await.unwrap();

        assert!(app.is_empty());
        assert_eq!(pool.idle(), 3);
        app.serializer.flush().await;
        assert_eq!(*storage.stored.lock(), 1);
        let reused = pool.get();
        assert!(reused.labels.is_empty());
        assert_eq!(reused.timestamp, 0);
    }

    #[tokio::test]
    async fn test_rollback_sends_nothing() {
        let (mut app, pool, storage) = appender();
        app.append(&Labels::from_pairs([("a", "b")]), 1, 1.0).unwrap();
        app.update_metadata(Metadata::new("a", "", "", "gauge"));
        app.rollback();
        assert!(app.is_empty());
        assert_eq!(pool.idle(), 1);

        app.serializer.flush().await;
        assert_eq!(*storage.stored.lock(), 0);
    }

    #[tokio::test]
    async fn test_drop_returns_samples() {
        let (mut app, pool, _) = appender();
        app.append(&Labels::from_pairs([("a", "b")]), 1, 1.0).unwrap();
        drop(app);
        assert_eq!(pool.idle(), 1);
    }
}
