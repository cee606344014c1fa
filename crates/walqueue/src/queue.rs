//! [`WalQueue`]: the serializer wired to a file queue in one directory.
//!
//! ```text
//! Appender ──commit──► Serializer ──flush──► FileQueue ──► mpsc::Receiver<DataHandle>
//! ```
//!
//! The receiver returned by [`WalQueue::open`] is what a network sender
//! drains: every handle it yields refers to one committed batch, recovered
//! files first.

use crate::appender::Appender;
use crate::codec::Record;
use crate::error::{QueueError, Result};
use crate::filequeue::{DataHandle, FileQueue, QueueConfig};
use crate::labels::Labels;
use crate::sample::{PoolStats, SamplePool, DEFAULT_POOL_SIZE};
use crate::serializer::{noop_stats, Serializer, SerializerConfig, StatsSink};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default capacity of the outgoing [`DataHandle`] channel.
pub const DEFAULT_HANDLE_BUFFER: usize = 16;

/// Configuration for a [`WalQueue`].
#[derive(Debug, Clone)]
pub struct WalQueueConfig {
    /// File queue settings.
    pub queue: QueueConfig,
    /// Serializer settings.
    pub serializer: SerializerConfig,
    /// Labels added to every series that does not already carry them.
    pub external_labels: Labels,
    /// Capacity of the outgoing handle channel.
    pub handle_buffer: usize,
    /// Idle samples kept for reuse by appenders.
    pub pool_size: usize,
}

impl Default for WalQueueConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            serializer: SerializerConfig::default(),
            external_labels: Labels::empty(),
            handle_buffer: DEFAULT_HANDLE_BUFFER,
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

impl WalQueueConfig {
    /// Validates the nested configurations.
    pub fn validate(&self) -> Result<()> {
        self.queue.validate()?;
        self.serializer.validate()?;
        if self.handle_buffer == 0 {
            return Err(QueueError::Config(
                "handle_buffer must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// A serializer and file queue sharing one directory.
#[derive(Debug)]
pub struct WalQueue {
    file_queue: Arc<FileQueue>,
    serializer: Serializer,
    pool: Arc<SamplePool>,
    external_labels: Arc<Labels>,
    drain_timeout: Duration,
    ttl_drops: AtomicU64,
}

impl WalQueue {
    /// Opens a queue in `directory`, discarding flush stats.
    pub fn open(
        directory: impl AsRef<Path>,
        config: WalQueueConfig,
    ) -> Result<(Self, mpsc::Receiver<DataHandle>)> {
        Self::open_with_stats(directory, config, noop_stats())
    }

    /// Opens a queue in `directory`, reporting every flush to `stats`.
    pub fn open_with_stats(
        directory: impl AsRef<Path>,
        config: WalQueueConfig,
        stats: StatsSink,
    ) -> Result<(Self, mpsc::Receiver<DataHandle>)> {
        config.validate()?;
        let drain_timeout = config.queue.drain_timeout;
        let (tx, rx) = mpsc::channel(config.handle_buffer);
        let file_queue = Arc::new(FileQueue::open(directory, Arc::new(tx), config.queue)?);
        let serializer = Serializer::new(config.serializer, file_queue.clone(), stats)?;

        info!(
            directory = %file_queue.directory().display(),
            last_id = file_queue.last_id(),
            "Opened WAL queue"
        );

        Ok((
            Self {
                file_queue,
                serializer,
                pool: Arc::new(SamplePool::new(config.pool_size)),
                external_labels: Arc::new(config.external_labels),
                drain_timeout,
                ttl_drops: AtomicU64::new(0),
            },
            rx,
        ))
    }

    /// Starts the file queue worker and the flush timer.
    pub fn start(&self, token: CancellationToken) -> Result<()> {
        self.file_queue.start(token.clone())?;
        self.serializer.start(token)
    }

    /// Flushes pending samples, then drains and stops the file queue.
    ///
    /// The final flush and the drain each wait at most
    /// [`QueueConfig::drain_timeout`]. If nobody drains the handle receiver
    /// the queue cannot make progress, and whatever is still pending when
    /// the timeout expires is dropped.
    pub async fn stop(&self) {
        if tokio::time::timeout(self.drain_timeout, self.serializer.stop())
            .await
            .is_err()
        {
            warn!(
                timeout = ?self.drain_timeout,
                "Final flush timed out, pending batch dropped"
            );
        }
        self.file_queue.stop().await;
    }

    /// Pops `handle` and decodes it, dropping series older than the
    /// serializer's current `ttl`.
    ///
    /// Dropped series are added to [`ttl_drops`](Self::ttl_drops).
    pub async fn pop_records(
        &self,
        handle: &DataHandle,
    ) -> Result<(HashMap<String, String>, Vec<Record>)> {
        let ttl = self.serializer.config().ttl;
        let (meta, records, dropped) = handle.pop_records_with_ttl(ttl).await?;
        if dropped > 0 {
            self.ttl_drops.fetch_add(dropped as u64, Ordering::Relaxed);
        }
        Ok((meta, records))
    }

    /// Series dropped on read because they outlived the ttl.
    pub fn ttl_drops(&self) -> u64 {
        self.ttl_drops.load(Ordering::Relaxed)
    }

    /// Starts a new ingestion transaction.
    pub fn appender(&self) -> Appender {
        Appender::new(
            self.serializer.clone(),
            Arc::clone(&self.pool),
            Arc::clone(&self.external_labels),
        )
    }

    /// The serializer feeding this queue.
    pub fn serializer(&self) -> &Serializer {
        &self.serializer
    }

    /// The underlying file queue.
    pub fn file_queue(&self) -> &FileQueue {
        &self.file_queue
    }

    /// Sample pool counters.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }
}
