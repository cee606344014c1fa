//! Walqueue - Alopex durable write queue for time series samples
//!
//! This crate buffers samples on disk between ingestion and remote delivery,
//! so network outages and process restarts do not lose or reorder data.
//!
//! # Components
//!
//! - [`Serializer`]: batches samples and metadata, flushing on size or age
//! - [`codec`]: interned binary batch formats (`walqueue.v1`, `walqueue.v2`)
//! - [`FileQueue`]: durable FIFO of `<id>.committed` files, replayed on start
//! - [`Appender`]: transactional ingestion front end with sample pooling
//! - [`WalQueue`]: all of the above wired together over one directory
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_walqueue::{Labels, WalQueue, WalQueueConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let (queue, mut handles) = WalQueue::open("/var/lib/walqueue", WalQueueConfig::default())?;
//! queue.start(CancellationToken::new())?;
//!
//! let mut app = queue.appender();
//! app.append(&Labels::from_pairs([("__name__", "up")]), now_ms, 1.0)?;
//! app.commit().await?;
//!
//! // Sender side
//! while let Some(handle) = handles.recv().await {
//!     let (meta, records) = handle.pop_records().await?;
//!     // ship records upstream
//! }
//! ```

#![deny(missing_docs)]

pub mod appender;
pub mod codec;
pub mod error;
pub mod filequeue;
pub mod labels;
pub mod queue;
pub mod sample;
pub mod serializer;

pub use appender::Appender;
pub use codec::{FileFormat, Marshaller, Record};
pub use error::{QueueError, Result};
pub use filequeue::{DataHandle, DataHandleSink, FileQueue, QueueConfig, SyncMode};
pub use labels::{Label, Labels};
pub use queue::{WalQueue, WalQueueConfig};
pub use sample::{Exemplar, HistogramValue, Metadata, Sample, SamplePool};
pub use serializer::{FileStorage, Serializer, SerializerConfig, SerializerStats};
