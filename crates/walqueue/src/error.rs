//! Error and Result types for the write queue.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A convenience `Result` type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// The error type for serializer, codec and file queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Invalid magic bytes at the start of a committed file.
    #[error("Invalid magic bytes: expected WALQ, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported envelope version.
    #[error("Unsupported envelope version: {0}")]
    UnsupportedVersion(u16),

    /// Envelope checksum does not match the body.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// CRC32 stored in the envelope header.
        expected: u32,
        /// CRC32 computed over the body that was read.
        actual: u32,
    },

    /// The buffer is structurally invalid (truncated, trailing bytes, bad tag).
    #[error("Corrupt data: {0}")]
    Corrupt(String),

    /// A sample referenced a string table slot that does not exist.
    #[error("String index {index} out of range for table of {len} strings")]
    InvalidStringIndex {
        /// Index found in the encoded sample.
        index: u32,
        /// Number of strings in the table.
        len: usize,
    },

    /// The metadata map names a batch format this build cannot read.
    #[error("Unknown batch format: {0}")]
    UnknownFormat(String),

    /// The metadata map names a compression scheme this build cannot read.
    #[error("Unknown compression: {0}")]
    UnknownCompression(String),

    /// Error during compression.
    #[error("Compression error: {0}")]
    CompressionError(String),

    /// Error during decompression.
    #[error("Decompression error: {0}")]
    DecompressionError(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// I/O error on a specific queue file.
    #[error("I/O error on {}: {source}", path.display())]
    FileIo {
        /// File being read, written or removed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The queue has been stopped and no longer accepts writes.
    #[error("Queue is closed")]
    Closed,

    /// `start` was called on a component that is already running.
    #[error("{0} already started")]
    AlreadyStarted(&'static str),

    /// The operation was cancelled before it completed.
    #[error("Operation cancelled")]
    Cancelled,

    /// An exemplar was appended for a series with no sample in the transaction.
    #[error("Exemplar for series {0:016x} has no sample in this transaction")]
    OrphanExemplar(u64),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl QueueError {
    /// Wraps an I/O error with the path it occurred on.
    pub fn file_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::FileIo {
            path: path.into(),
            source,
        }
    }
}
