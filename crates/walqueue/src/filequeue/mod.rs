//! Durable FIFO queue of committed batch files.
//!
//! Each stored batch becomes one file named `<id>.committed` in the queue
//! directory. IDs increase strictly for the lifetime of the directory and are
//! recovered on open by scanning existing names, so they are never reused
//! across restarts.
//!
//! # Architecture
//!
//! ```text
//! store() ──► mailbox (bounded mpsc) ──► worker task ──► <id>.committed
//!                                            │
//!                                            └──► sink.send(DataHandle)
//! ```
//!
//! A single worker task owns all disk writes, so write order equals enqueue
//! order equals ID order without any file locking. On start the worker first
//! hands the sink a [`DataHandle`] for every file found at open, oldest first,
//! and only then begins draining the mailbox.
//!
//! A [`DataHandle`] holds no data. [`DataHandle::pop`] reads the file and
//! deletes it whether or not the read and decode succeed.
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_walqueue::filequeue::{FileQueue, QueueConfig};
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//! use tokio_util::sync::CancellationToken;
//!
//! let (tx, mut rx) = mpsc::channel(16);
//! let queue = FileQueue::open("/var/lib/walqueue", Arc::new(tx), QueueConfig::default())?;
//! queue.start(CancellationToken::new())?;
//!
//! queue.store(meta, data).await?;
//! let handle = rx.recv().await.unwrap();
//! let (meta, data) = handle.pop().await?;
//! ```

pub mod envelope;

use crate::codec::{self, Record};
use crate::error::{QueueError, Result};
use crate::serializer::oldest_allowed;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default mailbox capacity. One pending write keeps backpressure tight.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 1;

/// Default time `stop` waits for accepted writes to reach disk.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Metadata key added by [`DataHandle::pop`] with the popped file's id.
pub const META_FILE_ID: &str = "file_id";

/// Committed file suffix.
const COMMITTED_SUFFIX: &str = ".committed";

/// Suffix of files still being written.
const TMP_SUFFIX: &str = ".tmp";

/// Sync mode for committed files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// `fsync` each file before it is renamed into place (default).
    #[default]
    Fsync,
    /// `fdatasync` each file, skipping the metadata update.
    Fdatasync,
    /// No sync. Files may be lost on power failure.
    None,
}

impl SyncMode {
    /// Name accepted by [`SyncMode::from_str`].
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fsync => "fsync",
            Self::Fdatasync => "fdatasync",
            Self::None => "none",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fsync" => Ok(Self::Fsync),
            "fdatasync" => Ok(Self::Fdatasync),
            "none" => Ok(Self::None),
            other => Err(QueueError::Config(format!("unknown sync mode: {}", other))),
        }
    }
}

/// Configuration for a [`FileQueue`].
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Number of store requests the mailbox holds before `store` blocks.
    pub mailbox_capacity: usize,
    /// Durability of each committed file.
    pub sync_mode: SyncMode,
    /// How long `stop` waits for accepted writes before abandoning them.
    pub drain_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            sync_mode: SyncMode::default(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

impl QueueConfig {
    /// Checks the configuration for values the queue cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.mailbox_capacity == 0 {
            return Err(QueueError::Config(
                "mailbox_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Receives a [`DataHandle`] for every committed or recovered file.
#[async_trait]
pub trait DataHandleSink: Send + Sync {
    /// Delivers one handle. May block to apply backpressure.
    async fn send(&self, handle: DataHandle) -> Result<()>;
}

#[async_trait]
impl DataHandleSink for mpsc::Sender<DataHandle> {
    async fn send(&self, handle: DataHandle) -> Result<()> {
        mpsc::Sender::send(self, handle)
            .await
            .map_err(|_| QueueError::Closed)
    }
}

/// Lazy reference to one committed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataHandle {
    name: String,
    id: u64,
    path: PathBuf,
}

impl DataHandle {
    fn new(directory: &Path, id: u64) -> Self {
        Self::with_name(directory, id, committed_name(id))
    }

    /// Handle for a file found on disk, keeping its exact name.
    fn with_name(directory: &Path, id: u64, name: String) -> Self {
        let path = directory.join(&name);
        Self { name, id, path }
    }

    /// File name, `<id>.committed` as found on disk.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue id of the file.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Full path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the file, deletes it and returns its metadata and data.
    ///
    /// The file is removed even when the read or decode fails; a corrupt
    /// file cannot be retried. The returned metadata gains a
    /// [`META_FILE_ID`] entry. Popping the same handle twice fails the second
    /// time because the file is gone.
    pub async fn pop(&self) -> Result<(HashMap<String, String>, Vec<u8>)> {
        let read = tokio::fs::read(&self.path).await;

        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    id = self.id,
                    path = %self.path.display(),
                    error = %e,
                    "Failed to delete popped file"
                );
            }
        }

        let buf = read.map_err(|e| {
            warn!(
                id = self.id,
                path = %self.path.display(),
                error = %e,
                "Failed to read committed file"
            );
            QueueError::file_io(&self.path, e)
        })?;

        let (mut meta, data) = envelope::decode(&buf).map_err(|e| {
            error!(
                id = self.id,
                path = %self.path.display(),
                error = %e,
                "Corrupt committed file dropped"
            );
            e
        })?;
        meta.insert(META_FILE_ID.to_string(), self.id.to_string());
        Ok((meta, data))
    }

    /// Pops the file and decodes the batch it holds.
    pub async fn pop_records(&self) -> Result<(HashMap<String, String>, Vec<Record>)> {
        let (meta, data) = self.pop().await?;
        let records = codec::decode_batch(&meta, &data)?;
        Ok((meta, records))
    }

    /// Pops and decodes the batch, dropping series older than `now - ttl`.
    ///
    /// Returns the surviving records and the number of series dropped. A
    /// zero `ttl` keeps everything. Metadata records are never dropped.
    pub async fn pop_records_with_ttl(
        &self,
        ttl: Duration,
    ) -> Result<(HashMap<String, String>, Vec<Record>, usize)> {
        let (meta, mut records) = self.pop_records().await?;
        let oldest_allowed = oldest_allowed(ttl);
        let before = records.len();
        records.retain(|record| match record {
            Record::Series(series) => series.timestamp >= oldest_allowed,
            Record::Metadata(_) => true,
        });
        let dropped = before - records.len();
        if dropped > 0 {
            debug!(id = self.id, dropped, ttl = ?ttl, "Dropped expired series on read");
        }
        Ok((meta, records, dropped))
    }
}

/// A pending write waiting in the mailbox.
struct StoreRequest {
    meta: HashMap<String, String>,
    data: Vec<u8>,
}

/// Durable FIFO queue of committed files.
pub struct FileQueue {
    directory: PathBuf,
    config: QueueConfig,
    sink: Arc<dyn DataHandleSink>,
    /// Files found at open, in id order. Taken by `start`.
    recovered: Mutex<Option<Vec<(u64, String)>>>,
    /// Mailbox sender. `None` once stopped.
    tx: Mutex<Option<mpsc::Sender<StoreRequest>>>,
    /// Mailbox receiver. Taken by `start`.
    rx: Mutex<Option<mpsc::Receiver<StoreRequest>>>,
    last_id: Arc<AtomicU64>,
    worker: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
}

impl fmt::Debug for FileQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileQueue")
            .field("directory", &self.directory)
            .field("config", &self.config)
            .field("last_id", &self.last_id.load(Ordering::Acquire))
            .finish()
    }
}

impl FileQueue {
    /// Opens (creating if needed) a queue directory.
    ///
    /// Existing `<id>.committed` files are remembered for replay on
    /// [`start`](Self::start); the next id is the largest existing id plus
    /// one. Any other file in the directory is ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the
    /// configuration is invalid.
    pub fn open(
        directory: impl AsRef<Path>,
        sink: Arc<dyn DataHandleSink>,
        config: QueueConfig,
    ) -> Result<Self> {
        config.validate()?;
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory).map_err(|e| QueueError::file_io(&directory, e))?;

        let recovered = scan_committed(&directory);
        let max_id = recovered.last().map(|(id, _)| *id).unwrap_or(0);
        if !recovered.is_empty() {
            info!(
                directory = %directory.display(),
                files = recovered.len(),
                max_id,
                "Recovered committed files"
            );
        }

        let (tx, rx) = mpsc::channel(config.mailbox_capacity);
        Ok(Self {
            directory,
            config,
            sink,
            recovered: Mutex::new(Some(recovered)),
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            last_id: Arc::new(AtomicU64::new(max_id)),
            worker: Mutex::new(None),
        })
    }

    /// Queue directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Highest id assigned so far (or recovered at open).
    pub fn last_id(&self) -> u64 {
        self.last_id.load(Ordering::Acquire)
    }

    /// Spawns the worker task.
    ///
    /// The worker replays recovered files to the sink, oldest first, before
    /// processing any stored batch. Cancelling `token` stops it promptly;
    /// requests still in the mailbox are then lost.
    pub fn start(&self, token: CancellationToken) -> Result<()> {
        let rx = self
            .rx
            .lock()
            .take()
            .ok_or(QueueError::AlreadyStarted("file queue"))?;
        let recovered = self.recovered.lock().take().unwrap_or_default();

        let token = token.child_token();
        let worker = Worker {
            directory: self.directory.clone(),
            sync_mode: self.config.sync_mode,
            sink: Arc::clone(&self.sink),
            last_id: Arc::clone(&self.last_id),
        };
        let handle = tokio::spawn(worker.run(recovered, rx, token.clone()));
        *self.worker.lock() = Some((handle, token));
        Ok(())
    }

    /// Queues `data` with its `meta` for writing.
    ///
    /// Returning `Ok` means the request was accepted by the mailbox, **not**
    /// that it is on disk. The batch is durable once its [`DataHandle`]
    /// reaches the sink. Blocks while the mailbox is full; wrap the call in a
    /// timeout or `select!` to bound the wait.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] after [`stop`](Self::stop) or once the
    /// worker has exited.
    pub async fn store(&self, meta: HashMap<String, String>, data: Vec<u8>) -> Result<()> {
        let tx = self.tx.lock().clone().ok_or(QueueError::Closed)?;
        tx.send(StoreRequest { meta, data })
            .await
            .map_err(|_| QueueError::Closed)
    }

    /// Stops accepting writes and drains the mailbox.
    ///
    /// Requests accepted before the call are written, waiting at most
    /// [`QueueConfig::drain_timeout`]; after that the worker is cancelled and
    /// whatever is left is dropped.
    pub async fn stop(&self) {
        self.tx.lock().take();
        let worker = self.worker.lock().take();
        let Some((handle, token)) = worker else {
            return;
        };

        match tokio::time::timeout(self.config.drain_timeout, handle).await {
            Ok(Ok(())) => debug!(directory = %self.directory.display(), "File queue drained"),
            Ok(Err(e)) => error!(error = %e, "File queue worker failed"),
            Err(_) => {
                warn!(
                    directory = %self.directory.display(),
                    timeout = ?self.config.drain_timeout,
                    "File queue drain timed out, abandoning pending writes"
                );
                token.cancel();
            }
        }
    }
}

/// The single writer: owns id assignment and every disk write.
struct Worker {
    directory: PathBuf,
    sync_mode: SyncMode,
    sink: Arc<dyn DataHandleSink>,
    last_id: Arc<AtomicU64>,
}

impl Worker {
    async fn run(
        self,
        recovered: Vec<(u64, String)>,
        mut rx: mpsc::Receiver<StoreRequest>,
        token: CancellationToken,
    ) {
        for (id, name) in recovered {
            let handle = DataHandle::with_name(&self.directory, id, name);
            if !self.deliver(handle, &token).await {
                return;
            }
        }

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(directory = %self.directory.display(), "File queue worker cancelled");
                    return;
                }
                request = rx.recv() => {
                    let Some(request) = request else {
                        debug!(directory = %self.directory.display(), "File queue mailbox closed");
                        return;
                    };
                    if let Some(handle) = self.commit(request).await {
                        if !self.deliver(handle, &token).await {
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Writes one request to the next id. Failures are logged and the batch
    /// is dropped; the id is consumed either way.
    async fn commit(&self, request: StoreRequest) -> Option<DataHandle> {
        let id = self.last_id.fetch_add(1, Ordering::AcqRel) + 1;
        let handle = DataHandle::new(&self.directory, id);
        let tmp = self
            .directory
            .join(format!("{}{}", handle.name, TMP_SUFFIX));
        let buf = envelope::encode(&request.meta, &request.data);

        match write_committed(&tmp, &handle.path, &buf, self.sync_mode).await {
            Ok(()) => {
                debug!(id, bytes = buf.len(), "Committed file written");
                Some(handle)
            }
            Err(e) => {
                error!(
                    id,
                    path = %handle.path.display(),
                    error = %e,
                    "Failed to write committed file, batch dropped"
                );
                let _ = tokio::fs::remove_file(&tmp).await;
                None
            }
        }
    }

    /// Hands `handle` to the sink. Returns false if the worker was cancelled.
    async fn deliver(&self, handle: DataHandle, token: &CancellationToken) -> bool {
        let id = handle.id;
        tokio::select! {
            biased;
            _ = token.cancelled() => false,
            result = self.sink.send(handle) => {
                if let Err(e) = result {
                    warn!(id, error = %e, "Sink rejected data handle, file left for replay");
                }
                true
            }
        }
    }
}

/// Writes `buf` to `tmp`, syncs per `sync_mode` and renames it to `path`.
async fn write_committed(tmp: &Path, path: &Path, buf: &[u8], sync_mode: SyncMode) -> Result<()> {
    let mut file = tokio::fs::File::create(tmp)
        .await
        .map_err(|e| QueueError::file_io(tmp, e))?;
    file.write_all(buf)
        .await
        .map_err(|e| QueueError::file_io(tmp, e))?;
    file.flush().await.map_err(|e| QueueError::file_io(tmp, e))?;

    let synced = match sync_mode {
        SyncMode::Fsync => file.sync_all().await,
        SyncMode::Fdatasync => file.sync_data().await,
        SyncMode::None => Ok(()),
    };
    synced.map_err(|e| QueueError::file_io(tmp, e))?;
    drop(file);

    tokio::fs::rename(tmp, path)
        .await
        .map_err(|e| QueueError::file_io(path, e))
}

fn committed_name(id: u64) -> String {
    format!("{}{}", id, COMMITTED_SUFFIX)
}

/// Parses `<digits>.committed`. Anything else is not a queue file.
pub(crate) fn parse_committed_id(name: &str) -> Option<u64> {
    let digits = name.strip_suffix(COMMITTED_SUFFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Lists committed files as `(id, file name)` in ascending id order.
///
/// Names are kept verbatim so zero-padded files (`007.committed`) can be
/// popped; equal ids are ordered by name.
fn scan_committed(directory: &Path) -> Vec<(u64, String)> {
    let mut ids = Vec::new();
    let entries = match fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(directory = %directory.display(), error = %e, "Failed to scan queue directory");
            return ids;
        }
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        match parse_committed_id(name) {
            Some(id) => ids.push((id, name.to_string())),
            None if name.ends_with(TMP_SUFFIX) => {
                warn!(file = name, "Ignoring incomplete queue file");
            }
            None => debug!(file = name, "Ignoring unrelated file in queue directory"),
        }
    }

    ids.sort_unstable();
    ids
}
