// Abstract chunked KV store with two tables
//
//   Assets(name, time) → bundle bytes     asset bundles, split into chunk rows
//   Grid(index)        → serialized cell  cells, split into chunk rows
//
// Backends implement `ChunkStore`; callers go through `PersistentStore`, which
// owns the throughput discipline: a `Throttled` rejection is retried forever
// with ~1 s sleeps and never surfaced, and every successful put is followed by
// a ~3 s pause to pace provisioned write capacity. The pacing is part of the
// store contract, not an optimization.
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

/// Rows returned by a key scan, plus the continuation token callers must
/// chase until it is exhausted.
#[derive(Debug, Default)]
pub struct ScanPage {
    pub names: Vec<String>,
    pub next: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Assets,
    Grid,
}

/// One chunk row. For the Assets table `time` is the range key; Grid rows
/// ignore it.
#[derive(Debug, Clone)]
pub struct Row {
    pub key: String,
    pub time: u64,
    pub value: Vec<u8>,
}

/// Guard for a cell save. Destructive edits pass the version they read so a
/// concurrent writer surfaces as `VersionMismatch` instead of a lost update.
#[derive(Debug, Clone, Copy)]
pub enum SaveGuard {
    Unconditional,
    IfVersion(u64),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("provisioned throughput exceeded")]
    Throttled,
    #[error("cell changed underneath the writer")]
    VersionMismatch,
    #[error("store backend: {0}")]
    Backend(String),
    #[error("data corruption: {0}")]
    Corruption(&'static str),
}

pub trait ChunkStore: Send + Sync {
    /// Idempotent upsert of one chunk row.
    fn put_chunk(&self, table: Table, row: Row) -> Result<(), StoreError>;

    /// Rows with exactly this hash key, ascending by range key, optionally
    /// restricted to `time > newer_than`.
    fn query_chunks(
        &self,
        table: Table,
        key: &str,
        newer_than: Option<u64>,
    ) -> Result<Vec<Row>, StoreError>;

    /// Paginated key-only scan.
    fn scan_keys(&self, table: Table, start: Option<String>) -> Result<ScanPage, StoreError>;

    /// Idempotent delete of every row under a hash key.
    fn delete_key(&self, table: Table, key: &str) -> Result<(), StoreError>;

    /// Atomically replace a cell's chunk rows (`{prefix}_0 … {prefix}_n`,
    /// stale higher-index rows removed). Returns the new cell version.
    fn save_cell(
        &self,
        prefix: &str,
        chunks: Vec<String>,
        guard: SaveGuard,
    ) -> Result<u64, StoreError>;

    /// Reassemble a cell's chunk rows in order until a gap; returns the
    /// joined text and the current version.
    fn load_cell(&self, prefix: &str) -> Result<Option<(String, u64)>, StoreError>;
}

/// The throughput-governed store front. Cheap to clone; shared across request
/// handlers and the sweeper.
#[derive(Clone)]
pub struct PersistentStore {
    inner: Arc<dyn ChunkStore>,
    pace: Duration,
    retry: Duration,
}

impl PersistentStore {
    pub fn new(inner: Arc<dyn ChunkStore>) -> Self {
        PersistentStore {
            inner,
            pace: Duration::from_secs(3),
            retry: Duration::from_secs(1),
        }
    }

    /// Zero-delay variant for tests and local tooling.
    pub fn with_timing(inner: Arc<dyn ChunkStore>, pace: Duration, retry: Duration) -> Self {
        PersistentStore { inner, pace, retry }
    }

    pub async fn put_chunk(&self, table: Table, row: Row) -> Result<(), StoreError> {
        loop {
            match self.inner.put_chunk(table, row.clone()) {
                Err(StoreError::Throttled) => sleep(self.retry).await,
                Err(e) => return Err(e),
                Ok(()) => {
                    sleep(self.pace).await;
                    return Ok(());
                }
            }
        }
    }

    pub async fn query_chunks(
        &self,
        table: Table,
        key: &str,
        newer_than: Option<u64>,
    ) -> Result<Vec<Row>, StoreError> {
        loop {
            match self.inner.query_chunks(table, key, newer_than) {
                Err(StoreError::Throttled) => sleep(self.retry).await,
                other => return other,
            }
        }
    }

    pub async fn scan_keys(
        &self,
        table: Table,
        start: Option<String>,
    ) -> Result<ScanPage, StoreError> {
        loop {
            match self.inner.scan_keys(table, start.clone()) {
                Err(StoreError::Throttled) => sleep(self.retry).await,
                other => return other,
            }
        }
    }

    pub async fn delete_key(&self, table: Table, key: &str) -> Result<(), StoreError> {
        loop {
            match self.inner.delete_key(table, key) {
                Err(StoreError::Throttled) => sleep(self.retry).await,
                other => return other,
            }
        }
    }

    /// Save a cell, retrying throttles. `VersionMismatch` is NOT retried here;
    /// the destructive-edit loop re-reads and reapplies instead.
    pub async fn save_cell(
        &self,
        prefix: &str,
        chunks: Vec<String>,
        guard: SaveGuard,
    ) -> Result<u64, StoreError> {
        loop {
            match self.inner.save_cell(prefix, chunks.clone(), guard) {
                Err(StoreError::Throttled) => sleep(self.retry).await,
                Ok(version) => {
                    sleep(self.pace).await;
                    return Ok(version);
                }
                other => return other,
            }
        }
    }

    pub async fn load_cell(&self, prefix: &str) -> Result<Option<(String, u64)>, StoreError> {
        loop {
            match self.inner.load_cell(prefix) {
                Err(StoreError::Throttled) => sleep(self.retry).await,
                other => return other,
            }
        }
    }
}

/// Split serialized-cell text into chunk rows of at most
/// `CELL_CHUNK_CHARS` characters, splitting on char boundaries.
pub fn chunk_cell_text(text: &str) -> Vec<String> {
    let limit = crate::config::CELL_CHUNK_CHARS;
    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let mut at = rest.len().min(limit);
        while !rest.is_char_boundary(at) {
            at -= 1;
        }
        let (head, tail) = rest.split_at(at);
        chunks.push(head.to_string());
        rest = tail;
    }
    if chunks.is_empty() {
        chunks.push(String::new());
    }
    chunks
}
