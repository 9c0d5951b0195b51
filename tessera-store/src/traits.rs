// SPDX-License-Identifier: MIT OR Apache-2.0

use std::error::Error;
use std::sync::Arc;

use tessera_core::{Entry, Hash};
use tokio::sync::broadcast;

/// Admission hook of a log.
///
/// Invoked for every candidate entry before it becomes part of the log. Implementations must not
/// block and must answer from local state only.
pub trait AppendGuard: Send + Sync {
    fn can_append(&self, entry: &Entry) -> bool;
}

/// Guard accepting every entry.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl AppendGuard for AllowAll {
    fn can_append(&self, _entry: &Entry) -> bool {
        true
    }
}

/// Notification emitted by a log after it accepted an entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogEvent {
    Appended {
        log_id: Hash,
        hash: Hash,
        /// Number of entries in the log after this append.
        height: usize,
    },
}

/// Content-addressed store of immutable byte blobs.
pub trait BlockStore: Clone + Send + Sync + 'static {
    type Error: Error + Send + Sync + 'static;

    /// Store a block, returning its BLAKE3 hash.
    fn put(&self, bytes: Vec<u8>) -> impl Future<Output = Result<Hash, Self::Error>> + Send;

    /// Get a block by its hash.
    ///
    /// Returns `None` if the block is not (yet) known to this store.
    fn get(&self, hash: &Hash)
    -> impl Future<Output = Result<Option<Vec<u8>>, Self::Error>> + Send;
}

/// Engine opening replicated, append-only logs.
pub trait LogStore: Clone + Send + Sync + 'static {
    type Log: Log;

    type Error: Error + Send + Sync + 'static;

    /// Open or create the log with the given id.
    ///
    /// The guard decides over every entry appended through the returned handle.
    fn open(
        &self,
        log_id: &Hash,
        guard: Arc<dyn AppendGuard>,
    ) -> impl Future<Output = Result<Self::Log, Self::Error>> + Send;
}

/// Handle onto one replicated, append-only log.
pub trait Log: Clone + Send + Sync + 'static {
    type Error: Error + Send + Sync + 'static;

    fn id(&self) -> Hash;

    /// Append a locally authored or remotely received entry.
    ///
    /// Returns `false` if the guard of this handle rejected the entry. Entries which are already
    /// part of the log are accepted without being appended again.
    fn append(&self, entry: Entry) -> impl Future<Output = Result<bool, Self::Error>> + Send;

    /// All current entries in the order the log delivered them.
    fn entries(&self) -> Vec<Entry>;

    /// Number of current entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to events of this log.
    fn subscribe(&self) -> broadcast::Receiver<LogEvent>;

    /// Close this handle, further appends through it fail.
    fn close(&self);
}
