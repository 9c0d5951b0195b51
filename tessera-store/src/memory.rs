// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory block store and log engine.
//!
//! This does not persist data permanently, all data is lost when the last clone of a store is
//! dropped. Use this only in development or test contexts.
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tessera_core::{Entry, Hash};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::trace;

use crate::traits::{AppendGuard, BlockStore, Log, LogEvent, LogStore};

/// Capacity of the event channel of every log.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Debug, Default)]
pub struct MemoryBlockStore {
    blocks: Arc<RwLock<HashMap<Hash, Vec<u8>>>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blocks.
    pub fn len(&self) -> usize {
        self.blocks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlockStore for MemoryBlockStore {
    type Error = Infallible;

    async fn put(&self, bytes: Vec<u8>) -> Result<Hash, Self::Error> {
        let hash = Hash::new(&bytes);
        let mut blocks = self.blocks.write().unwrap_or_else(PoisonError::into_inner);
        blocks.entry(hash).or_insert(bytes);
        Ok(hash)
    }

    async fn get(&self, hash: &Hash) -> Result<Option<Vec<u8>>, Self::Error> {
        let blocks = self.blocks.read().unwrap_or_else(PoisonError::into_inner);
        Ok(blocks.get(hash).cloned())
    }
}

/// Log engine keeping all logs in memory.
///
/// Handles opened on the same log id share the same entries, every handle carries its own guard.
#[derive(Clone, Debug, Default)]
pub struct MemoryLogStore {
    logs: Arc<RwLock<HashMap<Hash, Arc<LogData>>>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if a log with this id was ever opened.
    pub fn contains(&self, log_id: &Hash) -> bool {
        self.logs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(log_id)
    }
}

impl LogStore for MemoryLogStore {
    type Log = MemoryLog;

    type Error = Infallible;

    async fn open(
        &self,
        log_id: &Hash,
        guard: Arc<dyn AppendGuard>,
    ) -> Result<Self::Log, Self::Error> {
        let data = {
            let mut logs = self.logs.write().unwrap_or_else(PoisonError::into_inner);
            logs.entry(*log_id)
                .or_insert_with(|| Arc::new(LogData::new(*log_id)))
                .clone()
        };

        Ok(MemoryLog {
            data,
            guard,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}

struct LogData {
    log_id: Hash,
    inner: RwLock<LogInner>,
    events: broadcast::Sender<LogEvent>,
}

#[derive(Default)]
struct LogInner {
    entries: Vec<Entry>,
    hashes: HashSet<Hash>,
}

impl LogData {
    fn new(log_id: Hash) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            log_id,
            inner: RwLock::new(LogInner::default()),
            events,
        }
    }
}

impl fmt::Debug for LogData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogData")
            .field("log_id", &self.log_id)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct MemoryLog {
    data: Arc<LogData>,
    guard: Arc<dyn AppendGuard>,
    closed: Arc<AtomicBool>,
}

impl fmt::Debug for MemoryLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryLog")
            .field("log_id", &self.data.log_id)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Log for MemoryLog {
    type Error = MemoryLogError;

    fn id(&self) -> Hash {
        self.data.log_id
    }

    async fn append(&self, entry: Entry) -> Result<bool, Self::Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MemoryLogError::Closed(self.data.log_id));
        }

        if entry.log_id != self.data.log_id {
            return Err(MemoryLogError::WrongLog(entry.log_id, self.data.log_id));
        }

        let hash = entry.hash();

        // The guard runs before the entries are locked, guards may read the log they protect.
        if !self.guard.can_append(&entry) {
            trace!(log_id = %self.data.log_id, %hash, "guard rejected entry");
            return Ok(false);
        }

        let height = {
            let mut inner = self.data.inner.write().unwrap_or_else(PoisonError::into_inner);
            if !inner.hashes.insert(hash) {
                return Ok(true);
            }
            inner.entries.push(entry);
            inner.entries.len()
        };

        trace!(log_id = %self.data.log_id, %hash, height, "appended entry");

        // Nobody listening is fine.
        let _ = self.data.events.send(LogEvent::Appended {
            log_id: self.data.log_id,
            hash,
            height,
        });

        Ok(true)
    }

    fn entries(&self) -> Vec<Entry> {
        self.data
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .clone()
    }

    fn len(&self) -> usize {
        self.data
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.data.events.subscribe()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[derive(Debug, Error)]
pub enum MemoryLogError {
    #[error("log {0} handle is closed")]
    Closed(Hash),

    #[error("entry belongs to log {0}, not {1}")]
    WrongLog(Hash, Hash),
}
