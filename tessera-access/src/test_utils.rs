// SPDX-License-Identifier: MIT OR Apache-2.0

#![allow(unused)]
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tessera_core::{Hash, PrivateKey};
use tessera_store::BlockStore;
use tessera_store::memory::{MemoryBlockStore, MemoryLogStore};
use tokio::sync::Notify;

use crate::registry::{Registry, RegistryBuilder};

/// Short deadline for nested opens in tests.
pub const TEST_OPEN_TIMEOUT: Duration = Duration::from_millis(200);

pub fn setup_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

/// Block store which holds back answers for selected blocks, like a peer which is not online.
#[derive(Clone, Debug, Default)]
pub struct StallingBlockStore<B> {
    inner: B,
    stalled: Arc<RwLock<HashSet<Hash>>>,
    released: Arc<Notify>,
}

impl<B> StallingBlockStore<B>
where
    B: BlockStore,
{
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            stalled: Arc::default(),
            released: Arc::default(),
        }
    }

    /// Let every `get` of this block hang until it is released.
    pub fn stall(&self, hash: Hash) {
        self.stalled
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(hash);
    }

    /// Answer all pending and future requests for this block.
    pub fn release(&self, hash: &Hash) {
        self.stalled
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(hash);
        self.released.notify_waiters();
    }

    fn is_stalled(&self, hash: &Hash) -> bool {
        self.stalled
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(hash)
    }
}

impl<B> BlockStore for StallingBlockStore<B>
where
    B: BlockStore,
{
    type Error = B::Error;

    async fn put(&self, bytes: Vec<u8>) -> Result<Hash, Self::Error> {
        self.inner.put(bytes).await
    }

    async fn get(&self, hash: &Hash) -> Result<Option<Vec<u8>>, Self::Error> {
        loop {
            let released = self.released.notified();
            if !self.is_stalled(hash) {
                break;
            }
            released.await;
        }
        self.inner.get(hash).await
    }
}

pub type TestRegistry = Registry<MemoryLogStore, MemoryBlockStore>;

/// Stores shared by all simulated peers, standing in for a replicating network.
#[derive(Clone, Debug, Default)]
pub struct TestNetwork {
    pub log_store: MemoryLogStore,
    pub blocks: MemoryBlockStore,
}

impl TestNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry of a new process with a fresh device identity.
    pub fn peer(&self) -> TestRegistry {
        self.peer_with_key(PrivateKey::new())
    }

    /// Registry of a process with the given device identity, for example after a restart.
    pub fn peer_with_key(&self, private_key: PrivateKey) -> TestRegistry {
        RegistryBuilder::new()
            .private_key(private_key)
            .open_timeout(TEST_OPEN_TIMEOUT)
            .recheck_interval(Some(Duration::from_millis(50)))
            .build(self.log_store.clone(), self.blocks.clone())
    }
}

/// Poll a condition until it holds, failing the test after a second.
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = tokio::time::timeout(Duration::from_secs(1), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "condition did not hold in time");
}
