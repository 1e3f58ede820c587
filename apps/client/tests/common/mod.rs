//! Common test utilities for client integration tests.
//!
//! This module provides shared test infrastructure including:
//! - TestContext wiring an in-memory store, a pinned clock and a fake remote
//! - Helpers for building queues and progress services on top of it

pub mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};

use vocab_client::db::{KeyValueStore, MemoryKvStore};
use vocab_client::sync::{MemoryRemoteStore, RemoteStore};
use vocab_client::{
    PersistentStore, ProgressConfig, ProgressService, StoreConfig, SyncQueue, SyncQueueConfig,
};
use vocab_core::clock::FixedClock;

/// Test context sharing one local store, clock and remote between the
/// components under test.
pub struct TestContext {
    pub kv: Arc<MemoryKvStore>,
    pub clock: Arc<FixedClock>,
    pub store: PersistentStore,
    pub remote: Arc<MemoryRemoteStore>,
}

impl TestContext {
    /// Fresh context at 2024-05-01 09:00 UTC with writes landing immediately.
    pub fn new() -> Self {
        let kv = Arc::new(MemoryKvStore::new());
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
        ));
        let store = PersistentStore::new(
            kv.clone(),
            clock.clone(),
            StoreConfig {
                debounce: Duration::ZERO,
                ..StoreConfig::default()
            },
        );
        Self {
            kv,
            clock,
            store,
            remote: Arc::new(MemoryRemoteStore::new()),
        }
    }

    /// Queue persisting into this context's store and writing to its remote.
    pub fn queue(&self, config: SyncQueueConfig, online: bool) -> SyncQueue {
        let remote: Arc<dyn RemoteStore> = self.remote.clone();
        SyncQueue::new(
            config,
            self.clock.clone(),
            Some(self.store.clone()),
            Some(remote),
            online,
        )
    }

    /// Queue like [`queue`](Self::queue) but writing to `remote`.
    pub fn queue_with_remote(
        &self,
        config: SyncQueueConfig,
        remote: Arc<dyn RemoteStore>,
        online: bool,
    ) -> SyncQueue {
        SyncQueue::new(
            config,
            self.clock.clone(),
            Some(self.store.clone()),
            Some(remote),
            online,
        )
    }

    /// Whether anything is stored under `key` in the backing store.
    pub fn kv_has(&self, key: &str) -> bool {
        self.kv.get(key).unwrap().is_some()
    }

    pub fn progress(&self, queue: Option<SyncQueue>) -> ProgressService {
        ProgressService::open(
            self.store.clone(),
            queue,
            self.clock.clone(),
            ProgressConfig::default(),
        )
    }
}
