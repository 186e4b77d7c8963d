// Copyright 2026 Boundless Foundation, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Durable key-value storage for the ledger.
//!
//! The backing store is a plain byte map with no transactions. [LedgerStore] layers typed JSON
//! records, a read cache, and the partitioned timeline on top of it.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

mod cache;
mod file;
mod memory;
mod timeline;

pub use cache::TtlCache;
pub use file::FileStore;
pub use memory::MemoryStore;

use crate::types::{CurrentState, Metadata, SyncLock, SyncProgress, TimelineIndex};

pub const METADATA_KEY: &str = "metadata";
pub const CURRENT_STATE_KEY: &str = "current-state";
pub const TIMELINE_INDEX_KEY: &str = "timeline-index";
pub const SYNC_LOCK_KEY: &str = "sync-lock";
pub const SYNC_PROGRESS_KEY: &str = "sync-progress";
pub const TIMELINE_PARTITION_PREFIX: &str = "timeline-entries-";

pub fn partition_key(id: u64) -> String {
    format!("{TIMELINE_PARTITION_PREFIX}{id}")
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error for {key}: {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid store key: {0}")]
    InvalidKey(String),

    #[error("Timeline index references missing partition {0}")]
    MissingPartition(u64),

    #[error("Timeline entry for block {block} precedes stored block {last}")]
    OutOfOrder { block: u64, last: u64 },
}

/// Byte storage addressed by string keys.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Keys starting with `prefix`, sorted.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Typed access to the ledger records.
#[derive(Clone)]
pub struct LedgerStore {
    inner: Arc<dyn KeyValueStore>,
    cache: TtlCache,
    cache_ttl: Duration,
    partition_size: u64,
    /// Bumped after every write or delete reaches the backing store.
    writes: Arc<AtomicU64>,
}

impl LedgerStore {
    pub fn new(
        inner: Arc<dyn KeyValueStore>,
        cache: TtlCache,
        cache_ttl: Duration,
        partition_size: u64,
    ) -> Self {
        Self {
            inner,
            cache,
            cache_ttl,
            partition_size: partition_size.max(1),
            writes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Store over a [MemoryStore] with default cache settings.
    pub fn in_memory(partition_size: u64) -> Self {
        Self::new(
            Arc::new(MemoryStore::default()),
            TtlCache::new(1024),
            Duration::from_secs(30),
            partition_size,
        )
    }

    pub fn partition_size(&self) -> u64 {
        self.partition_size
    }

    /// Read through the cache.
    async fn get_raw(&self, key: &str) -> Result<Option<Arc<Vec<u8>>>, StoreError> {
        if let Some(hit) = self.cache.get(key).await {
            return Ok(Some(hit));
        }
        let seen = self.writes.load(Ordering::SeqCst);
        let Some(bytes) = self.inner.get(key).await? else {
            return Ok(None);
        };
        let bytes = Arc::new(bytes);
        self.cache.set(key, bytes.clone(), self.cache_ttl).await;
        // A write that finished during the read may have invalidated before our insert.
        if self.writes.load(Ordering::SeqCst) != seen {
            self.cache.invalidate(key).await;
        }
        Ok(Some(bytes))
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        let Some(bytes) = self.get_raw(key).await? else {
            return Ok(None);
        };
        decode(key, &bytes).map(Some)
    }

    /// Read straight from the backing store. Other processes write these keys too.
    async fn get_json_uncached<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        match self.inner.get(key).await? {
            Some(bytes) => decode(key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    pub(crate) async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|source| StoreError::Serialization { key: key.to_string(), source })?;
        let result = self.inner.put(key, &bytes).await;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.cache.invalidate(key).await;
        result
    }

    pub(crate) async fn delete_key(&self, key: &str) -> Result<(), StoreError> {
        let result = self.inner.delete(key).await;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.cache.invalidate(key).await;
        result
    }

    /// Keys under `prefix` in the backing store.
    pub(crate) async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.inner.list_keys(prefix).await
    }

    pub async fn metadata(&self) -> Result<Option<Metadata>, StoreError> {
        self.get_json(METADATA_KEY).await
    }

    pub async fn put_metadata(&self, metadata: &Metadata) -> Result<(), StoreError> {
        self.put_json(METADATA_KEY, metadata).await
    }

    pub async fn current_state(&self) -> Result<Option<CurrentState>, StoreError> {
        self.get_json(CURRENT_STATE_KEY).await
    }

    pub async fn put_current_state(&self, state: &CurrentState) -> Result<(), StoreError> {
        self.put_json(CURRENT_STATE_KEY, state).await
    }

    pub async fn timeline_index(&self) -> Result<Option<TimelineIndex>, StoreError> {
        self.get_json(TIMELINE_INDEX_KEY).await
    }

    pub async fn sync_lock(&self) -> Result<Option<SyncLock>, StoreError> {
        self.get_json_uncached(SYNC_LOCK_KEY).await
    }

    pub async fn put_sync_lock(&self, lock: &SyncLock) -> Result<(), StoreError> {
        self.put_json(SYNC_LOCK_KEY, lock).await
    }

    pub async fn delete_sync_lock(&self) -> Result<(), StoreError> {
        self.delete_key(SYNC_LOCK_KEY).await
    }

    pub async fn sync_progress(&self) -> Result<Option<SyncProgress>, StoreError> {
        self.get_json(SYNC_PROGRESS_KEY).await
    }

    pub async fn put_sync_progress(&self, progress: &SyncProgress) -> Result<(), StoreError> {
        self.put_json(SYNC_PROGRESS_KEY, progress).await
    }

    pub async fn delete_sync_progress(&self) -> Result<(), StoreError> {
        self.delete_key(SYNC_PROGRESS_KEY).await
    }
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes)
        .map_err(|source| StoreError::Serialization { key: key.to_string(), source })
}
