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

//! The ledger's operations, bundled over one source, store and lock.

use std::{path::Path, sync::Arc};

use alloy::primitives::U256;
use serde::{Deserialize, Serialize};

use crate::{
    config::LedgerConfig,
    errors::LedgerError,
    ledger::LedgerBuilder,
    lock::{LockManager, LockOutcome},
    source::{LogSource, RpcLogSource},
    store::{FileStore, LedgerStore, TtlCache},
    sync::{SyncConfig, SyncDriver, SyncOutcome},
    types::{
        total_voting_power, CurrentState, DelegatorMap, Metadata, SyncLock, SyncProgress,
        TimelineEntry, TruncateResult, VerifyMode,
    },
    verify::{Verifier, VerifyConfig, VerifyOutcome},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "progress", rename_all = "camelCase")]
pub enum ProgressView {
    Idle,
    Running(SyncProgress),
}

/// Outcome of a truncation request.
#[derive(Debug, Clone, PartialEq)]
pub enum TruncateOutcome {
    Completed(TruncateResult),
    AlreadyInProgress(SyncLock),
}

/// Result of replaying the stored timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildReport {
    pub entries_replayed: u64,
    pub delegators: u64,
    #[serde(with = "crate::types::u256_decimal")]
    pub total_voting_power: U256,
    /// Whether the replay equals the stored current state.
    pub matches_current_state: bool,
}

#[derive(Clone)]
pub struct LedgerService {
    config: LedgerConfig,
    source: Arc<dyn LogSource>,
    store: LedgerStore,
    locks: LockManager,
}

impl LedgerService {
    pub fn new(config: LedgerConfig, source: Arc<dyn LogSource>, store: LedgerStore) -> Self {
        let locks = LockManager::new(store.clone(), config.lock_timeout());
        Self { config, source, store, locks }
    }

    /// Service over the configured RPC endpoints and a file store under `data_dir`.
    pub fn from_config(config: LedgerConfig) -> Result<Self, LedgerError> {
        config.validate()?;
        let source =
            RpcLogSource::new(config.events_rpc_url.clone(), config.archive_rpc_url().clone());
        let store = file_store(&config, &config.data_dir);
        Ok(Self::new(config, Arc::new(source), store))
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    pub async fn start_sync(&self) -> Result<SyncOutcome, LedgerError> {
        let driver = SyncDriver::new(
            self.source.clone(),
            self.store.clone(),
            self.locks.clone(),
            SyncConfig::from_config(&self.config),
        );
        driver.run().await
    }

    /// Live progress, or idle when no run holds the lock.
    pub async fn get_progress(&self) -> Result<ProgressView, LedgerError> {
        if self.locks.current().await?.is_none() {
            return Ok(ProgressView::Idle);
        }
        Ok(self.store.sync_progress().await?.map_or(ProgressView::Idle, ProgressView::Running))
    }

    pub async fn get_current_state(&self) -> Result<CurrentState, LedgerError> {
        Ok(self.store.current_state().await?.unwrap_or_default())
    }

    pub async fn get_metadata(&self) -> Result<Metadata, LedgerError> {
        Ok(self
            .store
            .metadata()
            .await?
            .unwrap_or_else(|| Metadata::empty(self.config.delegate_address)))
    }

    pub async fn get_timeline(
        &self,
        from: Option<u64>,
        to: Option<u64>,
    ) -> Result<Vec<TimelineEntry>, LedgerError> {
        Ok(self.store.read_timeline(from, to).await?)
    }

    /// Delegators in effect at `block`, from the newest snapshot at or before it.
    pub async fn delegators_at(&self, block: u64) -> Result<DelegatorMap, LedgerError> {
        Ok(self.store.entry_at(block).await?.map(|e| e.delegators).unwrap_or_default())
    }

    /// Drop timeline entries after `max_block` and rewind the ledger to it.
    ///
    /// `lastSyncedBlock` becomes `min(lastSyncedBlock, max_block)`; a `max_block` past the synced
    /// range leaves it unchanged rather than moving the ledger forward.
    pub async fn truncate_after(&self, max_block: u64) -> Result<TruncateOutcome, LedgerError> {
        let guard = match self.locks.try_acquire().await? {
            LockOutcome::Acquired(guard) => guard,
            LockOutcome::Held(lock) => return Ok(TruncateOutcome::AlreadyInProgress(lock)),
        };
        let result = self.truncate_locked(max_block).await;
        if let Err(err) = guard.release().await {
            tracing::warn!("Failed to release sync lock after truncation: {err}");
        }
        result.map(TruncateOutcome::Completed)
    }

    async fn truncate_locked(&self, max_block: u64) -> Result<TruncateResult, LedgerError> {
        let result = self.store.truncate_timeline_after(max_block).await?;

        let snapshot = self.store.entry_at(max_block).await?;
        let as_of_timestamp = snapshot.as_ref().map_or(0, |e| e.timestamp);
        let delegators = snapshot.map(|e| e.delegators).unwrap_or_default();
        let index = self.store.timeline_index().await?;

        let mut metadata = self.get_metadata().await?;
        let last_synced_block = metadata.last_synced_block.min(max_block);
        self.store
            .put_current_state(&CurrentState {
                as_of_block: last_synced_block,
                as_of_timestamp,
                delegators: delegators.clone(),
            })
            .await?;

        metadata.last_synced_block = last_synced_block;
        metadata.total_voting_power = total_voting_power(&delegators);
        metadata.total_delegators = delegators.len() as u64;
        metadata.total_timeline_entries = index.as_ref().map_or(0, |i| i.total_entries);
        metadata.timeline_partitions = index.as_ref().map_or(0, |i| i.partitions.len() as u64);
        self.store.put_metadata(&metadata).await?;

        tracing::info!(
            "Rewound ledger to block {last_synced_block}: {} entries, {} partitions removed",
            result.entries_removed,
            result.partitions_removed
        );
        Ok(result)
    }

    pub async fn verify(
        &self,
        mode: VerifyMode,
        threshold: Option<U256>,
    ) -> Result<VerifyOutcome, LedgerError> {
        let verifier = Verifier::new(
            self.source.clone(),
            self.store.clone(),
            self.locks.clone(),
            VerifyConfig::from_config(&self.config),
        );
        verifier.verify(mode, threshold.unwrap_or(self.config.verify.threshold)).await
    }

    /// Replay the whole timeline and compare with the stored current state.
    pub async fn rebuild_current_state(&self) -> Result<RebuildReport, LedgerError> {
        let entries = self.store.read_timeline(None, None).await?;
        let rebuilt = LedgerBuilder::from_timeline(self.config.delegate_address, &entries);
        let stored = self.get_current_state().await?;
        let matches_current_state = rebuilt.delegators() == &stored.delegators;
        if !matches_current_state {
            tracing::warn!(
                "Replayed timeline ({} delegators) differs from stored current state ({} delegators)",
                rebuilt.delegators().len(),
                stored.delegators.len()
            );
        }
        Ok(RebuildReport {
            entries_replayed: entries.len() as u64,
            delegators: rebuilt.delegators().len() as u64,
            total_voting_power: rebuilt.total_voting_power(),
            matches_current_state,
        })
    }
}

/// [LedgerStore] over a [FileStore] at `dir`, using the configured store settings.
pub fn file_store(config: &LedgerConfig, dir: &Path) -> LedgerStore {
    LedgerStore::new(
        Arc::new(FileStore::new(dir)),
        TtlCache::new(config.store.cache_capacity),
        config.cache_ttl(),
        config.store.partition_size,
    )
}
