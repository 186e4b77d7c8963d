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

//! Reconciles the stored delegator set against on-chain balances and delegation targets.

use std::{sync::Arc, time::Duration};

use alloy::primitives::{Address, U256};
use chrono::Utc;
use futures_util::future::join_all;

use crate::{
    config::LedgerConfig,
    errors::LedgerError,
    lock::{LockManager, LockOutcome},
    source::{retry_with_backoff, LogSource, RetryPolicy, SourceError},
    store::LedgerStore,
    types::{
        CurrentState, DelegatorMap, Discrepancy, Metadata, SyncLock, TimelineEntry,
        VerificationResult, VerifyMode,
    },
};

#[derive(Debug, Clone, PartialEq)]
pub struct VerifyConfig {
    pub delegate: Address,
    pub token: Address,
    /// Delegators read concurrently
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub retry: RetryPolicy,
}

impl VerifyConfig {
    pub fn from_config(config: &LedgerConfig) -> Self {
        Self {
            delegate: config.delegate_address,
            token: config.token_address,
            batch_size: config.verify.batch_size,
            batch_delay: Duration::from_millis(config.verify.batch_delay_ms),
            retry: config.retry.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VerifyOutcome {
    Completed(VerificationResult),
    AlreadyInProgress(SyncLock),
}

pub struct Verifier {
    source: Arc<dyn LogSource>,
    store: LedgerStore,
    locks: LockManager,
    config: VerifyConfig,
}

impl Verifier {
    pub fn new(
        source: Arc<dyn LogSource>,
        store: LedgerStore,
        locks: LockManager,
        config: VerifyConfig,
    ) -> Self {
        Self { source, store, locks, config }
    }

    /// Compare every tracked delegator with the chain; in [VerifyMode::Fix] write corrections.
    ///
    /// Differences at or below `threshold` are ignored.
    ///
    /// Chain state is read at `CurrentState.asOfBlock`, not at the chain head, so the comparison
    /// covers the same block as the ledger and corrections never land past `lastSyncedBlock`. With
    /// no stored state the head is used.
    pub async fn verify(
        &self,
        mode: VerifyMode,
        threshold: U256,
    ) -> Result<VerifyOutcome, LedgerError> {
        let guard = match self.locks.try_acquire().await? {
            LockOutcome::Acquired(guard) => guard,
            LockOutcome::Held(lock) => return Ok(VerifyOutcome::AlreadyInProgress(lock)),
        };

        let result = self.verify_locked(mode, threshold).await;

        if let Err(err) = guard.release().await {
            tracing::warn!("Failed to release sync lock after verification: {err}");
        }
        result.map(VerifyOutcome::Completed)
    }

    async fn verify_locked(
        &self,
        mode: VerifyMode,
        threshold: U256,
    ) -> Result<VerificationResult, LedgerError> {
        let state = match self.store.current_state().await? {
            Some(state) => state,
            None => {
                let head = retry_with_backoff(&self.config.retry, "eth_blockNumber", || {
                    self.source.latest_block_number()
                })
                .await?;
                CurrentState { as_of_block: head, ..Default::default() }
            }
        };
        let block = state.as_of_block;
        tracing::info!(
            "Verifying {} delegators at block {block} ({:?} mode)",
            state.delegators.len(),
            mode
        );

        let mut result = VerificationResult {
            mode,
            block_number: block,
            verified: 0,
            failed: 0,
            discrepancies: Vec::new(),
            applied: false,
        };
        let mut corrected = state.delegators.clone();

        let addresses: Vec<Address> = state.delegators.keys().copied().collect();
        let batch_size = self.config.batch_size.max(1);
        for (i, batch) in addresses.chunks(batch_size).enumerate() {
            if i > 0 && !self.config.batch_delay.is_zero() {
                tokio::time::sleep(self.config.batch_delay).await;
            }

            let reads = join_all(batch.iter().map(|address| self.effective_balance(*address, block)))
                .await;
            for (address, read) in batch.iter().zip(reads) {
                let actual = match read {
                    Ok(actual) => actual,
                    Err(err) => {
                        tracing::warn!("Could not verify {address:#x} at block {block}: {err}");
                        result.failed += 1;
                        continue;
                    }
                };
                result.verified += 1;

                let stored = state.delegators.get(address).copied().unwrap_or_default();
                let difference = stored.abs_diff(actual);
                if difference > threshold {
                    tracing::debug!(
                        "Discrepancy for {address:#x}: stored {stored}, actual {actual}"
                    );
                    result.discrepancies.push(Discrepancy {
                        address: *address,
                        stored,
                        actual,
                        difference,
                    });
                    corrected.insert(*address, actual);
                }
            }
        }

        tracing::info!(
            "Verified {} delegators, {} failed, {} discrepancies",
            result.verified,
            result.failed,
            result.discrepancies.len()
        );

        if mode == VerifyMode::Fix && !result.discrepancies.is_empty() {
            self.apply_corrections(&state, corrected).await?;
            result.applied = true;
        }
        Ok(result)
    }

    /// On-chain balance if the address still delegates to us, zero otherwise.
    async fn effective_balance(&self, holder: Address, block: u64) -> Result<U256, SourceError> {
        let token = self.config.token;
        let retry = &self.config.retry;
        let target = retry_with_backoff(retry, "delegates", || {
            self.source.delegates(token, holder, block)
        })
        .await?;
        if target != self.config.delegate {
            return Ok(U256::ZERO);
        }
        retry_with_backoff(retry, "balanceOf", || self.source.balance_of(token, holder, block)).await
    }

    /// Overwrite balances, keeping zero-balance delegators, and record the correction.
    async fn apply_corrections(
        &self,
        state: &CurrentState,
        corrected: DelegatorMap,
    ) -> Result<(), LedgerError> {
        let entry = TimelineEntry::new(state.as_of_block, state.as_of_timestamp, corrected);
        let index = self.store.upsert_latest_entry(entry.clone()).await?;

        self.store
            .put_current_state(&CurrentState {
                as_of_block: state.as_of_block,
                as_of_timestamp: state.as_of_timestamp,
                delegators: entry.delegators.clone(),
            })
            .await?;

        let mut metadata = self
            .store
            .metadata()
            .await?
            .unwrap_or_else(|| Metadata::empty(self.config.delegate));
        metadata.last_synced_block = metadata.last_synced_block.max(state.as_of_block);
        metadata.last_sync_timestamp = Utc::now().timestamp();
        metadata.total_voting_power = entry.total_voting_power;
        metadata.total_delegators = entry.delegators.len() as u64;
        metadata.total_timeline_entries = index.total_entries;
        metadata.timeline_partitions = index.partitions.len() as u64;
        self.store.put_metadata(&metadata).await?;

        tracing::info!(
            "Applied corrections at block {}: voting power now {}",
            state.as_of_block,
            entry.total_voting_power
        );
        Ok(())
    }
}
