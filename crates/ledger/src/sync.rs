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

//! Checkpointed sync: scans the token's logs in chunks, folds them into the ledger and persists
//! the result every checkpoint interval.

use std::{
    collections::BTreeSet,
    sync::Arc,
    time::{Duration, Instant},
};

use alloy::{
    primitives::{Address, B256},
    rpc::types::Log,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    classify::{classify, ChunkLogs},
    config::{EndBlock, LedgerConfig},
    contracts::{DELEGATE_CHANGED_SIGNATURE, DELEGATE_VOTES_CHANGED_SIGNATURE, TRANSFER_SIGNATURE},
    errors::LedgerError,
    ledger::LedgerBuilder,
    lock::{LockManager, LockOutcome, SyncLockGuard},
    source::{retry_with_backoff, BlockTimestamps, LogQuery, LogSource, RetryPolicy, SourceError},
    store::LedgerStore,
    types::{CurrentState, DelegatorMap, Metadata, SyncLock, SyncProgress, TimelineEntry},
};

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub delegate: Address,
    pub token: Address,
    pub chunk_size: u64,
    pub checkpoint_interval: u64,
    /// First block on a cold start
    pub start_block: u64,
    pub end_block: EndBlock,
    pub chunk_delay: Duration,
    pub transfer_address_batch: usize,
    pub retry: RetryPolicy,
}

impl SyncConfig {
    pub fn from_config(config: &LedgerConfig) -> Self {
        Self {
            delegate: config.delegate_address,
            token: config.token_address,
            chunk_size: config.sync.chunk_size,
            checkpoint_interval: config.sync.checkpoint_interval,
            start_block: config.start_block,
            end_block: config.end_block,
            chunk_delay: config.chunk_delay(),
            transfer_address_batch: config.sync.transfer_address_batch,
            retry: config.retry.clone(),
        }
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub from_block: u64,
    pub to_block: u64,
    pub chunks: u64,
    pub events_processed: u64,
    pub timeline_entries_written: u64,
    pub checkpoints: u64,
    /// Chunks skipped because their logs could not be fetched.
    pub failed_chunks: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Another run holds the lock.
    AlreadyInProgress(SyncLock),
    /// Nothing between the last synced block and the target.
    UpToDate { last_synced_block: u64 },
}

/// Where a run picks up.
struct ResumePoint {
    from_block: u64,
    delegators: DelegatorMap,
    /// Timestamp of the base state, reused if the final block's cannot be fetched.
    timestamp: u64,
}

/// Live counters of one run.
struct RunState {
    report: SyncReport,
    started: Instant,
    started_at: DateTime<Utc>,
    last_renewal: Instant,
    pending: Vec<TimelineEntry>,
    timestamps: BlockTimestamps,
    last_timestamp: u64,
}

pub struct SyncDriver {
    source: Arc<dyn LogSource>,
    store: LedgerStore,
    locks: LockManager,
    config: SyncConfig,
}

impl SyncDriver {
    pub fn new(
        source: Arc<dyn LogSource>,
        store: LedgerStore,
        locks: LockManager,
        config: SyncConfig,
    ) -> Self {
        Self { source, store, locks, config }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// One sync run. The lock and progress records are cleared on every exit path.
    pub async fn run(&self) -> Result<SyncOutcome, LedgerError> {
        let mut guard = match self.locks.try_acquire().await? {
            LockOutcome::Acquired(guard) => guard,
            LockOutcome::Held(lock) => {
                tracing::info!(
                    "Sync already in progress (pid {}, started {})",
                    lock.pid,
                    lock.started_at
                );
                return Ok(SyncOutcome::AlreadyInProgress(lock));
            }
        };

        let result = self.run_locked(&mut guard).await;

        if let Err(err) = self.store.delete_sync_progress().await {
            tracing::warn!("Failed to clear sync progress: {err}");
        }
        if let Err(err) = guard.release().await {
            tracing::warn!("Failed to release sync lock: {err}");
        }

        match &result {
            Ok(SyncOutcome::Completed(report)) => tracing::info!(
                "Sync completed [{}, {}]: {} events, {} timeline entries, {} failed chunks",
                report.from_block,
                report.to_block,
                report.events_processed,
                report.timeline_entries_written,
                report.failed_chunks
            ),
            Ok(_) => {}
            Err(err) => tracing::error!("Sync failed: {err}"),
        }
        result
    }

    async fn run_locked(&self, guard: &mut SyncLockGuard) -> Result<SyncOutcome, LedgerError> {
        let metadata = self.store.metadata().await?;
        if let Some(metadata) = &metadata {
            if metadata.delegate_address != self.config.delegate {
                return Err(LedgerError::Config(format!(
                    "store tracks delegate {:#x}, configured delegate is {:#x}",
                    metadata.delegate_address, self.config.delegate
                )));
            }
        }

        let head = retry_with_backoff(&self.config.retry, "eth_blockNumber", || {
            self.source.latest_block_number()
        })
        .await?;
        let to_block = self.config.end_block.resolve(head);

        let resume = self.resume_point(metadata.as_ref()).await?;
        if resume.from_block > to_block {
            let last_synced_block = metadata.map_or(0, |m| m.last_synced_block);
            tracing::info!("Ledger is up to date at block {last_synced_block} (target {to_block})");
            return Ok(SyncOutcome::UpToDate { last_synced_block });
        }

        tracing::info!(
            "Syncing delegate {:#x} over blocks [{}, {}]",
            self.config.delegate,
            resume.from_block,
            to_block
        );

        let mut ledger = LedgerBuilder::with_state(self.config.delegate, resume.delegators);
        let mut run = RunState {
            report: SyncReport {
                from_block: resume.from_block,
                to_block,
                ..Default::default()
            },
            started: Instant::now(),
            started_at: Utc::now(),
            last_renewal: Instant::now(),
            pending: Vec::new(),
            timestamps: BlockTimestamps::default(),
            last_timestamp: resume.timestamp,
        };
        self.write_progress(&run, resume.from_block.saturating_sub(1)).await?;

        let chunk_size = self.config.chunk_size.max(1);
        let checkpoint_interval = self.config.checkpoint_interval.max(chunk_size);
        let mut checkpoint_start = resume.from_block;
        let mut chunk_start = resume.from_block;

        loop {
            let chunk_end = chunk_start.saturating_add(chunk_size - 1).min(to_block);

            match self.process_chunk(&mut ledger, &mut run, chunk_start, chunk_end).await {
                Ok(events) => run.report.events_processed += events,
                Err(err) => {
                    tracing::warn!("Skipping chunk [{chunk_start}, {chunk_end}]: {err}");
                    run.report.failed_chunks += 1;
                }
            }
            run.report.chunks += 1;

            let final_chunk = chunk_end >= to_block;
            if final_chunk || chunk_end - checkpoint_start + 1 >= checkpoint_interval {
                self.checkpoint(&ledger, &mut run, guard, chunk_end).await?;
                checkpoint_start = chunk_end + 1;
            } else {
                self.heartbeat(&mut run, guard).await?;
            }

            self.write_progress(&run, chunk_end).await?;

            if final_chunk {
                break;
            }
            chunk_start = chunk_end + 1;
            if !self.config.chunk_delay.is_zero() {
                tokio::time::sleep(self.config.chunk_delay).await;
            }
        }

        if ledger.violations() > 0 {
            tracing::warn!(
                "{} consistency violations skipped during sync; run verify to reconcile",
                ledger.violations()
            );
        }
        Ok(SyncOutcome::Completed(run.report))
    }

    /// Load the base state and drop any timeline written past it by an interrupted run.
    async fn resume_point(&self, metadata: Option<&Metadata>) -> Result<ResumePoint, LedgerError> {
        let Some(metadata) = metadata else {
            let cutoff = self.config.start_block.saturating_sub(1);
            let removed = self.store.truncate_timeline_after(cutoff).await?;
            if removed.entries_removed > 0 {
                tracing::warn!(
                    "Removed {} timeline entries left without metadata",
                    removed.entries_removed
                );
            }
            return Ok(ResumePoint {
                from_block: self.config.start_block,
                delegators: DelegatorMap::new(),
                timestamp: 0,
            });
        };

        let last = metadata.last_synced_block;
        let removed = self.store.truncate_timeline_after(last).await?;
        if removed.entries_removed > 0 {
            tracing::warn!(
                "Removed {} timeline entries past last synced block {last} from an interrupted run",
                removed.entries_removed
            );
        }

        let state = self.store.current_state().await?;
        let (delegators, timestamp) = match state {
            Some(state) if state.as_of_block == last => (state.delegators, state.as_of_timestamp),
            other => {
                tracing::warn!(
                    "Current state at block {:?} does not match last synced block {last}; \
                     rebuilding from timeline",
                    other.map(|s| s.as_of_block)
                );
                let entry = self.store.entry_at(last).await?;
                let timestamp = entry.as_ref().map_or(0, |e| e.timestamp);
                (entry.map(|e| e.delegators).unwrap_or_default(), timestamp)
            }
        };

        Ok(ResumePoint {
            from_block: last.saturating_add(1).max(self.config.start_block),
            delegators,
            timestamp,
        })
    }

    /// Fetch, classify and apply one chunk. The ledger is untouched when this fails.
    async fn process_chunk(
        &self,
        ledger: &mut LedgerBuilder,
        run: &mut RunState,
        from: u64,
        to: u64,
    ) -> Result<u64, SourceError> {
        let known: Vec<Address> = ledger.delegators().keys().copied().collect();
        let logs = self.fetch_chunk(&known, from, to).await?;
        if logs.is_empty() {
            tracing::trace!("No logs in [{from}, {to}]");
            return Ok(0);
        }

        let classification = classify(self.config.delegate, &logs);
        let stats = classification.stats;
        tracing::debug!(
            "Chunk [{from}, {to}]: {} logs, {} relationship, {} balance, {} suppressed, {} unattributed",
            logs.len(),
            stats.relationship,
            stats.balance,
            stats.suppressed,
            stats.unattributed
        );

        run.timestamps.record(&classification.events);
        run.timestamps
            .resolve(
                self.source.as_ref(),
                &self.config.retry,
                classification.events.iter().map(|e| e.block_number),
            )
            .await?;

        let entries = ledger.apply_all(&classification.events, run.timestamps.as_map());
        if let Some(last) = entries.last() {
            run.last_timestamp = last.timestamp;
        }
        run.pending.extend(entries);
        Ok(classification.events.len() as u64)
    }

    async fn fetch_chunk(
        &self,
        known: &[Address],
        from: u64,
        to: u64,
    ) -> Result<ChunkLogs, SourceError> {
        let delegate = [self.config.delegate];
        let token = self.config.token;
        let batch = self.config.transfer_address_batch.max(1);

        let delegations_to = LogQuery::new(token, DELEGATE_CHANGED_SIGNATURE, from, to);
        let to_us = self.get_logs(delegations_to.with_address_topic(3, &delegate)).await?;
        let joined: BTreeSet<Address> = to_us.iter().filter_map(indexed_address(1)).collect();

        let mut delegate_changes = to_us;
        let delegations_from = LogQuery::new(token, DELEGATE_CHANGED_SIGNATURE, from, to);
        delegate_changes
            .extend(self.get_logs(delegations_from.with_address_topic(2, &delegate)).await?);
        for addresses in known.chunks(batch) {
            let query = LogQuery::new(token, DELEGATE_CHANGED_SIGNATURE, from, to)
                .with_address_topic(1, addresses);
            delegate_changes.extend(self.get_logs(query).await?);
        }

        let votes = LogQuery::new(token, DELEGATE_VOTES_CHANGED_SIGNATURE, from, to)
            .with_address_topic(1, &delegate);
        let vote_changes = self.get_logs(votes).await?;

        // Delegators joining inside the chunk are watched for the whole chunk; their earlier
        // transfers are ignored by the ledger.
        let candidates: BTreeSet<Address> = known.iter().copied().chain(joined).collect();
        let candidates: Vec<Address> = candidates.into_iter().collect();
        let mut transfers = Vec::new();
        for addresses in candidates.chunks(batch) {
            for position in [1, 2] {
                let query = LogQuery::new(token, TRANSFER_SIGNATURE, from, to)
                    .with_address_topic(position, addresses);
                transfers.extend(self.get_logs(query).await?);
            }
        }

        Ok(ChunkLogs { delegate_changes, vote_changes, transfers })
    }

    async fn get_logs(&self, query: LogQuery) -> Result<Vec<Log>, SourceError> {
        retry_with_backoff(&self.config.retry, "eth_getLogs", || self.source.get_logs(&query)).await
    }

    /// Persist everything up to `block`: timeline first, then current state, then metadata.
    async fn checkpoint(
        &self,
        ledger: &LedgerBuilder,
        run: &mut RunState,
        guard: &mut SyncLockGuard,
        block: u64,
    ) -> Result<(), LedgerError> {
        self.renew(run, guard).await?;

        let index = self.store.append_timeline(&run.pending).await?;
        run.report.timeline_entries_written += run.pending.len() as u64;

        let as_of_timestamp = match run
            .timestamps
            .fetch(self.source.as_ref(), &self.config.retry, block)
            .await
        {
            Ok(timestamp) => timestamp,
            Err(err) => {
                tracing::warn!("Using last known timestamp for checkpoint block {block}: {err}");
                run.last_timestamp
            }
        };
        run.last_timestamp = as_of_timestamp;

        let delegators = ledger.delegators().clone();
        self.store
            .put_current_state(&CurrentState {
                as_of_block: block,
                as_of_timestamp,
                delegators,
            })
            .await?;

        self.store
            .put_metadata(&Metadata {
                last_synced_block: block,
                last_sync_timestamp: Utc::now().timestamp(),
                total_voting_power: ledger.total_voting_power(),
                total_delegators: ledger.delegators().len() as u64,
                total_timeline_entries: index.total_entries,
                timeline_partitions: index.partitions.len() as u64,
                delegate_address: self.config.delegate,
            })
            .await?;

        tracing::info!(
            "Checkpoint at block {block}: {} delegators, voting power {}, {} new timeline entries",
            ledger.delegators().len(),
            ledger.total_voting_power(),
            run.pending.len()
        );
        run.pending.clear();
        run.timestamps.prune_before(block);
        run.report.checkpoints += 1;
        Ok(())
    }

    /// Renew the lock once half its timeout has passed since the last renewal.
    async fn heartbeat(
        &self,
        run: &mut RunState,
        guard: &mut SyncLockGuard,
    ) -> Result<(), LedgerError> {
        if run.last_renewal.elapsed() >= self.locks.timeout() / 2 {
            self.renew(run, guard).await?;
        }
        Ok(())
    }

    async fn renew(&self, run: &mut RunState, guard: &mut SyncLockGuard) -> Result<(), LedgerError> {
        if !guard.renew().await? {
            let holder = self.store.sync_lock().await?.map_or(0, |lock| lock.pid);
            return Err(LedgerError::LockLost(holder));
        }
        run.last_renewal = Instant::now();
        Ok(())
    }

    async fn write_progress(&self, run: &RunState, current_block: u64) -> Result<(), LedgerError> {
        let from = run.report.from_block;
        let to = run.report.to_block;
        let total = (to - from + 1) as f64;
        let done = current_block.saturating_add(1).saturating_sub(from) as f64;
        let percent_complete = (done / total * 100.0).clamp(0.0, 100.0);
        let estimated_seconds_remaining = (percent_complete > 0.0).then(|| {
            let elapsed = run.started.elapsed().as_secs_f64();
            (elapsed * (100.0 - percent_complete) / percent_complete).round() as u64
        });

        self.store
            .put_sync_progress(&SyncProgress {
                current_block,
                target_block: to,
                start_block: from,
                events_processed: run.report.events_processed,
                percent_complete,
                estimated_seconds_remaining,
                started_at: run.started_at,
            })
            .await?;
        Ok(())
    }
}

/// Address in indexed topic `position` of a log.
fn indexed_address(position: usize) -> impl Fn(&Log) -> Option<Address> {
    move |log: &Log| log.topics().get(position).map(|topic: &B256| Address::from_word(*topic))
}
