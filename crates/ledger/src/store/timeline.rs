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

//! Partitioned timeline persistence.
//!
//! Entries live in fixed-size partitions, `timeline-entries-{id}`, and the index lists each
//! partition's block span. A partition is always written before the index that references it, and
//! dropped from the index before it is deleted, so the index never points at a missing partition.
//! A partition may hold entries past what the index lists if a run stopped between the two writes;
//! reads go through the index and ignore them.

use crate::types::{PartitionInfo, TimelineEntry, TimelineIndex, TimelinePartition, TruncateResult};

use super::{
    partition_key, LedgerStore, StoreError, TIMELINE_INDEX_KEY, TIMELINE_PARTITION_PREFIX,
};

impl LedgerStore {
    async fn load_index(&self) -> Result<TimelineIndex, StoreError> {
        Ok(self.timeline_index().await?.unwrap_or_else(|| TimelineIndex::empty(self.partition_size)))
    }

    pub async fn read_partition(&self, id: u64) -> Result<TimelinePartition, StoreError> {
        self.get_json(&partition_key(id)).await?.ok_or(StoreError::MissingPartition(id))
    }

    /// The entries `info` accounts for.
    async fn read_indexed(&self, info: &PartitionInfo) -> Result<TimelinePartition, StoreError> {
        let mut partition = self.read_partition(info.id).await?;
        if partition.entries.len() as u64 > info.entry_count {
            tracing::warn!(
                "Ignoring {} unindexed entries in timeline partition {}",
                partition.entries.len() as u64 - info.entry_count,
                info.id
            );
            partition.entries.truncate(info.entry_count as usize);
        }
        Ok(partition)
    }

    async fn write_partition(&self, partition: &TimelinePartition) -> Result<(), StoreError> {
        self.put_json(&partition_key(partition.partition_id), partition).await
    }

    /// Append block-ordered entries to the tail of the timeline.
    ///
    /// Entries at or below the last stored block are dropped.
    pub async fn append_timeline(
        &self,
        entries: &[TimelineEntry],
    ) -> Result<TimelineIndex, StoreError> {
        let mut index = self.load_index().await?;
        let last_block = index.last_block();
        let fresh: Vec<&TimelineEntry> =
            entries.iter().filter(|e| last_block.map_or(true, |b| e.block_number > b)).collect();
        if fresh.len() < entries.len() {
            tracing::warn!(
                "Dropping {} timeline entries at or before stored block {:?}",
                entries.len() - fresh.len(),
                last_block
            );
        }
        if fresh.is_empty() {
            return Ok(index);
        }

        let size = index.partition_size.max(1);
        let mut touched = Vec::new();
        let mut tail = match index.partitions.last() {
            Some(info) if info.entry_count < size => Some(self.read_indexed(info).await?),
            _ => None,
        };
        let mut next_id = index.partitions.last().map_or(0, |p| p.id + 1);

        for entry in fresh {
            if tail.as_ref().map_or(true, |p| p.entries.len() as u64 >= size) {
                touched.extend(tail.take());
                tail = Some(TimelinePartition { partition_id: next_id, entries: Vec::new() });
                next_id += 1;
            }
            if let Some(partition) = tail.as_mut() {
                partition.entries.push(entry.clone());
            }
        }
        touched.extend(tail);

        for partition in &touched {
            self.write_partition(partition).await?;
            let info = partition_info(partition);
            match index.partitions.iter_mut().find(|p| p.id == info.id) {
                Some(existing) => *existing = info,
                None => index.partitions.push(info),
            }
        }
        index.total_entries = index.partitions.iter().map(|p| p.entry_count).sum();
        self.put_json(TIMELINE_INDEX_KEY, &index).await?;

        tracing::debug!(
            "Timeline now {} entries in {} partitions",
            index.total_entries,
            index.partitions.len()
        );
        Ok(index)
    }

    /// Record `entry` as the newest snapshot, replacing the last entry if it is for the same block.
    pub async fn upsert_latest_entry(
        &self,
        entry: TimelineEntry,
    ) -> Result<TimelineIndex, StoreError> {
        let mut index = self.load_index().await?;
        let Some(info) = index.partitions.last().cloned() else {
            return self.append_timeline(&[entry]).await;
        };
        if entry.block_number > info.end_block {
            return self.append_timeline(&[entry]).await;
        }
        if entry.block_number < info.end_block {
            return Err(StoreError::OutOfOrder { block: entry.block_number, last: info.end_block });
        }

        let mut partition = self.read_indexed(&info).await?;
        match partition.entries.last_mut() {
            Some(last) => *last = entry,
            None => partition.entries.push(entry),
        }
        self.write_partition(&partition).await?;
        if let Some(last) = index.partitions.last_mut() {
            *last = partition_info(&partition);
        }
        index.total_entries = index.partitions.iter().map(|p| p.entry_count).sum();
        self.put_json(TIMELINE_INDEX_KEY, &index).await?;
        Ok(index)
    }

    /// Entries with `from <= block_number <= to`, reading only the partitions that overlap.
    pub async fn read_timeline(
        &self,
        from: Option<u64>,
        to: Option<u64>,
    ) -> Result<Vec<TimelineEntry>, StoreError> {
        let from = from.unwrap_or(0);
        let to = to.unwrap_or(u64::MAX);
        if from > to {
            return Ok(Vec::new());
        }

        let index = self.load_index().await?;
        let mut entries = Vec::new();
        for info in index.partitions.iter().filter(|p| p.overlaps(from, to)) {
            let partition = self.read_indexed(info).await?;
            entries.extend(
                partition
                    .entries
                    .into_iter()
                    .filter(|e| e.block_number >= from && e.block_number <= to),
            );
        }
        Ok(entries)
    }

    /// The newest entry at or before `block`, if any.
    pub async fn entry_at(&self, block: u64) -> Result<Option<TimelineEntry>, StoreError> {
        let index = self.load_index().await?;
        let Some(info) = index.partitions.iter().rev().find(|p| p.start_block <= block) else {
            return Ok(None);
        };
        let partition = self.read_indexed(info).await?;
        Ok(partition.entries.into_iter().rev().find(|e| e.block_number <= block))
    }

    /// Remove every entry with `block_number > max_block`.
    pub async fn truncate_timeline_after(
        &self,
        max_block: u64,
    ) -> Result<TruncateResult, StoreError> {
        let mut index = self.load_index().await?;
        let mut entries_removed = 0;
        let mut kept = Vec::with_capacity(index.partitions.len());
        let mut dropped = Vec::new();

        for info in index.partitions.drain(..) {
            if info.end_block <= max_block {
                kept.push(info);
            } else if info.start_block > max_block {
                entries_removed += info.entry_count;
                dropped.push(info.id);
            } else {
                let mut partition = self.read_indexed(&info).await?;
                let before = partition.entries.len() as u64;
                partition.entries.retain(|e| e.block_number <= max_block);
                entries_removed += before - partition.entries.len() as u64;
                if partition.entries.is_empty() {
                    dropped.push(info.id);
                } else {
                    self.write_partition(&partition).await?;
                    kept.push(partition_info(&partition));
                }
            }
        }

        index.partitions = kept;
        index.total_entries = index.partitions.iter().map(|p| p.entry_count).sum();
        self.put_json(TIMELINE_INDEX_KEY, &index).await?;
        for id in &dropped {
            self.delete_key(&partition_key(*id)).await?;
        }
        self.delete_orphan_partitions(&index).await?;

        if entries_removed > 0 {
            tracing::info!(
                "Truncated timeline after block {}: {} entries, {} partitions removed",
                max_block,
                entries_removed,
                dropped.len()
            );
        }
        Ok(TruncateResult {
            entries_removed,
            partitions_removed: dropped.len() as u64,
            last_block_number: index.last_block().unwrap_or(0),
        })
    }

    /// Delete partitions the index does not list. A run that stopped before its index write
    /// leaves them behind.
    async fn delete_orphan_partitions(&self, index: &TimelineIndex) -> Result<(), StoreError> {
        for key in self.list_keys(TIMELINE_PARTITION_PREFIX).await? {
            let listed = key
                .strip_prefix(TIMELINE_PARTITION_PREFIX)
                .and_then(|id| id.parse::<u64>().ok())
                .is_some_and(|id| index.partitions.iter().any(|p| p.id == id));
            if !listed {
                tracing::warn!("Deleting orphan timeline partition {key}");
                self.delete_key(&key).await?;
            }
        }
        Ok(())
    }
}

fn partition_info(partition: &TimelinePartition) -> PartitionInfo {
    PartitionInfo {
        id: partition.partition_id,
        start_block: partition.entries.first().map_or(0, |e| e.block_number),
        end_block: partition.entries.last().map_or(0, |e| e.block_number),
        entry_count: partition.entries.len() as u64,
    }
}
