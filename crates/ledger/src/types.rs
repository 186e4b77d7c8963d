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

//! Persisted record shapes.
//!
//! Every 256-bit quantity crosses the store as a decimal string and every address as lower-case
//! hex, so the JSON stays readable by consumers that have no big-integer support.

use std::collections::BTreeMap;

use alloy::primitives::{Address, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delegator address to the balance it currently delegates.
pub type DelegatorMap = BTreeMap<Address, U256>;

/// Sum of all balances in a delegator map.
pub fn total_voting_power(delegators: &DelegatorMap) -> U256 {
    delegators.values().fold(U256::ZERO, |acc, balance| acc.saturating_add(*balance))
}

/// Snapshot of the delegator set at one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
    pub block_number: u64,
    pub timestamp: u64,
    #[serde(with = "u256_decimal")]
    pub total_voting_power: U256,
    #[serde(with = "delegator_map")]
    pub delegators: DelegatorMap,
}

impl TimelineEntry {
    pub fn new(block_number: u64, timestamp: u64, delegators: DelegatorMap) -> Self {
        Self {
            block_number,
            timestamp,
            total_voting_power: total_voting_power(&delegators),
            delegators,
        }
    }
}

/// Materialized view of the latest delegator set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentState {
    pub as_of_block: u64,
    pub as_of_timestamp: u64,
    #[serde(with = "delegator_map")]
    pub delegators: DelegatorMap,
}

/// Aggregate counters kept next to the current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub last_synced_block: u64,
    /// Unix seconds of the last successful checkpoint.
    pub last_sync_timestamp: i64,
    #[serde(with = "u256_decimal")]
    pub total_voting_power: U256,
    pub total_delegators: u64,
    pub total_timeline_entries: u64,
    pub timeline_partitions: u64,
    #[serde(with = "lower_hex_address")]
    pub delegate_address: Address,
}

impl Metadata {
    pub fn empty(delegate_address: Address) -> Self {
        Self {
            last_synced_block: 0,
            last_sync_timestamp: 0,
            total_voting_power: U256::ZERO,
            total_delegators: 0,
            total_timeline_entries: 0,
            timeline_partitions: 0,
            delegate_address,
        }
    }
}

/// One timeline partition as referenced from the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionInfo {
    pub id: u64,
    pub start_block: u64,
    pub end_block: u64,
    pub entry_count: u64,
}

impl PartitionInfo {
    /// Whether the partition's block span intersects `[from, to]`.
    pub fn overlaps(&self, from: u64, to: u64) -> bool {
        self.start_block <= to && self.end_block >= from
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineIndex {
    pub total_entries: u64,
    pub partition_size: u64,
    pub partitions: Vec<PartitionInfo>,
}

impl TimelineIndex {
    pub fn empty(partition_size: u64) -> Self {
        Self { total_entries: 0, partition_size, partitions: Vec::new() }
    }

    pub fn last_block(&self) -> Option<u64> {
        self.partitions.last().map(|p| p.end_block)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelinePartition {
    pub partition_id: u64,
    pub entries: Vec<TimelineEntry>,
}

/// Advisory single-writer lock record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLock {
    pub sync_in_progress: bool,
    pub started_at: DateTime<Utc>,
    pub pid: u32,
}

/// Live progress of a running sync. Absent when nothing is running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub current_block: u64,
    pub target_block: u64,
    pub start_block: u64,
    pub events_processed: u64,
    pub percent_complete: f64,
    pub estimated_seconds_remaining: Option<u64>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Discrepancy {
    #[serde(with = "lower_hex_address")]
    pub address: Address,
    #[serde(with = "u256_decimal")]
    pub stored: U256,
    #[serde(with = "u256_decimal")]
    pub actual: U256,
    #[serde(with = "u256_decimal")]
    pub difference: U256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyMode {
    Check,
    Fix,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub mode: VerifyMode,
    pub block_number: u64,
    pub verified: u64,
    pub failed: u64,
    pub discrepancies: Vec<Discrepancy>,
    /// Whether corrections were written back.
    pub applied: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TruncateResult {
    pub entries_removed: u64,
    pub partitions_removed: u64,
    pub last_block_number: u64,
}

pub mod u256_decimal {
    use alloy::primitives::U256;
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let s = String::deserialize(deserializer)?;
        U256::from_str_radix(&s, 10).map_err(D::Error::custom)
    }
}

pub mod lower_hex_address {
    use std::str::FromStr;

    use alloy::primitives::Address;
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Address, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:#x}", value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Address, D::Error> {
        let s = String::deserialize(deserializer)?;
        Address::from_str(&s).map_err(D::Error::custom)
    }
}

pub mod delegator_map {
    use std::{collections::BTreeMap, str::FromStr};

    use alloy::primitives::{Address, U256};
    use serde::{de::Error as _, ser::SerializeMap, Deserialize, Deserializer, Serializer};

    use super::DelegatorMap;

    pub fn serialize<S: Serializer>(map: &DelegatorMap, serializer: S) -> Result<S::Ok, S::Error> {
        let mut out = serializer.serialize_map(Some(map.len()))?;
        for (address, balance) in map {
            out.serialize_entry(&format!("{:#x}", address), &balance.to_string())?;
        }
        out.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DelegatorMap, D::Error> {
        let raw = BTreeMap::<String, String>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(address, balance)| {
                let address = Address::from_str(&address).map_err(D::Error::custom)?;
                let balance = U256::from_str_radix(&balance, 10).map_err(D::Error::custom)?;
                Ok((address, balance))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    #[test]
    fn test_timeline_entry_wire_format() {
        let holder = address!("0xAbCdEf0000000000000000000000000000000001");
        let mut delegators = DelegatorMap::new();
        // Larger than any f64 can represent exactly.
        let big = U256::from(10).pow(U256::from(30)) + U256::from(7);
        delegators.insert(holder, big);
        let entry = TimelineEntry::new(100, 1_700_000_000, delegators);

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["blockNumber"], 100);
        assert_eq!(json["totalVotingPower"], "1000000000000000000000000000007");
        assert_eq!(
            json["delegators"]["0xabcdef0000000000000000000000000000000001"],
            "1000000000000000000000000000007"
        );

        let parsed: TimelineEntry = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn test_partition_overlap() {
        let p = PartitionInfo { id: 0, start_block: 100, end_block: 200, entry_count: 3 };
        assert!(p.overlaps(150, 160));
        assert!(p.overlaps(0, 100));
        assert!(p.overlaps(200, 300));
        assert!(!p.overlaps(0, 99));
        assert!(!p.overlaps(201, 300));
    }
}
