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

//! Deployment configuration, loaded from TOML.

use std::{fmt, path::Path, path::PathBuf, str::FromStr, time::Duration};

use alloy::primitives::{Address, U256};
use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use url::Url;

use crate::{errors::LedgerError, source::RetryPolicy, types::u256_decimal};

pub mod defaults {
    use std::path::PathBuf;

    pub const fn chain_id() -> u64 {
        1
    }

    pub fn data_dir() -> PathBuf {
        PathBuf::from("./data")
    }

    pub const fn chunk_size() -> u64 {
        10_000
    }

    pub const fn checkpoint_interval() -> u64 {
        1_000_000
    }

    pub const fn chunk_delay_ms() -> u64 {
        200
    }

    pub const fn transfer_address_batch() -> usize {
        100
    }

    pub const fn lock_timeout_secs() -> u64 {
        600
    }

    pub const fn verify_batch_size() -> usize {
        5
    }

    pub const fn verify_batch_delay_ms() -> u64 {
        100
    }

    pub const fn partition_size() -> u64 {
        1000
    }

    pub const fn cache_ttl_secs() -> u64 {
        30
    }

    pub const fn cache_capacity() -> u64 {
        1024
    }
}

/// Last block a sync should reach.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EndBlock {
    Block(u64),
    /// Follow the chain head at the time the run starts.
    #[default]
    Head,
}

impl EndBlock {
    /// Resolve against the current chain head.
    pub fn resolve(self, head: u64) -> u64 {
        match self {
            EndBlock::Block(block) => block.min(head),
            EndBlock::Head => head,
        }
    }
}

impl fmt::Display for EndBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndBlock::Block(block) => write!(f, "{block}"),
            EndBlock::Head => f.write_str("head"),
        }
    }
}

impl FromStr for EndBlock {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("head") || s.eq_ignore_ascii_case("latest") {
            return Ok(EndBlock::Head);
        }
        s.parse().map(EndBlock::Block).map_err(|_| format!("invalid end block: {s}"))
    }
}

impl Serialize for EndBlock {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            EndBlock::Block(block) => serializer.serialize_u64(*block),
            EndBlock::Head => serializer.serialize_str("head"),
        }
    }
}

impl<'de> Deserialize<'de> for EndBlock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Block(u64),
            Tag(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Block(block) => Ok(EndBlock::Block(block)),
            Raw::Tag(tag) => tag.parse().map_err(serde::de::Error::custom),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Blocks per log query
    #[serde(default = "defaults::chunk_size")]
    pub chunk_size: u64,
    /// Blocks between persisted checkpoints
    #[serde(default = "defaults::checkpoint_interval")]
    pub checkpoint_interval: u64,
    /// Pause between chunks, to stay under provider rate limits
    #[serde(default = "defaults::chunk_delay_ms")]
    pub chunk_delay_ms: u64,
    /// Addresses per `Transfer` topic filter
    #[serde(default = "defaults::transfer_address_batch")]
    pub transfer_address_batch: usize,
    /// Age after which a sync lock is considered abandoned
    #[serde(default = "defaults::lock_timeout_secs")]
    pub lock_timeout_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            chunk_size: defaults::chunk_size(),
            checkpoint_interval: defaults::checkpoint_interval(),
            chunk_delay_ms: defaults::chunk_delay_ms(),
            transfer_address_batch: defaults::transfer_address_batch(),
            lock_timeout_secs: defaults::lock_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifySettings {
    /// Concurrent archive reads per batch
    #[serde(default = "defaults::verify_batch_size")]
    pub batch_size: usize,
    #[serde(default = "defaults::verify_batch_delay_ms")]
    pub batch_delay_ms: u64,
    /// Differences at or below this are not reported
    #[serde(default, with = "u256_decimal")]
    pub threshold: U256,
}

impl Default for VerifySettings {
    fn default() -> Self {
        Self {
            batch_size: defaults::verify_batch_size(),
            batch_delay_ms: defaults::verify_batch_delay_ms(),
            threshold: U256::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Timeline entries per partition
    #[serde(default = "defaults::partition_size")]
    pub partition_size: u64,
    #[serde(default = "defaults::cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "defaults::cache_capacity")]
    pub cache_capacity: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            partition_size: defaults::partition_size(),
            cache_ttl_secs: defaults::cache_ttl_secs(),
            cache_capacity: defaults::cache_capacity(),
        }
    }
}

/// Ledger deployment config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Delegate whose voting power is tracked
    pub delegate_address: Address,
    /// ERC20Votes token contract
    pub token_address: Address,
    #[serde(default = "defaults::chain_id")]
    pub chain_id: u64,
    /// First block scanned on a cold start
    #[serde(default)]
    pub start_block: u64,
    /// Last block to sync, a number or `"head"`
    #[serde(default)]
    pub end_block: EndBlock,
    /// Endpoint for wide `eth_getLogs` ranges
    pub events_rpc_url: Url,
    /// Archive endpoint for historical state reads. Falls back to the events endpoint.
    #[serde(default)]
    pub archive_rpc_url: Option<Url>,
    #[serde(default = "defaults::data_dir")]
    pub data_dir: PathBuf,
    /// Gates mutating operations in the HTTP layer; not checked here.
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub verify: VerifySettings,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl LedgerConfig {
    /// Load the config from disk
    pub async fn load(path: &Path) -> Result<Self> {
        let data = tokio::fs::read_to_string(path)
            .await
            .context(format!("Failed to read config file from {path:?}"))?;
        let config: Self =
            toml::from_str(&data).context(format!("Failed to parse toml file from {path:?}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.delegate_address == Address::ZERO {
            return Err(LedgerError::Config("delegate_address must not be zero".into()));
        }
        if self.token_address == Address::ZERO {
            return Err(LedgerError::Config("token_address must not be zero".into()));
        }
        if self.sync.chunk_size == 0 {
            return Err(LedgerError::Config("sync.chunk_size must be positive".into()));
        }
        if self.sync.checkpoint_interval < self.sync.chunk_size {
            return Err(LedgerError::Config(format!(
                "sync.checkpoint_interval ({}) must be at least sync.chunk_size ({})",
                self.sync.checkpoint_interval, self.sync.chunk_size
            )));
        }
        if self.store.partition_size == 0 {
            return Err(LedgerError::Config("store.partition_size must be positive".into()));
        }
        if let EndBlock::Block(end) = self.end_block {
            if end < self.start_block {
                return Err(LedgerError::Config(format!(
                    "end_block ({end}) is before start_block ({})",
                    self.start_block
                )));
            }
        }
        Ok(())
    }

    pub fn archive_rpc_url(&self) -> &Url {
        self.archive_rpc_url.as_ref().unwrap_or(&self.events_rpc_url)
    }

    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.sync.chunk_delay_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.lock_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.store.cache_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    const MINIMAL: &str = r#"
        delegate_address = "0x00000000000000000000000000000000000000dd"
        token_address = "0x0000000000000000000000000000000000000a11"
        events_rpc_url = "http://localhost:8545"
    "#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: LedgerConfig = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.delegate_address, address!("0x00000000000000000000000000000000000000dd"));
        assert_eq!(config.end_block, EndBlock::Head);
        assert_eq!(config.sync, SyncSettings::default());
        assert_eq!(config.store.partition_size, 1000);
        assert_eq!(config.verify.batch_size, 5);
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.archive_rpc_url().as_str(), "http://localhost:8545/");
        config.validate().unwrap();
    }

    #[test]
    fn test_end_block_forms() {
        let numeric: LedgerConfig =
            toml::from_str(&format!("{MINIMAL}\nend_block = 20000000\nstart_block = 5")).unwrap();
        assert_eq!(numeric.end_block, EndBlock::Block(20_000_000));

        let tagged: LedgerConfig = toml::from_str(&format!("{MINIMAL}\nend_block = \"head\"")).unwrap();
        assert_eq!(tagged.end_block, EndBlock::Head);

        assert!(toml::from_str::<LedgerConfig>(&format!("{MINIMAL}\nend_block = \"soon\"")).is_err());
        assert_eq!(EndBlock::Block(10).resolve(5), 5);
        assert_eq!(EndBlock::Head.resolve(5), 5);
    }

    #[test]
    fn test_validate_rejects_bad_sections() {
        let mut config: LedgerConfig = toml::from_str(MINIMAL).unwrap();
        config.sync.checkpoint_interval = config.sync.chunk_size - 1;
        assert!(matches!(config.validate(), Err(LedgerError::Config(_))));

        let mut config: LedgerConfig = toml::from_str(MINIMAL).unwrap();
        config.start_block = 100;
        config.end_block = EndBlock::Block(99);
        assert!(config.validate().is_err());

        let mut config: LedgerConfig = toml::from_str(MINIMAL).unwrap();
        config.delegate_address = Address::ZERO;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.toml");
        tokio::fs::write(&path, format!("{MINIMAL}\n[sync]\nchunk_size = 500\n")).await.unwrap();
        let config = LedgerConfig::load(&path).await.unwrap();
        assert_eq!(config.sync.chunk_size, 500);
        assert_eq!(config.sync.checkpoint_interval, 1_000_000);
    }
}
