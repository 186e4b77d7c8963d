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

//! Access to chain data: log range queries on the event endpoint and point-in-time state reads
//! on the archive endpoint.

use std::{collections::HashMap, future::Future, time::Duration};

use alloy::{
    eips::{BlockId, BlockNumberOrTag},
    primitives::{Address, B256, U256},
    providers::{
        fillers::{ChainIdFiller, FillProvider, JoinFill},
        Identity, Provider, ProviderBuilder, RootProvider,
    },
    rpc::{
        client::RpcClient,
        types::{Filter, Log},
    },
    transports::{layers::RetryBackoffLayer, RpcError, TransportErrorKind},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::{contracts::IVotesToken, events::OrderedEvent};

/// JSON-RPC codes for requests that will never succeed as sent.
const NON_RETRYABLE_RPC_CODES: &[i64] = &[-32600, -32601, -32602];

#[derive(Error, Debug)]
pub enum SourceError {
    /// Timeouts, rate limits, dropped connections: worth another attempt.
    #[error("Transient provider error: {0}")]
    Transient(String),

    /// Malformed or unsupported request: retrying cannot help.
    #[error("Provider rejected request: {0}")]
    Rejected(String),

    #[error("Block {0} not found")]
    MissingBlock(u64),
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Transient(_))
    }
}

impl From<RpcError<TransportErrorKind>> for SourceError {
    fn from(err: RpcError<TransportErrorKind>) -> Self {
        match &err {
            RpcError::Transport(_) | RpcError::NullResp => SourceError::Transient(err.to_string()),
            RpcError::ErrorResp(payload) if NON_RETRYABLE_RPC_CODES.contains(&payload.code) => {
                SourceError::Rejected(err.to_string())
            }
            RpcError::ErrorResp(_) => SourceError::Transient(err.to_string()),
            _ => SourceError::Rejected(err.to_string()),
        }
    }
}

impl From<alloy::contract::Error> for SourceError {
    fn from(err: alloy::contract::Error) -> Self {
        match err {
            alloy::contract::Error::TransportError(err) => err.into(),
            other => SourceError::Rejected(other.to_string()),
        }
    }
}

/// A `getLogs` request: one event signature on one contract over an inclusive block range.
///
/// `topics[i]` constrains indexed topic `i + 1`; an empty slot matches anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogQuery {
    pub address: Address,
    pub event_signature: B256,
    pub topics: [Vec<B256>; 3],
    pub from_block: u64,
    pub to_block: u64,
}

impl LogQuery {
    pub fn new(address: Address, event_signature: B256, from_block: u64, to_block: u64) -> Self {
        Self { address, event_signature, topics: Default::default(), from_block, to_block }
    }

    /// Restrict indexed topic `position` (1-based) to any of the given addresses.
    pub fn with_address_topic(mut self, position: usize, addresses: &[Address]) -> Self {
        if (1..=3).contains(&position) {
            self.topics[position - 1] = addresses.iter().map(|a| a.into_word()).collect();
        }
        self
    }

    pub fn to_filter(&self) -> Filter {
        let mut filter = Filter::new()
            .address(self.address)
            .event_signature(self.event_signature)
            .from_block(self.from_block)
            .to_block(self.to_block);
        if !self.topics[0].is_empty() {
            filter = filter.topic1(self.topics[0].clone());
        }
        if !self.topics[1].is_empty() {
            filter = filter.topic2(self.topics[1].clone());
        }
        if !self.topics[2].is_empty() {
            filter = filter.topic3(self.topics[2].clone());
        }
        filter
    }

    /// Evaluate the query against a log locally.
    pub fn matches(&self, log: &Log) -> bool {
        let Some(block_number) = log.block_number else {
            return false;
        };
        if block_number < self.from_block || block_number > self.to_block {
            return false;
        }
        if log.address() != self.address {
            return false;
        }
        let topics = log.topics();
        if topics.first() != Some(&self.event_signature) {
            return false;
        }
        self.topics.iter().enumerate().all(|(i, wanted)| {
            wanted.is_empty() || topics.get(i + 1).is_some_and(|topic| wanted.contains(topic))
        })
    }
}

/// The chain-facing collaborator of the ledger.
///
/// Implementations must be side-effect free; callers retry transient failures themselves.
#[async_trait]
pub trait LogSource: Send + Sync {
    async fn get_logs(&self, query: &LogQuery) -> Result<Vec<Log>, SourceError>;

    /// Raw token balance of `holder` at `block`.
    async fn balance_of(
        &self,
        token: Address,
        holder: Address,
        block: u64,
    ) -> Result<U256, SourceError>;

    /// Delegation target of `holder` at `block`.
    async fn delegates(
        &self,
        token: Address,
        holder: Address,
        block: u64,
    ) -> Result<Address, SourceError>;

    async fn latest_block_number(&self) -> Result<u64, SourceError>;

    async fn block_timestamp(&self, block: u64) -> Result<u64, SourceError>;
}

/// Exponential backoff for provider calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry
    #[serde(default = "defaults::initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Multiplier applied to the delay after each retry
    #[serde(default = "defaults::backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound for any single delay
    #[serde(default = "defaults::max_delay_ms")]
    pub max_delay_ms: u64,
    /// Total attempts including the first one
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,
}

mod defaults {
    pub const fn initial_delay_ms() -> u64 {
        500
    }

    pub const fn backoff_multiplier() -> f64 {
        2.0
    }

    pub const fn max_delay_ms() -> u64 {
        30_000
    }

    pub const fn max_attempts() -> u32 {
        5
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: defaults::initial_delay_ms(),
            backoff_multiplier: defaults::backoff_multiplier(),
            max_delay_ms: defaults::max_delay_ms(),
            max_attempts: defaults::max_attempts(),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self { initial_delay_ms: 0, backoff_multiplier: 1.0, max_delay_ms: 0, max_attempts }
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let backoff = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(retry as i32);
        Duration::from_millis(backoff.min(self.max_delay_ms as f64) as u64)
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or exhausts the policy.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut operation: F,
) -> Result<T, SourceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SourceError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => {
                tracing::warn!("{what} failed with non-retryable error: {err}");
                return Err(err);
            }
            Err(err) if attempt >= max_attempts => {
                tracing::warn!("{what} failed after {attempt} attempts: {err}");
                return Err(err);
            }
            Err(err) => {
                let delay = policy.delay_for(attempt - 1);
                tracing::warn!(
                    "{what} failed (attempt {attempt}/{max_attempts}), retrying in {:?}: {err}",
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Block timestamps known to one run, taken from logs where present and fetched otherwise.
#[derive(Debug, Default, Clone)]
pub struct BlockTimestamps {
    known: HashMap<u64, u64>,
}

impl BlockTimestamps {
    pub fn get(&self, block: u64) -> Option<u64> {
        self.known.get(&block).copied()
    }

    pub fn as_map(&self) -> &HashMap<u64, u64> {
        &self.known
    }

    /// Remember the timestamps that arrived with the events.
    pub fn record(&mut self, events: &[OrderedEvent]) {
        for event in events {
            if let Some(timestamp) = event.block_timestamp {
                self.known.insert(event.block_number, timestamp);
            }
        }
    }

    /// Fetch the timestamp of every block not seen yet.
    pub async fn resolve(
        &mut self,
        source: &dyn LogSource,
        policy: &RetryPolicy,
        blocks: impl IntoIterator<Item = u64>,
    ) -> Result<(), SourceError> {
        for block in blocks {
            if self.known.contains_key(&block) {
                continue;
            }
            let timestamp =
                retry_with_backoff(policy, "eth_getBlockByNumber", || source.block_timestamp(block))
                    .await?;
            self.known.insert(block, timestamp);
        }
        Ok(())
    }

    pub async fn fetch(
        &mut self,
        source: &dyn LogSource,
        policy: &RetryPolicy,
        block: u64,
    ) -> Result<u64, SourceError> {
        self.resolve(source, policy, [block]).await?;
        self.get(block).ok_or(SourceError::MissingBlock(block))
    }

    /// Forget blocks before `block`.
    pub fn prune_before(&mut self, block: u64) {
        self.known.retain(|b, _| *b >= block);
    }
}

type ProviderType = FillProvider<JoinFill<Identity, ChainIdFiller>, RootProvider>;

/// [LogSource] over two JSON-RPC endpoints.
#[derive(Clone)]
pub struct RpcLogSource<P = ProviderType> {
    // Provider dedicated to get_logs calls
    events_provider: P,
    // Archive provider for historical state reads
    archive_provider: P,
}

impl RpcLogSource<ProviderType> {
    pub fn new(events_rpc_url: Url, archive_rpc_url: Url) -> Self {
        Self { events_provider: connect(events_rpc_url), archive_provider: connect(archive_rpc_url) }
    }
}

fn connect(rpc_url: Url) -> ProviderType {
    ProviderBuilder::new()
        .disable_recommended_fillers()
        .filler(ChainIdFiller::default())
        .connect_client(RpcClient::builder().layer(RetryBackoffLayer::new(3, 1000, 200)).http(rpc_url))
}

#[async_trait]
impl<P> LogSource for RpcLogSource<P>
where
    P: Provider + Clone + Send + Sync + 'static,
{
    async fn get_logs(&self, query: &LogQuery) -> Result<Vec<Log>, SourceError> {
        tracing::trace!(
            "eth_getLogs {} on {:#x} [{}, {}]",
            query.event_signature,
            query.address,
            query.from_block,
            query.to_block
        );
        Ok(self.events_provider.get_logs(&query.to_filter()).await?)
    }

    async fn balance_of(
        &self,
        token: Address,
        holder: Address,
        block: u64,
    ) -> Result<U256, SourceError> {
        let contract = IVotesToken::new(token, &self.archive_provider);
        Ok(contract.balanceOf(holder).block(BlockId::number(block)).call().await?)
    }

    async fn delegates(
        &self,
        token: Address,
        holder: Address,
        block: u64,
    ) -> Result<Address, SourceError> {
        let contract = IVotesToken::new(token, &self.archive_provider);
        Ok(contract.delegates(holder).block(BlockId::number(block)).call().await?)
    }

    async fn latest_block_number(&self) -> Result<u64, SourceError> {
        Ok(self.archive_provider.get_block_number().await?)
    }

    async fn block_timestamp(&self, block: u64) -> Result<u64, SourceError> {
        let header = self
            .archive_provider
            .get_block_by_number(BlockNumberOrTag::Number(block))
            .await?
            .ok_or(SourceError::MissingBlock(block))?
            .header;
        Ok(header.timestamp)
    }
}
