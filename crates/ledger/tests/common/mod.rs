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

#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use alloy::{
    primitives::{Address, B256, U256},
    rpc::types::Log,
    sol_types::SolEvent,
};
use async_trait::async_trait;
use delegate_ledger::{
    contracts::IVotesToken, LedgerConfig, LedgerService, LedgerStore, LogQuery, LogSource,
    SourceError,
};

pub const TOKEN: Address = Address::repeat_byte(0x70);
pub const DELEGATE: Address = Address::repeat_byte(0xdd);
pub const ALICE: Address = Address::repeat_byte(0xa1);
pub const BOB: Address = Address::repeat_byte(0xb0);
pub const CAROL: Address = Address::repeat_byte(0xc0);
pub const OUTSIDER: Address = Address::repeat_byte(0x0e);
pub const ELSEWHERE: Address = Address::repeat_byte(0xee);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Log source over a fixed set of logs and a fixed on-chain state.
#[derive(Default)]
pub struct MockLogSource {
    pub logs: Vec<Log>,
    pub head: u64,
    pub balances: HashMap<Address, U256>,
    pub delegates: HashMap<Address, Address>,
    /// Holders whose state reads always fail
    pub failing_reads: HashSet<Address>,
    /// Log queries overlapping this range fail
    pub failing_range: Option<(u64, u64)>,
    pub get_logs_calls: AtomicUsize,
    pub queries: Mutex<Vec<LogQuery>>,
}

impl MockLogSource {
    pub fn new(logs: Vec<Log>, head: u64) -> Self {
        Self { logs, head, ..Default::default() }
    }
}

#[async_trait]
impl LogSource for MockLogSource {
    async fn get_logs(&self, query: &LogQuery) -> Result<Vec<Log>, SourceError> {
        // Give concurrent callers a chance to run.
        tokio::task::yield_now().await;
        self.get_logs_calls.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().unwrap().push(query.clone());
        if let Some((from, to)) = self.failing_range {
            if query.from_block <= to && query.to_block >= from {
                return Err(SourceError::Transient("rate limited".into()));
            }
        }
        Ok(self.logs.iter().filter(|log| query.matches(log)).cloned().collect())
    }

    async fn balance_of(
        &self,
        _token: Address,
        holder: Address,
        _block: u64,
    ) -> Result<U256, SourceError> {
        if self.failing_reads.contains(&holder) {
            return Err(SourceError::Transient("timeout".into()));
        }
        Ok(self.balances.get(&holder).copied().unwrap_or_default())
    }

    async fn delegates(
        &self,
        _token: Address,
        holder: Address,
        _block: u64,
    ) -> Result<Address, SourceError> {
        if self.failing_reads.contains(&holder) {
            return Err(SourceError::Transient("timeout".into()));
        }
        Ok(self.delegates.get(&holder).copied().unwrap_or_default())
    }

    async fn latest_block_number(&self) -> Result<u64, SourceError> {
        tokio::task::yield_now().await;
        Ok(self.head)
    }

    async fn block_timestamp(&self, block: u64) -> Result<u64, SourceError> {
        Ok(1_700_000_000 + block * 12)
    }
}

pub fn tx(n: u64) -> B256 {
    B256::left_padding_from(&n.to_be_bytes())
}

fn wrap(event: &impl SolEvent, block: u64, tx_hash: B256, log_index: u64) -> Log {
    Log {
        inner: alloy::primitives::Log { address: TOKEN, data: event.encode_log_data() },
        block_number: Some(block),
        transaction_hash: Some(tx_hash),
        log_index: Some(log_index),
        ..Default::default()
    }
}

pub fn delegate_changed(
    delegator: Address,
    from: Address,
    to: Address,
    block: u64,
    tx_hash: B256,
    log_index: u64,
) -> Log {
    let event = IVotesToken::DelegateChanged { delegator, fromDelegate: from, toDelegate: to };
    wrap(&event, block, tx_hash, log_index)
}

pub fn votes_changed(previous: u64, new: u64, block: u64, tx_hash: B256, log_index: u64) -> Log {
    let event = IVotesToken::DelegateVotesChanged {
        delegate: DELEGATE,
        previousVotes: U256::from(previous),
        newVotes: U256::from(new),
    };
    wrap(&event, block, tx_hash, log_index)
}

pub fn transfer(
    from: Address,
    to: Address,
    value: u64,
    block: u64,
    tx_hash: B256,
    log_index: u64,
) -> Log {
    let event = IVotesToken::Transfer { from, to, value: U256::from(value) };
    wrap(&event, block, tx_hash, log_index)
}

/// Block 100: Alice delegates 1000. Block 150: she sends 500 away. Block 200: she self-delegates.
pub fn example_scenario() -> Vec<Log> {
    vec![
        delegate_changed(ALICE, Address::ZERO, DELEGATE, 100, tx(1), 0),
        votes_changed(0, 1000, 100, tx(1), 1),
        transfer(ALICE, OUTSIDER, 500, 150, tx(2), 0),
        votes_changed(1000, 500, 150, tx(2), 1),
        delegate_changed(ALICE, DELEGATE, ALICE, 200, tx(3), 0),
        votes_changed(500, 0, 200, tx(3), 1),
    ]
}

/// Three delegators joining, trading, leaving and rejoining over blocks 10 to 100.
///
/// Ends with Alice at 1075 and Carol at 30.
pub fn busy_history() -> Vec<Log> {
    vec![
        delegate_changed(ALICE, Address::ZERO, DELEGATE, 10, tx(1), 0),
        votes_changed(0, 100, 10, tx(1), 1),
        delegate_changed(BOB, Address::ZERO, DELEGATE, 20, tx(2), 0),
        votes_changed(100, 300, 20, tx(2), 1),
        // Both sides delegate to us: no weight change.
        transfer(ALICE, BOB, 40, 30, tx(3), 0),
        transfer(OUTSIDER, ALICE, 10, 40, tx(4), 0),
        votes_changed(300, 310, 40, tx(4), 1),
        delegate_changed(CAROL, Address::ZERO, DELEGATE, 55, tx(5), 0),
        votes_changed(310, 360, 55, tx(5), 1),
        transfer(CAROL, OUTSIDER, 20, 55, tx(6), 2),
        votes_changed(360, 340, 55, tx(6), 3),
        delegate_changed(BOB, DELEGATE, ELSEWHERE, 70, tx(7), 0),
        votes_changed(340, 100, 70, tx(7), 1),
        transfer(BOB, ALICE, 5, 80, tx(8), 0),
        votes_changed(100, 105, 80, tx(8), 1),
        delegate_changed(ALICE, DELEGATE, ALICE, 90, tx(9), 0),
        votes_changed(105, 30, 90, tx(9), 1),
        // Alice is not delegating here.
        transfer(OUTSIDER, ALICE, 1000, 95, tx(10), 0),
        delegate_changed(ALICE, ALICE, DELEGATE, 100, tx(11), 0),
        votes_changed(30, 1105, 100, tx(11), 1),
    ]
}

/// Config with no delays and fast retries.
pub fn test_config(chunk_size: u64, checkpoint_interval: u64) -> LedgerConfig {
    let toml = format!(
        r#"
        delegate_address = "{DELEGATE:#x}"
        token_address = "{TOKEN:#x}"
        events_rpc_url = "http://localhost:8545"
        start_block = 1

        [sync]
        chunk_size = {chunk_size}
        checkpoint_interval = {checkpoint_interval}
        chunk_delay_ms = 0
        transfer_address_batch = 2

        [verify]
        batch_size = 2
        batch_delay_ms = 0

        [store]
        partition_size = 4

        [retry]
        initial_delay_ms = 0
        max_delay_ms = 0
        max_attempts = 2
        "#
    );
    toml::from_str(&toml).unwrap()
}

pub fn service(config: LedgerConfig, source: Arc<MockLogSource>, store: &LedgerStore) -> LedgerService {
    LedgerService::new(config, source, store.clone())
}
