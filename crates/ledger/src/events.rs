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

//! Semantic ledger events, the output of log classification.

use alloy::primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// A delegation relationship was created, changed or removed.
    DelegateChanged,
    /// A tracked delegator's balance moved without a relationship change.
    BalanceChanged,
}

/// Direction and size of a pure balance movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceChange {
    Increased(U256),
    Decreased(U256),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelegationEvent {
    DelegateChanged {
        delegator: Address,
        from_delegate: Address,
        to_delegate: Address,
        /// Weight the delegator carried away from `from_delegate`.
        previous_balance: U256,
        /// Weight the delegator brought to `to_delegate`.
        new_balance: U256,
    },
    BalanceChanged {
        delegator: Address,
        change: BalanceChange,
    },
}

impl DelegationEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            DelegationEvent::DelegateChanged { .. } => EventType::DelegateChanged,
            DelegationEvent::BalanceChanged { .. } => EventType::BalanceChanged,
        }
    }

    pub fn delegator(&self) -> Address {
        match self {
            DelegationEvent::DelegateChanged { delegator, .. }
            | DelegationEvent::BalanceChanged { delegator, .. } => *delegator,
        }
    }
}

/// A [DelegationEvent] with its position on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedEvent {
    pub block_number: u64,
    pub log_index: u64,
    pub transaction_hash: B256,
    /// Block timestamp when the provider included it in the log.
    pub block_timestamp: Option<u64>,
    pub event: DelegationEvent,
}

impl OrderedEvent {
    pub fn sort_key(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }
}
