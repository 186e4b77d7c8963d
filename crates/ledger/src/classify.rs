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

//! Turns raw delegation, vote-weight and transfer logs into ordered ledger events.
//!
//! An ERC20Votes delegation always fires a `DelegateVotesChanged` for the same transaction, and a
//! transfer between delegators fires one too. Logs are therefore grouped by transaction: a group
//! holding any `DelegateChanged` yields only relationship events (the weight logs only supply the
//! moved balance), otherwise each transfer touching a delegator yields a balance event and the
//! weight logs are dropped as redundant.

use std::collections::HashMap;

use alloy::{
    primitives::{Address, B256, U256},
    rpc::types::Log,
};

use crate::{
    contracts::IVotesToken,
    events::{BalanceChange, DelegationEvent, OrderedEvent},
};

/// Logs fetched for one block range.
#[derive(Debug, Clone, Default)]
pub struct ChunkLogs {
    pub delegate_changes: Vec<Log>,
    pub vote_changes: Vec<Log>,
    pub transfers: Vec<Log>,
}

impl ChunkLogs {
    pub fn len(&self) -> usize {
        self.delegate_changes.len() + self.vote_changes.len() + self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassifyStats {
    /// Relationship events emitted.
    pub relationship: u64,
    /// Balance events emitted.
    pub balance: u64,
    /// Weight or transfer logs dropped because another log in the transaction covers them.
    pub suppressed: u64,
    /// Weight logs with no transfer or delegation to attribute them to.
    pub unattributed: u64,
    /// Delegations that stay with the same delegate.
    pub noop: u64,
    /// Logs missing position data or failing to decode.
    pub malformed: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Classification {
    pub events: Vec<OrderedEvent>,
    pub stats: ClassifyStats,
}

#[derive(Debug, Clone, Copy)]
struct Position {
    block_number: u64,
    log_index: u64,
    transaction_hash: B256,
    block_timestamp: Option<u64>,
}

fn position(log: &Log) -> Option<Position> {
    Some(Position {
        block_number: log.block_number?,
        log_index: log.log_index?,
        transaction_hash: log.transaction_hash?,
        block_timestamp: log.block_timestamp,
    })
}

struct DelegateChange {
    pos: Position,
    delegator: Address,
    from_delegate: Address,
    to_delegate: Address,
}

struct VoteChange {
    pos: Position,
    previous: U256,
    new: U256,
}

struct TokenTransfer {
    pos: Position,
    from: Address,
    to: Address,
    value: U256,
}

#[derive(Default)]
struct TxGroup {
    delegate_changes: Vec<DelegateChange>,
    vote_changes: Vec<VoteChange>,
    transfers: Vec<TokenTransfer>,
}

/// Classify one chunk of logs for the tracked `delegate`.
pub fn classify(delegate: Address, logs: &ChunkLogs) -> Classification {
    let mut stats = ClassifyStats::default();
    let mut groups: HashMap<B256, TxGroup> = HashMap::new();

    for log in &logs.delegate_changes {
        let (Some(pos), Ok(decoded)) =
            (position(log), log.log_decode::<IVotesToken::DelegateChanged>())
        else {
            tracing::warn!("Skipping malformed DelegateChanged log: {:?}", log.transaction_hash);
            stats.malformed += 1;
            continue;
        };
        let data = decoded.inner.data;
        let group = groups.entry(pos.transaction_hash).or_default();
        // Several filters can return the same delegation.
        if group.delegate_changes.iter().any(|c| c.pos.log_index == pos.log_index) {
            continue;
        }
        group.delegate_changes.push(DelegateChange {
            pos,
            delegator: data.delegator,
            from_delegate: data.fromDelegate,
            to_delegate: data.toDelegate,
        });
    }

    for log in &logs.vote_changes {
        let (Some(pos), Ok(decoded)) =
            (position(log), log.log_decode::<IVotesToken::DelegateVotesChanged>())
        else {
            tracing::warn!(
                "Skipping malformed DelegateVotesChanged log: {:?}",
                log.transaction_hash
            );
            stats.malformed += 1;
            continue;
        };
        let data = decoded.inner.data;
        if data.delegate != delegate {
            continue;
        }
        groups.entry(pos.transaction_hash).or_default().vote_changes.push(VoteChange {
            pos,
            previous: data.previousVotes,
            new: data.newVotes,
        });
    }

    for log in &logs.transfers {
        let (Some(pos), Ok(decoded)) =
            (position(log), log.log_decode::<IVotesToken::Transfer>())
        else {
            tracing::warn!("Skipping malformed Transfer log: {:?}", log.transaction_hash);
            stats.malformed += 1;
            continue;
        };
        let data = decoded.inner.data;
        let group = groups.entry(pos.transaction_hash).or_default();
        // The same transfer arrives twice when both sides are delegators.
        if group.transfers.iter().any(|t| t.pos.log_index == pos.log_index) {
            continue;
        }
        group.transfers.push(TokenTransfer { pos, from: data.from, to: data.to, value: data.value });
    }

    let mut events = Vec::new();
    for group in groups.into_values() {
        if group.delegate_changes.is_empty() {
            classify_balance_group(group, &mut events, &mut stats);
        } else {
            classify_relationship_group(delegate, group, &mut events, &mut stats);
        }
    }

    events.sort_by_key(OrderedEvent::sort_key);
    Classification { events, stats }
}

fn classify_relationship_group(
    delegate: Address,
    mut group: TxGroup,
    events: &mut Vec<OrderedEvent>,
    stats: &mut ClassifyStats,
) {
    group.delegate_changes.sort_by_key(|c| c.pos.log_index);
    group.vote_changes.sort_by_key(|v| v.pos.log_index);
    let mut consumed = vec![false; group.vote_changes.len()];

    for (i, change) in group.delegate_changes.iter().enumerate() {
        if change.from_delegate == change.to_delegate {
            stats.noop += 1;
            continue;
        }

        let involves_delegate = change.to_delegate == delegate || change.from_delegate == delegate;
        let mut moved = U256::ZERO;
        if involves_delegate {
            // The weight log for this delegation sits between it and the next delegation.
            let upper = group.delegate_changes.get(i + 1).map_or(u64::MAX, |n| n.pos.log_index);
            let paired = group.vote_changes.iter().enumerate().position(|(j, v)| {
                !consumed[j] && v.pos.log_index > change.pos.log_index && v.pos.log_index < upper
            });
            if let Some(j) = paired {
                consumed[j] = true;
                let vote = &group.vote_changes[j];
                moved = vote.new.abs_diff(vote.previous);
            }
        }

        let (previous_balance, new_balance) =
            if change.to_delegate == delegate { (U256::ZERO, moved) } else { (moved, U256::ZERO) };

        stats.relationship += 1;
        events.push(OrderedEvent {
            block_number: change.pos.block_number,
            log_index: change.pos.log_index,
            transaction_hash: change.pos.transaction_hash,
            block_timestamp: change.pos.block_timestamp,
            event: DelegationEvent::DelegateChanged {
                delegator: change.delegator,
                from_delegate: change.from_delegate,
                to_delegate: change.to_delegate,
                previous_balance,
                new_balance,
            },
        });
    }

    stats.suppressed += consumed.iter().filter(|c| !**c).count() as u64;
    stats.suppressed += group.transfers.len() as u64;
}

fn classify_balance_group(
    group: TxGroup,
    events: &mut Vec<OrderedEvent>,
    stats: &mut ClassifyStats,
) {
    if group.transfers.is_empty() {
        if !group.vote_changes.is_empty() {
            tracing::debug!(
                "{} vote weight change(s) in tx {} without an attributable transfer",
                group.vote_changes.len(),
                group.vote_changes[0].pos.transaction_hash
            );
        }
        stats.unattributed += group.vote_changes.len() as u64;
        return;
    }
    stats.suppressed += group.vote_changes.len() as u64;

    for transfer in &group.transfers {
        if transfer.from == transfer.to || transfer.value.is_zero() {
            continue;
        }
        let sides = [
            (transfer.from, BalanceChange::Decreased(transfer.value)),
            (transfer.to, BalanceChange::Increased(transfer.value)),
        ];
        for (delegator, change) in sides {
            if delegator == Address::ZERO {
                continue;
            }
            stats.balance += 1;
            events.push(OrderedEvent {
                block_number: transfer.pos.block_number,
                log_index: transfer.pos.log_index,
                transaction_hash: transfer.pos.transaction_hash,
                block_timestamp: transfer.pos.block_timestamp,
                event: DelegationEvent::BalanceChanged { delegator, change },
            });
        }
    }
}

#[cfg(test)]
pub(crate) mod test_logs {
    //! Log builders shared by the unit tests.

    use alloy::{
        primitives::{Address, B256, U256},
        rpc::types::Log,
        sol_types::SolEvent,
    };

    use crate::contracts::IVotesToken;

    pub const TOKEN: Address = Address::repeat_byte(0x70);

    pub fn tx(n: u64) -> B256 {
        B256::left_padding_from(&n.to_be_bytes())
    }

    fn wrap(event: &impl SolEvent, block: u64, tx_hash: B256, log_index: u64) -> Log {
        Log {
            inner: alloy::primitives::Log { address: TOKEN, data: event.encode_log_data() },
            block_number: Some(block),
            block_timestamp: Some(1_000 + block),
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
        let event =
            IVotesToken::DelegateChanged { delegator, fromDelegate: from, toDelegate: to };
        wrap(&event, block, tx_hash, log_index)
    }

    pub fn votes_changed(
        delegate: Address,
        previous: u64,
        new: u64,
        block: u64,
        tx_hash: B256,
        log_index: u64,
    ) -> Log {
        let event = IVotesToken::DelegateVotesChanged {
            delegate,
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
}
