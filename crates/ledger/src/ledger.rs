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

//! The ledger state transition: a delegator map folded over ordered events, one timeline entry
//! per block that changed it.

use std::collections::HashMap;

use alloy::primitives::{Address, U256};

use crate::{
    events::{BalanceChange, DelegationEvent, OrderedEvent},
    types::{total_voting_power, DelegatorMap, TimelineEntry},
};

/// Running delegator balances for one tracked delegate.
#[derive(Debug, Clone)]
pub struct LedgerBuilder {
    delegate: Address,
    delegators: DelegatorMap,
    /// Consistency violations seen so far (skipped events).
    violations: u64,
}

impl LedgerBuilder {
    /// Cold start with no delegators.
    pub fn new(delegate: Address) -> Self {
        Self::with_state(delegate, DelegatorMap::new())
    }

    /// Resume from a known delegator map.
    pub fn with_state(delegate: Address, delegators: DelegatorMap) -> Self {
        Self { delegate, delegators, violations: 0 }
    }

    /// Rebuild the map implied by a persisted timeline.
    ///
    /// Each entry is a full snapshot, so the last one wins; the fold still walks every entry to
    /// reject a timeline that is not block-ordered.
    pub fn from_timeline(delegate: Address, entries: &[TimelineEntry]) -> Self {
        let mut delegators = DelegatorMap::new();
        let mut last_block = None;
        for entry in entries {
            if last_block.is_some_and(|b| entry.block_number <= b) {
                tracing::warn!(
                    "Timeline entry at block {} is out of order (previous {:?})",
                    entry.block_number,
                    last_block
                );
            }
            last_block = Some(entry.block_number);
            delegators = entry.delegators.clone();
        }
        Self::with_state(delegate, delegators)
    }

    pub fn delegate(&self) -> Address {
        self.delegate
    }

    pub fn delegators(&self) -> &DelegatorMap {
        &self.delegators
    }

    pub fn into_delegators(self) -> DelegatorMap {
        self.delegators
    }

    pub fn total_voting_power(&self) -> U256 {
        total_voting_power(&self.delegators)
    }

    pub fn violations(&self) -> u64 {
        self.violations
    }

    /// Apply one event. Returns whether the map changed.
    pub fn apply(&mut self, event: &DelegationEvent) -> bool {
        match event {
            DelegationEvent::DelegateChanged {
                delegator,
                from_delegate,
                to_delegate,
                previous_balance,
                new_balance,
            } => {
                if *to_delegate == self.delegate {
                    // A zero balance is kept: the address still delegates to us.
                    self.delegators.insert(*delegator, *new_balance) != Some(*new_balance)
                } else if *from_delegate == self.delegate {
                    self.remove_undelegated(*delegator, *previous_balance)
                } else {
                    self.delegators.remove(delegator).is_some()
                }
            }
            DelegationEvent::BalanceChanged { delegator, change } => {
                let Some(balance) = self.delegators.get_mut(delegator) else {
                    return false;
                };
                let updated = match change {
                    BalanceChange::Increased(amount) => balance.saturating_add(*amount),
                    BalanceChange::Decreased(amount) => {
                        if *amount > *balance {
                            tracing::warn!(
                                "Balance of {:#x} would go negative ({} - {}), clamping to zero",
                                delegator,
                                balance,
                                amount
                            );
                            self.violations += 1;
                        }
                        balance.saturating_sub(*amount)
                    }
                };
                let changed = updated != *balance;
                *balance = updated;
                changed
            }
        }
    }

    fn remove_undelegated(&mut self, delegator: Address, previous_balance: U256) -> bool {
        if self.delegators.remove(&delegator).is_some() {
            return true;
        }

        // Fall back to matching on the balance that left. Ambiguous when two delegators hold the
        // same amount; the first in address order is taken.
        let matched = self
            .delegators
            .iter()
            .find(|(_, balance)| **balance == previous_balance)
            .map(|(address, _)| *address);
        match matched {
            Some(address) => {
                tracing::warn!(
                    "Undelegation by untracked {:#x}; removing {:#x} by matching balance {}",
                    delegator,
                    address,
                    previous_balance
                );
                self.delegators.remove(&address);
                true
            }
            None => {
                tracing::warn!(
                    "Undelegation by {:#x} with balance {} matches no tracked delegator, skipping",
                    delegator,
                    previous_balance
                );
                self.violations += 1;
                false
            }
        }
    }

    /// Apply all events of a single block and emit one entry if the map changed.
    ///
    /// Change is judged against the map before the block, so a block whose events cancel out
    /// emits nothing.
    pub fn apply_block<'a>(
        &mut self,
        block_number: u64,
        timestamp: u64,
        events: impl IntoIterator<Item = &'a DelegationEvent>,
    ) -> Option<TimelineEntry> {
        let before = self.delegators.clone();
        for event in events {
            self.apply(event);
        }
        (self.delegators != before)
            .then(|| TimelineEntry::new(block_number, timestamp, self.delegators.clone()))
    }

    /// Apply events sorted by `(block_number, log_index)`, one entry per changed block.
    pub fn apply_all(
        &mut self,
        events: &[OrderedEvent],
        timestamps: &HashMap<u64, u64>,
    ) -> Vec<TimelineEntry> {
        debug_assert!(events.windows(2).all(|w| w[0].sort_key() <= w[1].sort_key()));

        let mut entries = Vec::new();
        for block_events in events.chunk_by(|a, b| a.block_number == b.block_number) {
            let block_number = block_events[0].block_number;
            let timestamp = timestamps
                .get(&block_number)
                .copied()
                .or(block_events[0].block_timestamp)
                .unwrap_or_default();
            if let Some(entry) =
                self.apply_block(block_number, timestamp, block_events.iter().map(|e| &e.event))
            {
                entries.push(entry);
            }
        }
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::B256;
    use proptest::prelude::*;

    const DELEGATE: Address = Address::repeat_byte(0xdd);
    const ALICE: Address = Address::repeat_byte(0xa1);
    const BOB: Address = Address::repeat_byte(0xb0);
    const ELSEWHERE: Address = Address::repeat_byte(0xee);

    fn delegate_to_us(delegator: Address, balance: u64) -> DelegationEvent {
        DelegationEvent::DelegateChanged {
            delegator,
            from_delegate: Address::ZERO,
            to_delegate: DELEGATE,
            previous_balance: U256::ZERO,
            new_balance: U256::from(balance),
        }
    }

    fn delegate_away(delegator: Address, balance: u64) -> DelegationEvent {
        DelegationEvent::DelegateChanged {
            delegator,
            from_delegate: DELEGATE,
            to_delegate: ELSEWHERE,
            previous_balance: U256::from(balance),
            new_balance: U256::ZERO,
        }
    }

    fn decreased(delegator: Address, amount: u64) -> DelegationEvent {
        DelegationEvent::BalanceChanged {
            delegator,
            change: BalanceChange::Decreased(U256::from(amount)),
        }
    }

    fn at(block_number: u64, log_index: u64, event: DelegationEvent) -> OrderedEvent {
        OrderedEvent {
            block_number,
            log_index,
            transaction_hash: B256::ZERO,
            block_timestamp: Some(block_number * 12),
            event,
        }
    }

    #[test]
    fn test_example_scenario() {
        let mut ledger = LedgerBuilder::new(DELEGATE);
        let events = vec![
            at(100, 0, delegate_to_us(ALICE, 1000)),
            at(150, 0, decreased(ALICE, 500)),
            at(200, 0, delegate_away(ALICE, 500)),
        ];
        let entries = ledger.apply_all(&events, &HashMap::new());

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].delegators.get(&ALICE), Some(&U256::from(1000)));
        assert_eq!(entries[0].total_voting_power, U256::from(1000));
        assert_eq!(entries[1].delegators.get(&ALICE), Some(&U256::from(500)));
        assert_eq!(entries[1].total_voting_power, U256::from(500));
        assert!(entries[2].delegators.is_empty());
        assert_eq!(entries[2].total_voting_power, U256::ZERO);
        assert_eq!(entries[2].timestamp, 2400);
    }

    #[test]
    fn test_same_block_events_collapse_to_one_entry() {
        let mut ledger = LedgerBuilder::new(DELEGATE);
        let events = vec![at(5, 0, delegate_to_us(ALICE, 10)), at(5, 1, delegate_to_us(BOB, 20))];
        let entries = ledger.apply_all(&events, &HashMap::new());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].delegators.len(), 2);
        assert_eq!(entries[0].total_voting_power, U256::from(30));
    }

    #[test]
    fn test_cancelling_block_emits_nothing() {
        let mut ledger = LedgerBuilder::new(DELEGATE);
        let events = vec![at(5, 0, delegate_to_us(ALICE, 10)), at(5, 1, delegate_away(ALICE, 10))];
        assert!(ledger.apply_all(&events, &HashMap::new()).is_empty());
    }

    #[test]
    fn test_zero_balance_delegator_is_retained() {
        let mut ledger = LedgerBuilder::new(DELEGATE);
        let entry = ledger.apply_block(1, 0, [&delegate_to_us(ALICE, 0)]).unwrap();
        assert_eq!(entry.delegators.get(&ALICE), Some(&U256::ZERO));
        assert_eq!(entry.total_voting_power, U256::ZERO);
    }

    #[test]
    fn test_balance_change_for_untracked_address_is_ignored() {
        let mut ledger = LedgerBuilder::new(DELEGATE);
        assert!(ledger.apply_block(1, 0, [&decreased(BOB, 5)]).is_none());
    }

    #[test]
    fn test_delegating_elsewhere_removes_known_delegator() {
        let mut ledger = LedgerBuilder::new(DELEGATE);
        ledger.apply(&delegate_to_us(ALICE, 10));
        let moved = DelegationEvent::DelegateChanged {
            delegator: ALICE,
            from_delegate: BOB,
            to_delegate: ELSEWHERE,
            previous_balance: U256::ZERO,
            new_balance: U256::ZERO,
        };
        assert!(ledger.apply(&moved));
        assert!(ledger.delegators().is_empty());
    }

    #[test]
    fn test_undelegation_falls_back_to_balance_match() {
        let mut ledger = LedgerBuilder::new(DELEGATE);
        ledger.apply(&delegate_to_us(ALICE, 10));
        ledger.apply(&delegate_to_us(BOB, 20));
        // Unknown address, but the departing balance identifies Bob.
        assert!(ledger.apply(&delegate_away(ELSEWHERE, 20)));
        assert_eq!(ledger.delegators().keys().copied().collect::<Vec<_>>(), vec![ALICE]);
    }

    #[test]
    fn test_unmatched_undelegation_is_skipped() {
        let mut ledger = LedgerBuilder::new(DELEGATE);
        ledger.apply(&delegate_to_us(ALICE, 10));
        assert!(!ledger.apply(&delegate_away(ELSEWHERE, 99)));
        assert_eq!(ledger.violations(), 1);
        assert_eq!(ledger.delegators().len(), 1);
    }

    #[test]
    fn test_from_timeline_takes_last_snapshot() {
        let mut ledger = LedgerBuilder::new(DELEGATE);
        let events = vec![
            at(1, 0, delegate_to_us(ALICE, 10)),
            at(2, 0, delegate_to_us(BOB, 20)),
            at(3, 0, decreased(ALICE, 4)),
        ];
        let entries = ledger.apply_all(&events, &HashMap::new());
        let rebuilt = LedgerBuilder::from_timeline(DELEGATE, &entries);
        assert_eq!(rebuilt.delegators(), ledger.delegators());
    }

    fn arb_event() -> impl Strategy<Value = DelegationEvent> {
        let who = prop::sample::select(vec![ALICE, BOB, ELSEWHERE]);
        prop_oneof![
            (who.clone(), 0u64..1_000_000).prop_map(|(d, b)| delegate_to_us(d, b)),
            (who.clone(), 0u64..1_000_000).prop_map(|(d, b)| delegate_away(d, b)),
            (who.clone(), 0u64..1_000_000).prop_map(|(d, b)| decreased(d, b)),
            (who, 0u64..1_000_000).prop_map(|(d, b)| DelegationEvent::BalanceChanged {
                delegator: d,
                change: BalanceChange::Increased(U256::from(b)),
            }),
        ]
    }

    fn arb_events() -> impl Strategy<Value = Vec<OrderedEvent>> {
        prop::collection::vec((1u64..20, arb_event()), 0..60).prop_map(|mut raw| {
            raw.sort_by_key(|(block, _)| *block);
            raw.into_iter()
                .enumerate()
                .map(|(i, (block, event))| at(block, i as u64, event))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_replay_is_deterministic(events in arb_events()) {
            let mut first = LedgerBuilder::new(DELEGATE);
            let mut second = LedgerBuilder::new(DELEGATE);
            let a = first.apply_all(&events, &HashMap::new());
            let b = second.apply_all(&events, &HashMap::new());
            prop_assert_eq!(a, b);
            prop_assert_eq!(first.delegators(), second.delegators());
        }

        #[test]
        fn prop_every_entry_conserves_total(events in arb_events()) {
            let mut ledger = LedgerBuilder::new(DELEGATE);
            for entry in ledger.apply_all(&events, &HashMap::new()) {
                let sum = entry.delegators.values().fold(U256::ZERO, |acc, b| acc + *b);
                prop_assert_eq!(entry.total_voting_power, sum);
            }
        }

        #[test]
        fn prop_one_entry_per_block_in_order(events in arb_events()) {
            let mut ledger = LedgerBuilder::new(DELEGATE);
            let entries = ledger.apply_all(&events, &HashMap::new());
            prop_assert!(entries.windows(2).all(|w| w[0].block_number < w[1].block_number));
        }

        #[test]
        fn prop_timeline_replay_reproduces_state(events in arb_events()) {
            let mut ledger = LedgerBuilder::new(DELEGATE);
            let entries = ledger.apply_all(&events, &HashMap::new());
            let rebuilt = LedgerBuilder::from_timeline(DELEGATE, &entries);
            prop_assert_eq!(rebuilt.delegators(), ledger.delegators());
        }
    }
}
