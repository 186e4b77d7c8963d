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

//! Voting-power ledger for a single DAO delegate.
//!
//! The ledger is rebuilt from an ERC20Votes token's `DelegateChanged`, `DelegateVotesChanged` and
//! `Transfer` logs: [sync::SyncDriver] scans them in chunks, [classify] turns them into delegation
//! and balance events, [ledger::LedgerBuilder] folds those into per-block snapshots, and
//! [store::LedgerStore] persists the result. [verify::Verifier] reconciles the stored state with
//! on-chain balances.

pub mod classify;
pub mod config;
pub mod contracts;
pub mod errors;
pub mod events;
pub mod ledger;
pub mod lock;
pub mod service;
pub mod source;
pub mod store;
pub mod sync;
pub mod types;
pub mod verify;

pub use config::{EndBlock, LedgerConfig};
pub use errors::LedgerError;
pub use ledger::LedgerBuilder;
pub use service::{LedgerService, ProgressView, RebuildReport, TruncateOutcome};
pub use source::{LogQuery, LogSource, RetryPolicy, RpcLogSource, SourceError};
pub use store::{FileStore, KeyValueStore, LedgerStore, MemoryStore, StoreError, TtlCache};
pub use sync::{SyncConfig, SyncDriver, SyncOutcome, SyncReport};
pub use verify::{Verifier, VerifyConfig, VerifyOutcome};
