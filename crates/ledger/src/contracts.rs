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

//! Bindings for the ERC20Votes surface the ledger reads.

use alloy::{primitives::B256, sol, sol_types::SolEvent};

sol! {
    #[sol(rpc)]
    interface IVotesToken {
        event DelegateChanged(address indexed delegator, address indexed fromDelegate, address indexed toDelegate);
        event DelegateVotesChanged(address indexed delegate, uint256 previousVotes, uint256 newVotes);
        event Transfer(address indexed from, address indexed to, uint256 value);

        function balanceOf(address account) external view returns (uint256);
        function delegates(address account) external view returns (address);
    }
}

/// Topic0 of `DelegateChanged`.
pub const DELEGATE_CHANGED_SIGNATURE: B256 = IVotesToken::DelegateChanged::SIGNATURE_HASH;
/// Topic0 of `DelegateVotesChanged`.
pub const DELEGATE_VOTES_CHANGED_SIGNATURE: B256 =
    IVotesToken::DelegateVotesChanged::SIGNATURE_HASH;
/// Topic0 of `Transfer`.
pub const TRANSFER_SIGNATURE: B256 = IVotesToken::Transfer::SIGNATURE_HASH;
