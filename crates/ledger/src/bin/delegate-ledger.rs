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

use std::path::PathBuf;

use alloy::primitives::U256;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use delegate_ledger::{
    types::{total_voting_power, VerifyMode},
    LedgerConfig, LedgerService, SyncOutcome, TruncateOutcome, VerifyOutcome,
};
use serde::Serialize;
use serde_json::json;
use url::Url;

/// Arguments of the delegate ledger.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct MainArgs {
    /// Path to the TOML config file.
    #[clap(short, long, env = "LEDGER_CONFIG", default_value = "ledger.toml")]
    config: PathBuf,
    /// Overrides the events RPC endpoint from the config.
    #[clap(long, env)]
    events_rpc_url: Option<Url>,
    /// Overrides the archive RPC endpoint from the config.
    #[clap(long, env)]
    archive_rpc_url: Option<Url>,
    /// Overrides the data directory from the config.
    #[clap(long, env)]
    data_dir: Option<PathBuf>,
    /// Whether to log in JSON format.
    #[clap(long, env, default_value_t = false)]
    log_json: bool,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one sync up to the configured end block.
    Sync,
    /// Show progress of a running sync.
    Progress,
    /// Show the current delegator set.
    State,
    /// List timeline entries in an inclusive block range.
    Timeline {
        #[clap(long)]
        from: Option<u64>,
        #[clap(long)]
        to: Option<u64>,
    },
    /// Remove timeline entries after a block and rewind the ledger to it.
    Truncate {
        #[clap(long)]
        max_block: u64,
    },
    /// Compare stored balances with the chain.
    Verify {
        /// Write corrections back.
        #[clap(long, default_value_t = false)]
        fix: bool,
        /// Ignore differences up to this many wei.
        #[clap(long)]
        threshold: Option<U256>,
    },
    /// Delegators in effect at a block.
    PowerAt {
        #[clap(long)]
        block: u64,
    },
    /// Replay the timeline and compare it with the stored current state.
    Rebuild,
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("Failed to serialize output")?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = MainArgs::parse();

    if args.log_json {
        tracing_subscriber::fmt()
            .with_ansi(false)
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();
    }

    let mut config = LedgerConfig::load(&args.config).await?;
    if let Some(url) = args.events_rpc_url {
        config.events_rpc_url = url;
    }
    if let Some(url) = args.archive_rpc_url {
        config.archive_rpc_url = Some(url);
    }
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }

    let service = LedgerService::from_config(config).context("Failed to build ledger service")?;

    match args.command {
        Command::Sync => match service.start_sync().await? {
            SyncOutcome::Completed(report) => {
                print(&json!({ "status": "completed", "report": report }))
            }
            SyncOutcome::UpToDate { last_synced_block } => {
                print(&json!({ "status": "upToDate", "lastSyncedBlock": last_synced_block }))
            }
            SyncOutcome::AlreadyInProgress(lock) => {
                let pid = lock.pid;
                print(&json!({ "status": "conflict", "lock": lock }))?;
                bail!("Sync already in progress (pid {pid})")
            }
        },
        Command::Progress => print(&service.get_progress().await?),
        Command::State => print(&service.get_current_state().await?),
        Command::Timeline { from, to } => print(&service.get_timeline(from, to).await?),
        Command::Truncate { max_block } => match service.truncate_after(max_block).await? {
            TruncateOutcome::Completed(result) => print(&result),
            TruncateOutcome::AlreadyInProgress(lock) => {
                bail!("Cannot truncate while a sync holds the lock (pid {})", lock.pid)
            }
        },
        Command::Verify { fix, threshold } => {
            let mode = if fix { VerifyMode::Fix } else { VerifyMode::Check };
            match service.verify(mode, threshold).await? {
                VerifyOutcome::Completed(result) => print(&result),
                VerifyOutcome::AlreadyInProgress(lock) => {
                    bail!("Cannot verify while a sync holds the lock (pid {})", lock.pid)
                }
            }
        }
        Command::PowerAt { block } => {
            let delegators = service.delegators_at(block).await?;
            let total = total_voting_power(&delegators);
            let delegators: serde_json::Map<String, serde_json::Value> = delegators
                .iter()
                .map(|(address, balance)| (format!("{address:#x}"), json!(balance.to_string())))
                .collect();
            print(&json!({
                "blockNumber": block,
                "totalVotingPower": total.to_string(),
                "delegators": delegators,
            }))
        }
        Command::Rebuild => print(&service.rebuild_current_state().await?),
    }
}
