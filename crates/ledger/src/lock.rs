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

//! Advisory single-writer lock kept in the store.
//!
//! The `sync-lock` record is the only coordination between runs. A holder identifies itself by
//! `(pid, startedAt)`; a record older than the timeout is treated as abandoned and taken over.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::sync::Mutex;

use crate::{
    store::{LedgerStore, StoreError},
    types::SyncLock,
};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10 * 60);

pub enum LockOutcome {
    Acquired(SyncLockGuard),
    /// Someone else holds a live lock.
    Held(SyncLock),
}

#[derive(Clone)]
pub struct LockManager {
    store: LedgerStore,
    timeout: Duration,
    local: Arc<Mutex<()>>,
}

impl LockManager {
    pub fn new(store: LedgerStore, timeout: Duration) -> Self {
        Self { store, timeout, local: Arc::new(Mutex::new(())) }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_stale(&self, lock: &SyncLock) -> bool {
        let age = Utc::now().signed_duration_since(lock.started_at);
        match chrono::Duration::from_std(self.timeout) {
            Ok(timeout) => age > timeout,
            Err(_) => false,
        }
    }

    /// The live lock record, if any.
    pub async fn current(&self) -> Result<Option<SyncLock>, StoreError> {
        Ok(self
            .store
            .sync_lock()
            .await?
            .filter(|lock| lock.sync_in_progress && !self.is_stale(lock)))
    }

    pub async fn try_acquire(&self) -> Result<LockOutcome, StoreError> {
        let _serial = self.local.lock().await;

        if let Some(existing) = self.store.sync_lock().await? {
            if existing.sync_in_progress && !self.is_stale(&existing) {
                return Ok(LockOutcome::Held(existing));
            }
            tracing::warn!(
                "Reclaiming stale sync lock from pid {} started at {}",
                existing.pid,
                existing.started_at
            );
        }

        let token = SyncLock { sync_in_progress: true, started_at: Utc::now(), pid: std::process::id() };
        self.store.put_sync_lock(&token).await?;

        // Another writer sharing the store may have landed between our write and this read.
        match self.store.sync_lock().await? {
            Some(read) if read == token => {
                tracing::debug!("Acquired sync lock at {}", token.started_at);
                Ok(LockOutcome::Acquired(SyncLockGuard {
                    store: self.store.clone(),
                    token,
                    released: false,
                }))
            }
            Some(other) => Ok(LockOutcome::Held(other)),
            None => Ok(LockOutcome::Held(token)),
        }
    }
}

/// Proof of holding the sync lock. Call [SyncLockGuard::release] when done.
pub struct SyncLockGuard {
    store: LedgerStore,
    token: SyncLock,
    released: bool,
}

impl SyncLockGuard {
    pub fn lock(&self) -> &SyncLock {
        &self.token
    }

    async fn still_held(&self) -> Result<bool, StoreError> {
        Ok(self.store.sync_lock().await?.as_ref() == Some(&self.token))
    }

    /// Refresh `startedAt`. Returns false when the lock was taken over in the meantime.
    pub async fn renew(&mut self) -> Result<bool, StoreError> {
        if !self.still_held().await? {
            return Ok(false);
        }
        let renewed = SyncLock { started_at: Utc::now(), ..self.token.clone() };
        self.store.put_sync_lock(&renewed).await?;
        self.token = renewed;
        Ok(true)
    }

    /// Delete the lock record unless someone else has taken it over.
    pub async fn release(mut self) -> Result<(), StoreError> {
        self.released = true;
        if self.still_held().await? {
            self.store.delete_sync_lock().await?;
            tracing::debug!("Released sync lock");
        } else {
            tracing::warn!("Sync lock was taken over before release");
        }
        Ok(())
    }
}

impl Drop for SyncLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Best effort; otherwise the record goes stale after the timeout.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("Sync lock dropped without release");
            return;
        };
        let store = self.store.clone();
        let token = self.token.clone();
        handle.spawn(async move {
            if let Ok(Some(current)) = store.sync_lock().await {
                if current == token {
                    if let Err(err) = store.delete_sync_lock().await {
                        tracing::warn!("Failed to release dropped sync lock: {err}");
                    }
                }
            }
        });
    }
}
