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

//! Read cache in front of the store.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use moka::{future::Cache, Expiry};

#[derive(Clone)]
struct CachedValue {
    bytes: Arc<Vec<u8>>,
    ttl: Duration,
}

/// Expires every entry after the TTL it was inserted with.
struct PerEntryTtl;

impl Expiry<String, CachedValue> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedValue,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CachedValue,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Bounded byte cache with a TTL per entry. Cloning shares the underlying cache.
#[derive(Clone)]
pub struct TtlCache {
    inner: Cache<String, CachedValue>,
}

impl TtlCache {
    pub fn new(max_capacity: u64) -> Self {
        Self { inner: Cache::builder().max_capacity(max_capacity).expire_after(PerEntryTtl).build() }
    }

    pub async fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        self.inner.get(key).await.map(|v| v.bytes)
    }

    pub async fn set(&self, key: &str, bytes: Arc<Vec<u8>>, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        self.inner.insert(key.to_string(), CachedValue { bytes, ttl }).await;
    }

    pub async fn invalidate(&self, key: &str) {
        self.inner.invalidate(key).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_invalidate() {
        let cache = TtlCache::new(8);
        cache.set("a", Arc::new(vec![1]), Duration::from_secs(60)).await;
        assert_eq!(cache.get("a").await.as_deref(), Some(&vec![1]));

        cache.invalidate("a").await;
        assert!(cache.get("a").await.is_none());
    }

    #[tokio::test]
    async fn test_entry_expires_after_its_ttl() {
        let cache = TtlCache::new(8);
        cache.set("short", Arc::new(vec![1]), Duration::from_millis(20)).await;
        cache.set("long", Arc::new(vec![2]), Duration::from_secs(60)).await;

        std::thread::sleep(Duration::from_millis(50));
        assert!(cache.get("short").await.is_none());
        assert!(cache.get("long").await.is_some());
    }

    #[tokio::test]
    async fn test_zero_ttl_is_not_cached() {
        let cache = TtlCache::new(8);
        cache.set("a", Arc::new(vec![1]), Duration::ZERO).await;
        assert!(cache.get("a").await.is_none());
    }
}
