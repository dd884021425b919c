//! In-process counter store.
//!
//! Suitable for tests and single-node deployments. Counters live in a
//! sharded map; each shard lock makes create-and-increment atomic for
//! callers within this process.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::trace;

use super::{CounterStore, StoreError};

/// A counter together with the instant its window closes.
#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    count: i64,
    expires_at: Instant,
}

impl CounterEntry {
    fn new(window: Duration, now: Instant) -> Self {
        Self {
            count: 0,
            expires_at: now + window,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Counter store backed by a concurrent in-memory map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    counters: DashMap<String, CounterEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `delta` to `key`, creating it with `window` if it is absent or
    /// its previous window has closed.
    fn adjust(&self, key: &str, window: Duration, delta: i64) -> i64 {
        let now = Instant::now();
        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| CounterEntry::new(window, now));

        if entry.is_expired(now) {
            *entry = CounterEntry::new(window, now);
        }

        entry.count += delta;
        trace!(key = %key, count = entry.count, "Adjusted in-memory counter");
        entry.count
    }

    /// Current count for `key`, or `None` if it is absent or expired.
    pub fn count(&self, key: &str) -> Option<i64> {
        let now = Instant::now();
        self.counters
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.count)
    }

    /// Drop every counter whose window has closed.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.counters.retain(|_, entry| !entry.is_expired(now));
    }

    /// Number of stored counters, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment_with_expiry(&self, key: &str, window: Duration) -> Result<i64, StoreError> {
        Ok(self.adjust(key, window, 1))
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let now = Instant::now();
        Ok(self
            .counters
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.expires_at - now))
    }

    async fn decrement(&self, key: &str, window: Duration) -> Result<i64, StoreError> {
        Ok(self.adjust(key, window, -1))
    }
}
