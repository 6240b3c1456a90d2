//! Process-local counter store.
//!
//! Counters live in a sharded map and are only visible to this process, so
//! this store is correct for a single instance only. Deployments with more
//! than one instance must use the Redis store.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, trace};

use super::backend::{CounterHit, CounterStore};
use crate::error::Result;
use crate::ratelimit::{Clock, SystemClock};

#[derive(Debug, Clone, Copy)]
struct Slot {
    count: u64,
    expires_at_ms: u64,
}

/// An in-memory counter store with per-key expiry.
pub struct MemoryStore {
    counters: DashMap<String, Slot>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create a store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store driven by the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            clock,
        }
    }

    /// Current value of a live counter, if any.
    pub fn get(&self, key: &str) -> Option<u64> {
        let now = self.clock.now_millis();
        self.counters
            .get(key)
            .filter(|slot| slot.expires_at_ms > now)
            .map(|slot| slot.count)
    }

    /// Drop every expired counter, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.counters.len();
        self.counters.retain(|_, slot| slot.expires_at_ms > now);
        let removed = before.saturating_sub(self.counters.len());
        if removed > 0 {
            debug!(removed = removed, "Purged expired counters");
        }
        removed
    }

    /// Get the number of stored counters, expired or not.
    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment_and_get(&self, key: &str, window_ms: u64) -> Result<CounterHit> {
        let now = self.clock.now_millis();

        // The entry guard holds the shard lock for the whole read-reset-increment.
        let mut slot = self.counters.entry(key.to_string()).or_insert(Slot {
            count: 0,
            expires_at_ms: now + window_ms,
        });

        if slot.expires_at_ms <= now {
            slot.count = 0;
            slot.expires_at_ms = now + window_ms;
        }
        slot.count += 1;

        let hit = CounterHit {
            count: slot.count,
            ttl_remaining_ms: slot.expires_at_ms - now,
        };

        trace!(key = %key, count = hit.count, ttl_ms = hit.ttl_remaining_ms, "Incremented counter");
        Ok(hit)
    }
}
