//! In-process counter store.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::backend::CounterStore;
use super::counter::{CounterEntry, CounterHit};
use crate::error::Result;

/// Per-instance fixed-window counters.
///
/// State lives only in this process and is lost on restart. Increments for
/// one key are serialized by the map's entry lock.
#[derive(Debug, Default)]
pub struct LocalCounterStore {
    entries: DashMap<String, CounterEntry>,
}

impl LocalCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request synchronously.
    pub fn hit(&self, key: &str, window: Duration) -> CounterHit {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| CounterEntry::new(now, window));

        let hit = entry.hit(now, window);
        trace!(key = %key, count = hit.count, "Counted request");
        hit
    }

    /// Get the current count for a key, if it has one.
    pub fn count(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        self.entries
            .get(key)
            .map(|e| if e.is_expired(now) { 0 } else { e.count() })
    }

    /// Drop entries whose window has closed.
    ///
    /// Returns the number of entries removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "Purged expired counters");
        }
        removed
    }

    /// Get the number of tracked keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clear all counters.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[async_trait]
impl CounterStore for LocalCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<CounterHit> {
        Ok(self.hit(key, window))
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
