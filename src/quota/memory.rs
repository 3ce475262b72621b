//! Process-local counter store
//!
//! Counts live only as long as the process; a restart forgets every client.
//! Use this backend for development or as a degraded fallback, never as the
//! production quota of record.

use super::{ClientId, CounterStore, Deadline, Increment, QuotaResult};
use async_trait::async_trait;
use dashmap::DashMap;

/// In-memory counters keyed by client.
///
/// `DashMap` shards its locks, so clients in different shards never contend
/// and the compare-and-increment for one client happens under its shard's
/// write guard.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counts: DashMap<String, u64>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of clients with a record.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    // Both calls complete without waiting, so the deadline never binds.
    async fn load(&self, client: &ClientId, _deadline: Deadline) -> QuotaResult<u64> {
        Ok(self
            .counts
            .get(client.as_str())
            .map(|entry| *entry.value())
            .unwrap_or(0))
    }

    async fn store_increment(
        &self,
        client: &ClientId,
        limit: u64,
        _deadline: Deadline,
    ) -> QuotaResult<Increment> {
        // Guard is held until the end of this block.
        let mut entry = self.counts.entry(client.as_str().to_string()).or_insert(0);
        let used = entry.value_mut();
        if *used >= limit {
            return Ok(Increment::AtLimit(*used));
        }
        *used += 1;
        Ok(Increment::Applied(*used))
    }
}
