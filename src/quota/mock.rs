use super::{timed_out, ClientId, CounterStore, Deadline, Increment, MemoryCounterStore, QuotaResult};
use crate::error::QuotaError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Counter store double with switchable failures and call counting.
///
/// Clones share state, so a test can keep a probe after handing the store
/// to a ledger.
#[derive(Clone, Default)]
pub struct MockCounterStore {
    inner: Arc<MemoryCounterStore>,
    fail_reads: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
    delay: Arc<Mutex<Option<Duration>>>,
    load_count: Arc<AtomicUsize>,
    increment_count: Arc<AtomicUsize>,
}

impl MockCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure(self, should_fail: bool) -> Self {
        self.fail_reads.store(should_fail, Ordering::SeqCst);
        self.fail_writes.store(should_fail, Ordering::SeqCst);
        self
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn clear_delay(&self) {
        *self.delay.lock().unwrap() = None;
    }

    pub fn set_write_failure(&self, should_fail: bool) {
        self.fail_writes.store(should_fail, Ordering::SeqCst);
    }

    pub fn get_load_count(&self) -> usize {
        self.load_count.load(Ordering::SeqCst)
    }

    pub fn get_increment_count(&self) -> usize {
        self.increment_count.load(Ordering::SeqCst)
    }

    /// Sleep for the configured delay, giving up at `deadline` like a real
    /// store would.
    async fn pause(&self, deadline: Deadline) -> QuotaResult<()> {
        let delay = *self.delay.lock().unwrap();
        let Some(delay) = delay else {
            return Ok(());
        };
        match deadline.remaining() {
            Some(left) if left < delay => {
                tokio::time::sleep(left).await;
                Err(timed_out())
            }
            _ => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl CounterStore for MockCounterStore {
    async fn load(&self, client: &ClientId, deadline: Deadline) -> QuotaResult<u64> {
        self.load_count.fetch_add(1, Ordering::SeqCst);
        self.pause(deadline).await?;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(QuotaError::store_unavailable("mock read failure"));
        }
        self.inner.load(client, deadline).await
    }

    async fn store_increment(
        &self,
        client: &ClientId,
        limit: u64,
        deadline: Deadline,
    ) -> QuotaResult<Increment> {
        self.increment_count.fetch_add(1, Ordering::SeqCst);
        self.pause(deadline).await?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(QuotaError::store_unavailable("mock write failure"));
        }
        self.inner.store_increment(client, limit, deadline).await
    }
}
