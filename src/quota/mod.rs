//! Free-usage metering for the paid endpoints
//!
//! The [`QuotaLedger`] owns one counter per client and answers two questions:
//! how many free uses are left, and may this client spend one more right now.
//! Persistence sits behind the [`CounterStore`] trait so the ledger behaves the
//! same on every backend.

pub mod kv;
pub mod memory;
pub mod mock;
pub mod sqlite;

pub use kv::KvCounterStore;
pub use memory::MemoryCounterStore;
pub use mock::MockCounterStore;
pub use sqlite::SqliteCounterStore;

use crate::error::QuotaError;
use async_trait::async_trait;
use std::fmt;
use std::num::NonZeroU64;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info};

pub type QuotaResult<T> = std::result::Result<T, QuotaError>;

pub const DEFAULT_FREE_LIMIT: u64 = 10;
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(2000);

const MAX_CLIENT_ID_LEN: usize = 256;

/// Opaque caller identity used as the counter key.
///
/// In the web deployment this is the caller's network address; any stable
/// string works.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(String);

impl ClientId {
    pub fn parse(raw: &str) -> QuotaResult<Self> {
        if raw.trim().is_empty() {
            return Err(QuotaError::invalid_client("client id is empty"));
        }
        if raw.len() > MAX_CLIENT_ID_LEN {
            return Err(QuotaError::invalid_client(format!(
                "client id exceeds {} bytes",
                MAX_CLIENT_ID_LEN
            )));
        }
        if raw.chars().any(char::is_control) {
            return Err(QuotaError::invalid_client(
                "client id contains control characters",
            ));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ClientId {
    type Err = QuotaError;

    fn from_str(s: &str) -> QuotaResult<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of [`QuotaLedger::try_consume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// One use was recorded; `used` is the post-increment count.
    Allowed { used: u64 },
    /// The client has no free uses left. Nothing was recorded.
    Denied,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

/// Point in time by which a store call must have settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self(Some(Instant::now() + timeout))
    }

    /// No bound; used by maintenance calls such as schema setup.
    pub fn unbounded() -> Self {
        Self(None)
    }

    pub fn instant(&self) -> Option<Instant> {
        self.0
    }

    /// Time left before the deadline, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn has_passed(&self) -> bool {
        self.remaining() == Some(Duration::ZERO)
    }
}

pub(crate) fn timed_out() -> QuotaError {
    QuotaError::store_unavailable("store call timed out before its deadline")
}

/// Result of a guarded increment at the storage layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Increment {
    Applied(u64),
    AtLimit(u64),
}

/// Persistence for per-client usage counters.
///
/// `store_increment` must compare against `limit` and increment in one
/// serialized step: two concurrent callers for the same client may never both
/// observe the same count and both succeed.
///
/// Every call carries a [`Deadline`]. A store must resolve by then, and a call
/// that resolves with an error must not have written anything, even later.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Current count for `client`, 0 when the client has never been seen.
    async fn load(&self, client: &ClientId, deadline: Deadline) -> QuotaResult<u64>;

    /// Increment the count unless it is already at or above `limit`.
    async fn store_increment(
        &self,
        client: &ClientId,
        limit: u64,
        deadline: Deadline,
    ) -> QuotaResult<Increment>;
}

pub struct QuotaLedger {
    store: Arc<dyn CounterStore>,
    free_limit: u64,
    store_timeout: Duration,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn CounterStore>, free_limit: NonZeroU64) -> Self {
        Self {
            store,
            free_limit: free_limit.get(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Deadline handed to every storage call; missing it surfaces as
    /// `StoreUnavailable`.
    pub fn with_store_timeout(mut self, store_timeout: Duration) -> Self {
        self.store_timeout = store_timeout;
        self
    }

    pub fn free_limit(&self) -> u64 {
        self.free_limit
    }

    /// Free uses left for `client`. Never writes.
    pub async fn remaining(&self, client: &ClientId) -> QuotaResult<u64> {
        let used = self.store.load(client, self.deadline()).await?;
        Ok(self.free_limit.saturating_sub(used))
    }

    /// Record one use if the client still has free uses left.
    ///
    /// Storage failures are returned as errors, never as `Allowed`.
    pub async fn try_consume(&self, client: &ClientId) -> QuotaResult<Decision> {
        let outcome = self
            .store
            .store_increment(client, self.free_limit, self.deadline())
            .await;

        match outcome {
            Ok(Increment::Applied(used)) => {
                debug!(client = %client, used, limit = self.free_limit, "Recorded free use");
                Ok(Decision::Allowed { used })
            }
            Ok(Increment::AtLimit(used)) => {
                info!(client = %client, used, limit = self.free_limit, "Free quota exhausted");
                Ok(Decision::Denied)
            }
            Err(e) => {
                error!(client = %client, "Failed to record usage: {}", e);
                Err(e)
            }
        }
    }

    /// Whether the chat persona should mock the client for running out.
    pub async fn sass_hint(&self, client: &ClientId) -> QuotaResult<bool> {
        Ok(self.remaining(client).await? == 0)
    }

    fn deadline(&self) -> Deadline {
        Deadline::after(self.store_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn limit(n: u64) -> NonZeroU64 {
        NonZeroU64::new(n).unwrap()
    }

    fn client(raw: &str) -> ClientId {
        ClientId::parse(raw).unwrap()
    }

    fn memory_ledger(free_limit: u64) -> QuotaLedger {
        QuotaLedger::new(Arc::new(MemoryCounterStore::new()), limit(free_limit))
    }

    #[test]
    fn test_client_id_rejects_empty_and_blank() {
        assert!(matches!(
            ClientId::parse(""),
            Err(QuotaError::InvalidClient { .. })
        ));
        assert!(matches!(
            ClientId::parse("   "),
            Err(QuotaError::InvalidClient { .. })
        ));
    }

    #[test]
    fn test_client_id_rejects_control_chars_and_oversize() {
        assert!(ClientId::parse("10.0.0.1\n").is_err());
        assert!(ClientId::parse(&"a".repeat(MAX_CLIENT_ID_LEN + 1)).is_err());
        assert!(ClientId::parse(&"a".repeat(MAX_CLIENT_ID_LEN)).is_ok());
    }

    #[test]
    fn test_client_id_accepts_addresses() {
        assert_eq!(client("203.0.113.7").as_str(), "203.0.113.7");
        assert_eq!("::1".parse::<ClientId>().unwrap().to_string(), "::1");
    }

    #[tokio::test]
    async fn test_ten_sequential_uses_then_denied() {
        let ledger = memory_ledger(10);
        let c = client("198.51.100.1");

        assert_eq!(ledger.remaining(&c).await.unwrap(), 10);

        for expected in 1..=10 {
            assert_eq!(
                ledger.try_consume(&c).await.unwrap(),
                Decision::Allowed { used: expected }
            );
        }

        assert_eq!(ledger.remaining(&c).await.unwrap(), 0);
        assert_eq!(ledger.try_consume(&c).await.unwrap(), Decision::Denied);
    }

    #[tokio::test]
    async fn test_denial_is_sticky_and_does_not_count() {
        let store = Arc::new(MemoryCounterStore::new());
        let ledger = QuotaLedger::new(store.clone(), limit(2));
        let c = client("a");

        ledger.try_consume(&c).await.unwrap();
        ledger.try_consume(&c).await.unwrap();

        for _ in 0..5 {
            assert_eq!(ledger.try_consume(&c).await.unwrap(), Decision::Denied);
        }
        assert_eq!(store.load(&c, Deadline::unbounded()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_clients_do_not_affect_each_other() {
        let ledger = memory_ledger(3);
        let a = client("a");
        let b = client("b");

        for _ in 0..3 {
            ledger.try_consume(&a).await.unwrap();
        }

        assert_eq!(ledger.try_consume(&a).await.unwrap(), Decision::Denied);
        assert_eq!(ledger.remaining(&b).await.unwrap(), 3);
        assert_eq!(
            ledger.try_consume(&b).await.unwrap(),
            Decision::Allowed { used: 1 }
        );
    }

    #[tokio::test]
    async fn test_sass_hint_tracks_exhaustion() {
        let ledger = memory_ledger(1);
        let c = client("a");

        assert!(!ledger.sass_hint(&c).await.unwrap());
        ledger.try_consume(&c).await.unwrap();
        assert!(ledger.sass_hint(&c).await.unwrap());
    }

    #[tokio::test]
    async fn test_write_failure_fails_closed() {
        let store = MockCounterStore::new();
        let ledger = QuotaLedger::new(Arc::new(store.clone()), limit(5));
        let c = client("a");

        ledger.try_consume(&c).await.unwrap();
        store.set_write_failure(true);

        let err = ledger.try_consume(&c).await.unwrap_err();
        assert!(matches!(err, QuotaError::StoreUnavailable { .. }));

        store.set_write_failure(false);
        assert_eq!(ledger.remaining(&c).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_read_failure_propagates() {
        let store = MockCounterStore::new().with_failure(true);
        let ledger = QuotaLedger::new(Arc::new(store), limit(5));

        assert!(ledger.remaining(&client("a")).await.is_err());
        assert!(ledger.sass_hint(&client("a")).await.is_err());
    }

    #[tokio::test]
    async fn test_slow_store_times_out_as_unavailable() {
        let store = MockCounterStore::new().with_delay(Duration::from_secs(5));
        let ledger = QuotaLedger::new(Arc::new(store), limit(5))
            .with_store_timeout(Duration::from_millis(20));

        let err = ledger.try_consume(&client("a")).await.unwrap_err();
        match err {
            QuotaError::StoreUnavailable { reason } => assert!(reason.contains("timed out")),
            other => panic!("Expected StoreUnavailable, got: {:?}", other),
        }
    }

    #[test]
    fn test_deadline_remaining() {
        assert_eq!(Deadline::unbounded().remaining(), None);
        assert!(!Deadline::unbounded().has_passed());

        let soon = Deadline::after(Duration::from_secs(60));
        assert!(soon.remaining().unwrap() > Duration::from_secs(59));
        assert!(!soon.has_passed());
    }

    #[tokio::test]
    async fn test_deadline_passes() {
        let deadline = Deadline::after(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(11)).await;
        assert!(deadline.has_passed());
        assert_eq!(deadline.remaining(), Some(Duration::ZERO));
    }
}
