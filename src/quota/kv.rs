//! Counter store layered on a generic key/value table
//!
//! The table only knows how to get and put strings, so there is no native
//! increment to lean on. Each increment runs its load, compare and write
//! inside a `BEGIN IMMEDIATE` transaction.

use super::sqlite::{i64_to_u64, Database, SqliteStoreError};
use super::{ClientId, CounterStore, Deadline, Increment, QuotaResult};
use async_trait::async_trait;
use rusqlite::{OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};

const KV_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS kv_entries (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);";

const KEY_PREFIX: &str = "usage:";

/// Usage counters stored as `usage:<client>` entries in `kv_entries`.
///
/// Contention is database-wide, not per client: `BEGIN IMMEDIATE` takes
/// SQLite's single reserved lock, so increments for different clients queue
/// behind each other for the length of one transaction. Reads do not block
/// under WAL.
#[derive(Clone, Debug)]
pub struct KvCounterStore {
    db: Database,
}

impl KvCounterStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            db: Database::new(path.into(), KV_SCHEMA),
        }
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.db.set_max_retries(max_retries);
        self
    }

    pub fn path(&self) -> &Path {
        self.db.path()
    }

    pub async fn init(&self) -> QuotaResult<()> {
        self.db.init().await
    }
}

fn counter_key(client: &ClientId) -> String {
    format!("{}{}", KEY_PREFIX, client)
}

fn read_count(conn: &rusqlite::Connection, key: &str) -> Result<u64, SqliteStoreError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM kv_entries WHERE key = ?1",
            rusqlite::params![key],
            |row| row.get(0),
        )
        .optional()?;

    match raw {
        None => Ok(0),
        Some(value) => value
            .parse::<i64>()
            .map(i64_to_u64)
            .map_err(|_| SqliteStoreError::CorruptValue {
                key: key.to_string(),
                value,
            }),
    }
}

#[async_trait]
impl CounterStore for KvCounterStore {
    async fn load(&self, client: &ClientId, deadline: Deadline) -> QuotaResult<u64> {
        let key = counter_key(client);
        self.db
            .run(deadline, move |conn, _| read_count(conn, &key))
            .await
    }

    async fn store_increment(
        &self,
        client: &ClientId,
        limit: u64,
        deadline: Deadline,
    ) -> QuotaResult<Increment> {
        let key = counter_key(client);
        self.db
            .run(deadline, move |conn, gate| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let used = read_count(&tx, &key)?;
                if used >= limit {
                    // Dropping the transaction rolls it back.
                    return Ok(Increment::AtLimit(used));
                }

                let next = used + 1;
                tx.execute(
                    "INSERT INTO kv_entries (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    rusqlite::params![key, next.to_string()],
                )?;
                gate.commit(tx)?;

                Ok(Increment::Applied(next))
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QuotaError;

    fn client(raw: &str) -> ClientId {
        ClientId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_kv_store_counts_up_to_limit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = KvCounterStore::new(dir.path().join("kv.sqlite"));
        store.init().await.expect("init");
        let c = client("a");

        assert_eq!(
            store.store_increment(&c, 1, Deadline::unbounded()).await.unwrap(),
            Increment::Applied(1)
        );
        assert_eq!(
            store.store_increment(&c, 1, Deadline::unbounded()).await.unwrap(),
            Increment::AtLimit(1)
        );
        assert_eq!(store.load(&c, Deadline::unbounded()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_kv_store_keys_are_namespaced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("kv.sqlite");
        let store = KvCounterStore::new(&path);
        store
            .store_increment(&client("10.0.0.1"), 5, Deadline::unbounded())
            .await
            .unwrap();

        let conn = rusqlite::Connection::open(&path).unwrap();
        let value: String = conn
            .query_row(
                "SELECT value FROM kv_entries WHERE key = 'usage:10.0.0.1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(value, "1");
    }

    #[tokio::test]
    async fn test_corrupt_value_fails_closed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("kv.sqlite");
        let store = KvCounterStore::new(&path);
        store.init().await.unwrap();

        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute(
            "INSERT INTO kv_entries (key, value) VALUES ('usage:a', 'lots')",
            [],
        )
        .unwrap();
        drop(conn);

        let err = store
            .store_increment(&client("a"), 10, Deadline::unbounded())
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::StoreUnavailable { .. }));
    }
}
