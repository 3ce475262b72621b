//! Durable counter store on an embedded SQLite database
//!
//! The increment is a single `INSERT .. ON CONFLICT DO UPDATE .. WHERE ..
//! RETURNING` statement, so the compare and the write can never be split by
//! another writer. It runs inside an immediate transaction whose commit goes
//! through a [`CommitGate`], so a call the ledger has given up on never lands.

use super::{ClientId, CounterStore, Deadline, Increment, QuotaResult};
use crate::error::QuotaError;
use async_trait::async_trait;
use rusqlite::{OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;
use tracing::{debug, warn};

pub const DEFAULT_MAX_RETRIES: usize = 3;

/// Busy wait for calls without a deadline. Bounded calls wait at most until
/// their deadline.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const USAGE_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS usage_records (
    client_id TEXT PRIMARY KEY NOT NULL,
    used_count INTEGER NOT NULL DEFAULT 0,
    updated_at_ms INTEGER NOT NULL
);";

#[derive(Debug, Error)]
pub(crate) enum SqliteStoreError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt counter value for {key}: {value:?}")]
    CorruptValue { key: String, value: String },
    #[error("store call timed out before its deadline")]
    DeadlineExceeded,
}

impl SqliteStoreError {
    /// Busy and locked failures mean nothing was committed, so a retry
    /// cannot double count.
    fn is_transient(&self) -> bool {
        match self {
            SqliteStoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

impl From<SqliteStoreError> for QuotaError {
    fn from(err: SqliteStoreError) -> Self {
        QuotaError::store_unavailable(err.to_string())
    }
}

const GATE_OPEN: u8 = 0;
const GATE_COMMITTING: u8 = 1;
const GATE_ABANDONED: u8 = 2;

/// Decides, once per attempt, whether the worker may commit.
///
/// The worker and the task awaiting it race to move the gate out of
/// `GATE_OPEN`: the worker by starting its commit, the waiter by abandoning
/// the call at the deadline. Only one of them can win.
#[derive(Clone, Debug, Default)]
pub(super) struct CommitGate(Arc<AtomicU8>);

impl CommitGate {
    /// Commit `tx` unless the caller has already abandoned this call.
    /// An abandoned transaction is dropped, which rolls it back.
    pub(super) fn commit(&self, tx: rusqlite::Transaction<'_>) -> Result<(), SqliteStoreError> {
        self.0
            .compare_exchange(GATE_OPEN, GATE_COMMITTING, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| SqliteStoreError::DeadlineExceeded)?;
        tx.commit()?;
        Ok(())
    }

    fn abandon(&self) -> bool {
        self.0
            .compare_exchange(GATE_OPEN, GATE_ABANDONED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Location, schema and retry policy shared by the SQLite-backed stores.
#[derive(Clone, Debug)]
pub(super) struct Database {
    path: PathBuf,
    schema: &'static str,
    schema_ready: Arc<AtomicBool>,
    max_retries: usize,
}

impl Database {
    pub(super) fn new(path: PathBuf, schema: &'static str) -> Self {
        Self {
            path,
            schema,
            schema_ready: Arc::new(AtomicBool::new(false)),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub(super) fn set_max_retries(&mut self, max_retries: usize) {
        self.max_retries = max_retries;
    }

    pub(super) fn path(&self) -> &Path {
        &self.path
    }

    pub(super) async fn init(&self) -> QuotaResult<()> {
        self.run(Deadline::unbounded(), |_, _| Ok(())).await
    }

    /// Run `op` on a fresh connection off the async runtime, retrying busy
    /// and locked failures with exponential backoff until `deadline`.
    ///
    /// Writes must commit through the supplied [`CommitGate`]; once this
    /// call returns an error, no attempt can commit afterwards.
    pub(super) async fn run<T, F>(&self, deadline: Deadline, op: F) -> QuotaResult<T>
    where
        T: Send + 'static,
        F: Fn(&mut rusqlite::Connection, &CommitGate) -> Result<T, SqliteStoreError>
            + Send
            + Sync
            + 'static,
    {
        let op = Arc::new(op);
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(10)
            .max_delay(Duration::from_millis(250))
            .take(self.max_retries);

        let attempt = || {
            let db = self.clone();
            let op = Arc::clone(&op);
            async move {
                if deadline.has_passed() {
                    return Err(SqliteStoreError::DeadlineExceeded);
                }

                let gate = CommitGate::default();
                let worker_gate = gate.clone();
                let busy_timeout = deadline
                    .remaining()
                    .map_or(BUSY_TIMEOUT, |left| left.min(BUSY_TIMEOUT));

                let mut worker = tokio::task::spawn_blocking(
                    move || -> Result<T, SqliteStoreError> {
                        let mut conn = open_connection(&db.path, busy_timeout)?;
                        db.ensure_schema(&conn)?;
                        op(&mut conn, &worker_gate)
                    },
                );

                let joined = match deadline.instant() {
                    None => worker.await,
                    Some(at) => match tokio::time::timeout_at(at, &mut worker).await {
                        Ok(joined) => joined,
                        Err(_) => {
                            if gate.abandon() {
                                debug!("Abandoned store call at its deadline");
                                return Err(SqliteStoreError::DeadlineExceeded);
                            }
                            // The worker is already committing; its result stands.
                            worker.await
                        }
                    },
                };
                joined.unwrap_or_else(|join_err| Err(SqliteStoreError::Join(join_err)))
            }
        };

        let should_retry = |err: &SqliteStoreError| {
            let transient = err.is_transient();
            if transient {
                warn!("Usage store contended, retrying: {}", err);
            }
            transient
        };

        RetryIf::spawn(strategy, attempt, should_retry)
            .await
            .map_err(QuotaError::from)
    }

    fn ensure_schema(&self, conn: &rusqlite::Connection) -> Result<(), SqliteStoreError> {
        if self.schema_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        // WAL is a property of the database file, so it only needs setting once.
        let _ = conn.execute_batch("PRAGMA journal_mode = WAL;");
        conn.execute_batch(self.schema)?;
        self.schema_ready.store(true, Ordering::Release);
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct SqliteCounterStore {
    db: Database,
}

impl SqliteCounterStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            db: Database::new(path.into(), USAGE_SCHEMA),
        }
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.db.set_max_retries(max_retries);
        self
    }

    pub fn path(&self) -> &Path {
        self.db.path()
    }

    /// Create the schema up front so later calls skip it.
    pub async fn init(&self) -> QuotaResult<()> {
        self.db.init().await
    }
}

#[async_trait]
impl CounterStore for SqliteCounterStore {
    async fn load(&self, client: &ClientId, deadline: Deadline) -> QuotaResult<u64> {
        let client_id = client.as_str().to_string();
        self.db
            .run(deadline, move |conn, _| load_used_count(conn, &client_id))
            .await
    }

    async fn store_increment(
        &self,
        client: &ClientId,
        limit: u64,
        deadline: Deadline,
    ) -> QuotaResult<Increment> {
        let client_id = client.as_str().to_string();
        self.db
            .run(deadline, move |conn, gate| {
                if limit == 0 {
                    return Ok(Increment::AtLimit(load_used_count(conn, &client_id)?));
                }

                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let updated: Option<i64> = tx
                    .query_row(
                        "INSERT INTO usage_records (client_id, used_count, updated_at_ms)
                         VALUES (?1, 1, ?3)
                         ON CONFLICT(client_id) DO UPDATE
                            SET used_count = used_count + 1,
                                updated_at_ms = excluded.updated_at_ms
                            WHERE used_count < ?2
                         RETURNING used_count",
                        rusqlite::params![client_id, u64_to_i64(limit), now_millis()],
                        |row| row.get(0),
                    )
                    .optional()?;

                match updated {
                    Some(used) => {
                        gate.commit(tx)?;
                        Ok(Increment::Applied(i64_to_u64(used)))
                    }
                    None => Ok(Increment::AtLimit(load_used_count(&tx, &client_id)?)),
                }
            })
            .await
    }
}

fn load_used_count(
    conn: &rusqlite::Connection,
    client_id: &str,
) -> Result<u64, SqliteStoreError> {
    let used: Option<i64> = conn
        .query_row(
            "SELECT used_count FROM usage_records WHERE client_id = ?1",
            rusqlite::params![client_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(used.map(i64_to_u64).unwrap_or(0))
}

fn open_connection(
    path: &Path,
    busy_timeout: Duration,
) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
    Ok(conn)
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn u64_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(super) fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 {
        0
    } else {
        value as u64
    }
}
