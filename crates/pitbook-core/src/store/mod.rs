//! SQLite-backed store: schema, pooled access, and the transaction
//! wrapper that carries authority context.
//!
//! Every operation in this crate runs inside a [`StoreTxn`]. The wrapper
//! owns both the SQLite transaction and the [`ContextCell`] holding the
//! transaction's authority context, so the context's lifetime is bounded
//! by the transaction's by construction. When the transaction commits or
//! rolls back, the context is gone; the next transaction starts with an
//! empty cell no matter which pooled connection serves it.
//!
//! # Tables
//!
//! Owned and written here:
//!
//! | table              | contents                                    |
//! |--------------------|---------------------------------------------|
//! | `staff_identities` | staff identity records (append + flip flags)|
//! | `player_balances`  | one running balance row per player          |
//! | `point_ledger`     | append-only point movements                  |
//!
//! Read-only inputs seeded by the surrounding platform:
//!
//! | table             | contents                              |
//! |-------------------|---------------------------------------|
//! | `tenant_settings` | per-tenant gaming-day start offset    |
//! | `tier_policies`   | tier ladder thresholds                |
//! | `rating_sessions` | closed play sessions awaiting accrual |
//!
//! The partial unique index on `point_ledger.idempotency_key` is the
//! authoritative replay guarantee: the application-level probe is only a
//! fast path, and a concurrent duplicate insert is rejected by SQLite
//! before any data commits.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, OpenFlags, TransactionBehavior};
use thiserror::Error;

use crate::context::{AuthorityContext, ContextCell, GuardError};

pub mod lock_table;
pub mod pool;

pub use lock_table::{LockError, PlayerLockGuard, PlayerLockTable, DEFAULT_LOCK_WAIT};
pub use pool::{ConnectionPool, PooledConnection, DEFAULT_LEASE_WAIT};

/// Default number of pooled connections.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// How long SQLite itself retries on write contention before surfacing
/// a busy error. Keep in sync with the `busy_timeout` pragma in
/// [`SCHEMA`].
pub const BUSY_TIMEOUT_MS: u64 = 5000;

/// Schema and per-connection pragmas. Identical batch for every
/// connection; the DDL is idempotent.
const SCHEMA: &str = r"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;

-- Staff identity records. Rows are deactivated, never deleted, so the
-- ledger's staff references stay resolvable.
CREATE TABLE IF NOT EXISTS staff_identities (
    staff_id TEXT PRIMARY KEY,
    tenant_id TEXT,
    role TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    auth_subject TEXT UNIQUE,
    created_at_ns INTEGER NOT NULL,
    updated_at_ns INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_staff_identities_tenant
    ON staff_identities(tenant_id);

-- One running balance row per player. Mutated only by the issuance
-- engine under the per-player lock.
CREATE TABLE IF NOT EXISTS player_balances (
    player_id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    balance INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0),
    lifetime_points INTEGER NOT NULL DEFAULT 0,
    tier TEXT NOT NULL,
    tier_progress INTEGER NOT NULL DEFAULT 0,
    updated_at_ns INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_player_balances_tenant
    ON player_balances(tenant_id);

-- Append-only point movements with before/after snapshots. Never
-- UPDATEd or DELETEd; corrections are new rows.
CREATE TABLE IF NOT EXISTS point_ledger (
    entry_id INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant_id TEXT NOT NULL,
    player_id TEXT NOT NULL,
    delta INTEGER NOT NULL,
    reason TEXT NOT NULL,
    source TEXT NOT NULL,
    staff_id TEXT,
    correlation_id TEXT,
    idempotency_key TEXT,
    balance_before INTEGER NOT NULL,
    balance_after INTEGER NOT NULL,
    tier_before TEXT NOT NULL,
    tier_after TEXT NOT NULL,
    gaming_day TEXT NOT NULL,
    created_at_ns INTEGER NOT NULL
);

-- Authoritative replay guarantee. The application probe is a fast path;
-- this index is what actually prevents a duplicate under races.
CREATE UNIQUE INDEX IF NOT EXISTS idx_point_ledger_idempotency
    ON point_ledger(idempotency_key) WHERE idempotency_key IS NOT NULL;

CREATE INDEX IF NOT EXISTS idx_point_ledger_player
    ON point_ledger(tenant_id, player_id, created_at_ns);

-- Read-only inputs below. Seeded by the surrounding platform; this
-- crate only SELECTs from them.
CREATE TABLE IF NOT EXISTS tenant_settings (
    tenant_id TEXT PRIMARY KEY,
    day_start_minutes INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS tier_policies (
    tenant_id TEXT NOT NULL,
    tier TEXT NOT NULL,
    min_lifetime_points INTEGER NOT NULL,
    PRIMARY KEY (tenant_id, tier)
);

CREATE TABLE IF NOT EXISTS rating_sessions (
    session_id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    player_id TEXT NOT NULL,
    earned_points INTEGER NOT NULL,
    closed_at_ns INTEGER
);

CREATE INDEX IF NOT EXISTS idx_rating_sessions_closed
    ON rating_sessions(tenant_id, closed_at_ns);
";

/// Errors from opening or using the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database file could not be opened.
    #[error("failed to open database at {path}: {source}")]
    Open {
        /// Path that failed to open.
        path: String,
        /// Underlying driver error.
        source: rusqlite::Error,
    },

    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error while preparing the database location.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No pooled connection freed up within the lease wait bound.
    #[error("connection pool exhausted after {waited_ms}ms")]
    PoolExhausted {
        /// How long the caller waited.
        waited_ms: u64,
    },
}

/// Tuning knobs for [`Store::open`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Number of pooled connections.
    pub pool_size: usize,
    /// Bound on waiting for a free connection.
    pub lease_wait: Duration,
    /// Bound on waiting for a per-player lock.
    pub lock_wait: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            lease_wait: DEFAULT_LEASE_WAIT,
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }
}

/// Current time as nanoseconds since the Unix epoch.
#[must_use]
pub fn now_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(0)
}

/// Returns whether a driver error is SQLite-level contention, which
/// callers treat as retryable.
#[must_use]
pub fn is_contention(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == rusqlite::ErrorCode::DatabaseBusy
                || inner.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

/// The shared backing store: connection pool plus the per-player lock
/// table.
#[derive(Debug)]
pub struct Store {
    pool: ConnectionPool,
    locks: PlayerLockTable,
}

impl Store {
    /// Opens (creating if needed) a store at the given path.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Open`] if a connection cannot be opened, or
    /// a database error if schema initialization fails.
    pub fn open(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let target = path.to_string_lossy().into_owned();
        Self::open_target(&target, OpenFlags::default(), options)
    }

    /// Creates a private in-memory store.
    ///
    /// All pooled connections share one in-memory database through a
    /// uniquely named shared-cache URI; the database lives for as long
    /// as the pool keeps its connections open.
    ///
    /// # Errors
    ///
    /// Returns a database error if the store cannot be initialized.
    pub fn in_memory() -> Result<Self, StoreError> {
        let target = format!(
            "file:pitbook-{}?mode=memory&cache=shared",
            uuid::Uuid::new_v4()
        );
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        Self::open_target(&target, flags, StoreOptions::default())
    }

    fn open_target(
        target: &str,
        flags: OpenFlags,
        options: StoreOptions,
    ) -> Result<Self, StoreError> {
        let pool_size = options.pool_size.max(1);
        let mut connections = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            let conn =
                Connection::open_with_flags(target, flags).map_err(|source| StoreError::Open {
                    path: target.to_string(),
                    source,
                })?;
            conn.execute_batch(SCHEMA)?;
            connections.push(conn);
        }
        tracing::debug!(target, pool_size, "opened store");
        Ok(Self {
            pool: ConnectionPool::new(connections, options.lease_wait),
            locks: PlayerLockTable::new(options.lock_wait),
        })
    }

    /// The per-player lock table. Writers acquire their lock here before
    /// opening the write transaction, never while inside one.
    #[must_use]
    pub fn player_locks(&self) -> &PlayerLockTable {
        &self.locks
    }

    /// Number of currently idle pooled connections. Exposed for metrics.
    #[must_use]
    pub fn idle_connections(&self) -> usize {
        self.pool.idle_count()
    }

    /// Runs `f` inside a read transaction on a pooled connection.
    ///
    /// # Errors
    ///
    /// Propagates the closure's error; pool and commit failures convert
    /// through `E: From<StoreError>`.
    pub fn with_read_txn<T, E>(&self, f: impl FnOnce(&StoreTxn<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        self.with_txn(TransactionBehavior::Deferred, f)
    }

    /// Runs `f` inside a write transaction on a pooled connection.
    ///
    /// The transaction begins `IMMEDIATE` so write contention surfaces at
    /// begin time rather than mid-operation.
    ///
    /// # Errors
    ///
    /// Propagates the closure's error; pool and commit failures convert
    /// through `E: From<StoreError>`.
    pub fn with_write_txn<T, E>(
        &self,
        f: impl FnOnce(&StoreTxn<'_>) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        self.with_txn(TransactionBehavior::Immediate, f)
    }

    fn with_txn<T, E>(
        &self,
        behavior: TransactionBehavior,
        f: impl FnOnce(&StoreTxn<'_>) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut leased = self.pool.lease()?;
        let txn = leased
            .transaction_with_behavior(behavior)
            .map_err(StoreError::from)?;
        let store_txn = StoreTxn {
            txn,
            cell: ContextCell::new(),
        };
        // A closure error drops `store_txn`, which rolls back and
        // discards the context with it.
        let out = f(&store_txn)?;
        store_txn.commit()?;
        Ok(out)
    }
}

/// One transaction plus its authority context.
///
/// Rolls back on drop unless [`StoreTxn::commit`] consumed it first.
/// There is no way to move the context out: establishment and every read
/// go through references bounded by the transaction's lifetime.
pub struct StoreTxn<'conn> {
    txn: rusqlite::Transaction<'conn>,
    cell: ContextCell,
}

impl StoreTxn<'_> {
    /// The underlying connection, for running statements.
    #[must_use]
    pub fn raw(&self) -> &Connection {
        &self.txn
    }

    pub(crate) fn context_cell(&self) -> &ContextCell {
        &self.cell
    }

    /// The established context, or [`GuardError::ContextMissing`].
    ///
    /// # Errors
    ///
    /// [`GuardError::ContextMissing`] when no context has been
    /// established for this transaction.
    pub fn context(&self) -> Result<&AuthorityContext, GuardError> {
        self.cell.get().ok_or(GuardError::ContextMissing)
    }

    /// The established context, if any. For logging only; operations use
    /// [`StoreTxn::context`] so absence fails closed.
    #[must_use]
    pub fn current_context(&self) -> Option<&AuthorityContext> {
        self.cell.get()
    }

    fn commit(self) -> Result<(), StoreError> {
        self.txn.commit().map_err(StoreError::from)
    }
}
