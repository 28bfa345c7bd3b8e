//! Fixed-size connection pool with no session affinity.
//!
//! Leases hand out whichever connection is free; a caller never gets the
//! same connection twice on purpose. Nothing authority-related may ever
//! live on a connection, and the pool is the structural enforcement of
//! that: context travels with the transaction wrapper, not the lease.
//!
//! Lease waits are bounded. A saturated pool fails the caller with
//! [`StoreError::PoolExhausted`] instead of queueing without limit.

use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use rusqlite::Connection;

use crate::store::StoreError;

/// Default bound on how long a caller waits for a free connection.
pub const DEFAULT_LEASE_WAIT: Duration = Duration::from_secs(5);

/// Fixed set of open connections handed out one lease at a time.
#[derive(Debug)]
pub struct ConnectionPool {
    idle: Mutex<Vec<Connection>>,
    returned: Condvar,
    max_wait: Duration,
}

impl ConnectionPool {
    /// Builds a pool over pre-opened, pre-initialized connections.
    #[must_use]
    pub fn new(connections: Vec<Connection>, max_wait: Duration) -> Self {
        Self {
            idle: Mutex::new(connections),
            returned: Condvar::new(),
            max_wait,
        }
    }

    /// Leases a connection, waiting up to the configured bound for one
    /// to come back.
    ///
    /// # Errors
    ///
    /// [`StoreError::PoolExhausted`] if no connection frees up in time.
    pub fn lease(&self) -> Result<PooledConnection<'_>, StoreError> {
        let started = Instant::now();
        let deadline = started + self.max_wait;

        let mut idle = self
            .idle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        loop {
            if let Some(conn) = idle.pop() {
                return Ok(PooledConnection {
                    pool: self,
                    conn: Some(conn),
                });
            }
            let now = Instant::now();
            if now >= deadline {
                let waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                return Err(StoreError::PoolExhausted { waited_ms });
            }
            let (guard, _timed_out) = self
                .returned
                .wait_timeout(idle, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            idle = guard;
        }
    }

    /// Number of currently idle connections. Exposed for metrics.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.idle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    fn give_back(&self, conn: Connection) {
        let mut idle = self
            .idle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        idle.push(conn);
        self.returned.notify_one();
    }
}

/// An exclusive lease on one pooled connection; returned on drop.
#[must_use = "dropping the lease returns the connection to the pool"]
#[derive(Debug)]
pub struct PooledConnection<'pool> {
    pool: &'pool ConnectionPool,
    conn: Option<Connection>,
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // The option is only emptied in drop.
        self.conn.as_ref().unwrap()
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().unwrap()
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.give_back(conn);
        }
    }
}
