//! In-process per-player exclusive locks.
//!
//! The issuance engine serializes writers per `(tenant, player)` key so a
//! balance read-modify-write can never interleave with another writer's.
//! Waits are bounded: a writer that cannot acquire the lock inside the
//! configured window fails with [`LockError::Busy`], which callers
//! surface as a retryable condition rather than blocking indefinitely or
//! silently proceeding on stale state.
//!
//! The table only tracks currently held keys, so its size is bounded by
//! writer concurrency and no cleanup pass is needed.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::identity::TenantId;
use crate::ledger::PlayerId;

/// Default bound on how long a writer waits for a player lock.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(3);

/// Errors from lock acquisition.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock stayed held by another writer for the whole wait window.
    #[error("player {player_id} is busy: lock not acquired within {waited_ms}ms")]
    Busy {
        /// Player whose lock was contended.
        player_id: PlayerId,
        /// How long this caller waited.
        waited_ms: u64,
    },
}

/// Table of currently held per-player locks.
#[derive(Debug)]
pub struct PlayerLockTable {
    held: Mutex<HashSet<(TenantId, PlayerId)>>,
    released: Condvar,
    max_wait: Duration,
}

impl PlayerLockTable {
    /// Creates a table with the given wait bound.
    #[must_use]
    pub fn new(max_wait: Duration) -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
            max_wait,
        }
    }

    /// Acquires the exclusive lock for one player, waiting up to the
    /// configured bound.
    ///
    /// The returned guard releases the lock on drop.
    ///
    /// # Errors
    ///
    /// [`LockError::Busy`] if the lock could not be acquired in time.
    pub fn acquire(
        &self,
        tenant_id: &TenantId,
        player_id: &PlayerId,
    ) -> Result<PlayerLockGuard<'_>, LockError> {
        let key = (tenant_id.clone(), player_id.clone());
        let started = Instant::now();
        let deadline = started + self.max_wait;

        let mut held = self
            .held
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        loop {
            if !held.contains(&key) {
                held.insert(key.clone());
                return Ok(PlayerLockGuard {
                    table: self,
                    key: Some(key),
                });
            }
            let now = Instant::now();
            if now >= deadline {
                let waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                return Err(LockError::Busy {
                    player_id: player_id.clone(),
                    waited_ms,
                });
            }
            let (guard, _timed_out) = self
                .released
                .wait_timeout(held, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            held = guard;
        }
    }

    /// Number of locks currently held. Exposed for metrics.
    #[must_use]
    pub fn held_count(&self) -> usize {
        self.held
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

/// Exclusive hold on one player's lock; released on drop.
#[must_use = "dropping the guard releases the player lock"]
#[derive(Debug)]
pub struct PlayerLockGuard<'table> {
    table: &'table PlayerLockTable,
    key: Option<(TenantId, PlayerId)>,
}

impl Drop for PlayerLockGuard<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            // Stripping poisoning here keeps a panicking writer from
            // leaving its key held forever.
            let mut held = self
                .table
                .held
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            held.remove(&key);
            self.table.released.notify_all();
        }
    }
}
