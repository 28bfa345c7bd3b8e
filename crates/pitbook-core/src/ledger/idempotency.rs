//! Idempotency keys and replay lookup.
//!
//! A key identifies one logical issuance. Keys are deterministic: the
//! same logical operation always derives the same key, so a retry finds
//! the committed entry instead of writing a second one. Two shapes
//! exist:
//!
//! - session accruals reuse the originating session id, which is unique
//!   platform-wide;
//! - manual rewards digest the full operation tuple including the gaming
//!   day, so an identical award collapses within one gaming day and
//!   becomes a fresh operation on the next.
//!
//! The probe here is the fast path only. The partial unique index on
//! `point_ledger.idempotency_key` is what actually guarantees at-most-
//! once application when two writers race the same key.

use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::identity::{StaffId, TenantId};
use crate::ledger::{
    entry_from_row, LedgerEntry, LedgerError, PlayerId, RawEntry, ReasonCode, ENTRY_COLUMNS,
};
use crate::store::StoreTxn;

/// Replay-protection key for one logical issuance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Wraps an externally issued key value.
    #[must_use]
    pub fn from_raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key for a session accrual: the session id itself.
    #[must_use]
    pub fn for_session(session_id: &str) -> Self {
        Self(session_id.to_string())
    }

    /// Key for a staff manual reward.
    ///
    /// Digests the complete operation tuple. Including the gaming day
    /// means an identical award is one operation within a gaming day and
    /// a new one after the boundary.
    #[must_use]
    pub fn for_manual_reward(
        tenant_id: &TenantId,
        player_id: &PlayerId,
        staff_id: &StaffId,
        amount: i64,
        reason: ReasonCode,
        gaming_day: NaiveDate,
    ) -> Self {
        let canonical = format!(
            "manual-reward|{}|{}|{}|{}|{}|{}",
            tenant_id.as_str(),
            player_id.as_str(),
            staff_id.as_str(),
            amount,
            reason.as_str(),
            gaming_day,
        );
        let digest = Sha256::digest(canonical.as_bytes());
        Self(hex::encode(digest))
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Finds the committed entry for a key within a tenant, if any.
///
/// # Errors
///
/// Returns a database error or a fail-closed parse error for corrupt
/// rows; an absent row is `Ok(None)`.
pub fn find_applied(
    txn: &StoreTxn<'_>,
    tenant_id: &TenantId,
    key: &IdempotencyKey,
) -> Result<Option<LedgerEntry>, LedgerError> {
    let raw = txn
        .raw()
        .query_row(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM point_ledger \
                 WHERE tenant_id = ?1 AND idempotency_key = ?2"
            ),
            params![tenant_id.as_str(), key.as_str()],
            entry_from_row,
        )
        .optional()?;
    raw.map(RawEntry::into_entry).transpose()
}

/// Returns whether a driver error is the unique-index violation raised
/// by a concurrent insert of the same idempotency key.
///
/// `SQLite` names the violated column for plain-column indexes and the
/// index itself for expression indexes, so both spellings are accepted.
pub(crate) fn is_key_conflict(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(inner, Some(message)) => {
            inner.code == rusqlite::ErrorCode::ConstraintViolation
                && (message.contains("point_ledger.idempotency_key")
                    || message.contains("idx_point_ledger_idempotency"))
        }
        _ => false,
    }
}
