//! Point ledger types and row access.
//!
//! The ledger is append-only: every point movement is a new row with
//! before/after snapshots of the balance and tier it moved. Rows are
//! never updated or deleted; a mistaken award is unwound by a
//! `correction` entry, and history always explains the running balance.
//!
//! The acting staff id recorded on a row comes from the transaction's
//! authority context, never from request input. Entries issued on the
//! service lane carry no staff id.

use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension};
use thiserror::Error;

use crate::context::{ContextError, GuardError};
use crate::gaming_day::GamingDayError;
use crate::identity::{StaffId, TenantId};
use crate::store::{LockError, StoreError, StoreTxn};

pub mod idempotency;
pub mod issuance;


pub use idempotency::IdempotencyKey;
pub use issuance::{issue, IssueOutcome, IssueRequest};

/// Identifier of a player (the subject of balances and ledger entries).
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct PlayerId(String);

impl PlayerId {
    /// Wraps a raw player identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why points moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReasonCode {
    /// Points earned by a closed rating session.
    SessionAccrual,
    /// Discretionary staff award.
    ManualBonus,
    /// Promotional award.
    PromoBonus,
    /// Unwinds an earlier entry; the only reason allowed a negative
    /// delta.
    Correction,
}

impl ReasonCode {
    /// Returns the canonical column value for this reason.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SessionAccrual => "session_accrual",
            Self::ManualBonus => "manual_bonus",
            Self::PromoBonus => "promo_bonus",
            Self::Correction => "correction",
        }
    }

    /// Whether this reason only ever adds points.
    #[must_use]
    pub const fn is_accrual(self) -> bool {
        !matches!(self, Self::Correction)
    }

    /// Parses a stored column value.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::UnknownReason`] for any unrecognized value.
    pub fn parse(value: &str) -> Result<Self, LedgerError> {
        match value {
            "session_accrual" => Ok(Self::SessionAccrual),
            "manual_bonus" => Ok(Self::ManualBonus),
            "promo_bonus" => Ok(Self::PromoBonus),
            "correction" => Ok(Self::Correction),
            other => Err(LedgerError::UnknownReason {
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which kind of principal an entry was issued under.
///
/// Derived from the reason, never from request input: session accruals
/// are system entries no matter who triggered them, everything else is a
/// staff action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntrySource {
    /// Computed by the platform (session accruals, recovery re-drives).
    System,
    /// A staff decision.
    Staff,
}

impl EntrySource {
    /// Returns the canonical column value for this source.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Staff => "staff",
        }
    }

    /// The source an entry with this reason is recorded under.
    #[must_use]
    pub const fn for_reason(reason: ReasonCode) -> Self {
        match reason {
            ReasonCode::SessionAccrual => Self::System,
            ReasonCode::ManualBonus | ReasonCode::PromoBonus | ReasonCode::Correction => {
                Self::Staff
            }
        }
    }

    /// Parses a stored column value.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::UnknownSource`] for any unrecognized value.
    pub fn parse(value: &str) -> Result<Self, LedgerError> {
        match value {
            "system" => Ok(Self::System),
            "staff" => Ok(Self::Staff),
            other => Err(LedgerError::UnknownSource {
                value: other.to_string(),
            }),
        }
    }
}

/// One committed ledger row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    /// Monotonic row id.
    pub entry_id: i64,
    /// Tenant the entry belongs to.
    pub tenant_id: TenantId,
    /// Player whose balance moved.
    pub player_id: PlayerId,
    /// Signed point delta.
    pub delta: i64,
    /// Why the points moved.
    pub reason: ReasonCode,
    /// Principal kind the entry was issued under.
    pub source: EntrySource,
    /// Acting staff id from the authority context, when staff-issued.
    pub staff_id: Option<StaffId>,
    /// Correlation id minted at the entry point, for tracing a workflow.
    pub correlation_id: Option<String>,
    /// Replay-protection key, when the operation carried one.
    pub idempotency_key: Option<IdempotencyKey>,
    /// Balance before this entry applied.
    pub balance_before: i64,
    /// Balance after this entry applied.
    pub balance_after: i64,
    /// Tier before this entry applied.
    pub tier_before: String,
    /// Tier after this entry applied.
    pub tier_after: String,
    /// Gaming day the movement is bucketed under.
    pub gaming_day: NaiveDate,
    /// Commit timestamp, nanoseconds since the Unix epoch.
    pub created_at_ns: i64,
}

/// One player's running balance row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerBalance {
    /// Player this balance belongs to.
    pub player_id: PlayerId,
    /// Tenant the player belongs to.
    pub tenant_id: TenantId,
    /// Spendable points; never negative.
    pub balance: i64,
    /// Total points ever earned; drives the tier.
    pub lifetime_points: i64,
    /// Current tier name.
    pub tier: String,
    /// Progress toward the next tier, 0 to 100.
    pub tier_progress: i64,
    /// Last mutation timestamp, nanoseconds since the Unix epoch.
    pub updated_at_ns: i64,
}

/// Errors from ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The delta violates an invariant for its reason or balance.
    #[error("invalid delta {delta} for reason {reason}: {detail}")]
    InvalidDelta {
        /// The rejected delta.
        delta: i64,
        /// Reason the delta was submitted under.
        reason: ReasonCode,
        /// Which invariant the delta broke.
        detail: &'static str,
    },

    /// No balance row exists for this player in the acting tenant.
    #[error("no balance subject found for player {player_id}")]
    SubjectNotFound {
        /// The missing player.
        player_id: PlayerId,
    },

    /// The per-player lock stayed contended for the whole wait window.
    /// Retryable.
    #[error("player {player_id} is busy ({waited_ms}ms)")]
    Busy {
        /// Player whose lock was contended.
        player_id: PlayerId,
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// The idempotency key collided with a committed entry that is not
    /// visible in the acting tenant. Keys embed their scope, so this
    /// signals corrupt input rather than an ordinary replay.
    #[error("idempotency key {key} is already committed outside the acting tenant")]
    KeyCollision {
        /// The colliding key.
        key: IdempotencyKey,
    },

    /// A stored reason column held a value outside the known set.
    #[error("unknown reason code in store: {value:?}")]
    UnknownReason {
        /// The offending column value.
        value: String,
    },

    /// A stored source column held a value outside the known set.
    #[error("unknown entry source in store: {value:?}")]
    UnknownSource {
        /// The offending column value.
        value: String,
    },

    /// A stored gaming-day column did not parse as an ISO date.
    #[error("unparseable gaming day in store: {value:?}")]
    InvalidStoredDate {
        /// The offending column value.
        value: String,
    },

    /// Authority check failed.
    #[error(transparent)]
    Guard(#[from] GuardError),

    /// Context establishment failed.
    #[error(transparent)]
    Context(#[from] ContextError),

    /// Gaming-day configuration failed to load.
    #[error(transparent)]
    GamingDay(#[from] GamingDayError),

    /// Store-level failure (pool, open, commit).
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Database error from the backing store.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl From<LockError> for LedgerError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Busy {
                player_id,
                waited_ms,
            } => Self::Busy {
                player_id,
                waited_ms,
            },
        }
    }
}

impl From<crate::policy::PolicyError> for LedgerError {
    fn from(err: crate::policy::PolicyError) -> Self {
        match err {
            crate::policy::PolicyError::Database(inner) => Self::Database(inner),
        }
    }
}

const ENTRY_COLUMNS: &str = "entry_id, tenant_id, player_id, delta, reason, source, staff_id, \
     correlation_id, idempotency_key, balance_before, balance_after, tier_before, tier_after, \
     gaming_day, created_at_ns";

struct RawEntry {
    entry_id: i64,
    tenant_id: String,
    player_id: String,
    delta: i64,
    reason: String,
    source: String,
    staff_id: Option<String>,
    correlation_id: Option<String>,
    idempotency_key: Option<String>,
    balance_before: i64,
    balance_after: i64,
    tier_before: String,
    tier_after: String,
    gaming_day: String,
    created_at_ns: i64,
}

fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok(RawEntry {
        entry_id: row.get(0)?,
        tenant_id: row.get(1)?,
        player_id: row.get(2)?,
        delta: row.get(3)?,
        reason: row.get(4)?,
        source: row.get(5)?,
        staff_id: row.get(6)?,
        correlation_id: row.get(7)?,
        idempotency_key: row.get(8)?,
        balance_before: row.get(9)?,
        balance_after: row.get(10)?,
        tier_before: row.get(11)?,
        tier_after: row.get(12)?,
        gaming_day: row.get(13)?,
        created_at_ns: row.get(14)?,
    })
}

impl RawEntry {
    fn into_entry(self) -> Result<LedgerEntry, LedgerError> {
        let gaming_day = NaiveDate::parse_from_str(&self.gaming_day, "%Y-%m-%d").map_err(|_| {
            LedgerError::InvalidStoredDate {
                value: self.gaming_day.clone(),
            }
        })?;
        Ok(LedgerEntry {
            entry_id: self.entry_id,
            tenant_id: TenantId::new(self.tenant_id),
            player_id: PlayerId::new(self.player_id),
            delta: self.delta,
            reason: ReasonCode::parse(&self.reason)?,
            source: EntrySource::parse(&self.source)?,
            staff_id: self.staff_id.map(StaffId::new),
            correlation_id: self.correlation_id,
            idempotency_key: self.idempotency_key.map(IdempotencyKey::from_raw),
            balance_before: self.balance_before,
            balance_after: self.balance_after,
            tier_before: self.tier_before,
            tier_after: self.tier_after,
            gaming_day,
            created_at_ns: self.created_at_ns,
        })
    }
}

/// Loads one player's balance row within a tenant.
///
/// # Errors
///
/// Returns a database error; an absent row is `Ok(None)`.
pub fn load_balance(
    txn: &StoreTxn<'_>,
    tenant_id: &TenantId,
    player_id: &PlayerId,
) -> Result<Option<PlayerBalance>, LedgerError> {
    let row = txn
        .raw()
        .query_row(
            "SELECT player_id, tenant_id, balance, lifetime_points, tier, tier_progress, \
             updated_at_ns FROM player_balances WHERE tenant_id = ?1 AND player_id = ?2",
            params![tenant_id.as_str(), player_id.as_str()],
            |row| {
                Ok(PlayerBalance {
                    player_id: PlayerId::new(row.get::<_, String>(0)?),
                    tenant_id: TenantId::new(row.get::<_, String>(1)?),
                    balance: row.get(2)?,
                    lifetime_points: row.get(3)?,
                    tier: row.get(4)?,
                    tier_progress: row.get(5)?,
                    updated_at_ns: row.get(6)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Loads one ledger entry by id, tenant-scoped.
///
/// # Errors
///
/// Returns a database error or a fail-closed parse error for corrupt
/// rows; an absent row is `Ok(None)`.
pub fn load_entry(
    txn: &StoreTxn<'_>,
    tenant_id: &TenantId,
    entry_id: i64,
) -> Result<Option<LedgerEntry>, LedgerError> {
    let raw = txn
        .raw()
        .query_row(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM point_ledger \
                 WHERE tenant_id = ?1 AND entry_id = ?2"
            ),
            params![tenant_id.as_str(), entry_id],
            entry_from_row,
        )
        .optional()?;
    raw.map(RawEntry::into_entry).transpose()
}

/// Loads a player's entries within a tenant, newest first.
///
/// # Errors
///
/// Returns a database error or a fail-closed parse error for corrupt
/// rows.
pub fn load_player_entries(
    txn: &StoreTxn<'_>,
    tenant_id: &TenantId,
    player_id: &PlayerId,
    limit: usize,
) -> Result<Vec<LedgerEntry>, LedgerError> {
    let mut stmt = txn.raw().prepare(&format!(
        "SELECT {ENTRY_COLUMNS} FROM point_ledger \
         WHERE tenant_id = ?1 AND player_id = ?2 \
         ORDER BY entry_id DESC LIMIT ?3"
    ))?;
    let raws = stmt
        .query_map(
            params![
                tenant_id.as_str(),
                player_id.as_str(),
                i64::try_from(limit).unwrap_or(i64::MAX)
            ],
            entry_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    raws.into_iter().map(RawEntry::into_entry).collect()
}
