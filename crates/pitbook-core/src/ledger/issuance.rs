//! The point issuance engine.
//!
//! [`issue`] is the only code path that writes `point_ledger` rows or
//! mutates `player_balances`. One call is one logical issuance:
//!
//! ```text
//!   probe txn (read)      player lock       write txn (IMMEDIATE)
//!  ┌─────────────────┐   ┌─────────────┐   ┌──────────────────────────┐
//!  │ establish ctx   │──▶│ exclusive,  │──▶│ establish ctx (fresh)    │
//!  │ assert guard    │   │ bounded     │   │ assert guard             │
//!  │ key fast path   │   │ wait, else  │   │ re-probe key             │
//!  │ (replay return) │   │ Busy        │   │ validate delta           │
//!  └─────────────────┘   └─────────────┘   │ snapshot, insert, update │
//!                                          └──────────────────────────┘
//! ```
//!
//! The probe transaction answers replays without taking the lock. The
//! write transaction re-derives its own context and re-probes the key,
//! since nothing carries over between transactions; the re-probe plus
//! the unique index make replay detection authoritative even against
//! writers in other processes, which the in-process lock cannot see.
//!
//! The player lock is always acquired before the write transaction
//! begins. A writer waiting for a lock therefore never holds the
//! database write lock, and a lock holder can always reach `BEGIN
//! IMMEDIATE`.

use rusqlite::params;
use tracing::{debug, info};

use crate::context::{assert_authorized, AuthorityContext, ContextError};
use crate::gaming_day::{gaming_day_ns, load_day_start};
use crate::identity::{StaffRole, TenantId};
use crate::ledger::{
    idempotency, load_balance, EntrySource, IdempotencyKey, LedgerEntry, LedgerError, PlayerId,
    ReasonCode,
};
use crate::policy::tier_for;
use crate::store::{is_contention, now_ns, Store, StoreError, StoreTxn, BUSY_TIMEOUT_MS};

/// One requested point movement.
#[derive(Debug, Clone)]
pub struct IssueRequest {
    /// Player whose balance moves.
    pub player_id: PlayerId,
    /// Signed point delta. Accrual reasons require `delta >= 0`.
    pub delta: i64,
    /// Why the points move.
    pub reason: ReasonCode,
    /// Replay-protection key. `None` always issues a fresh entry.
    pub idempotency_key: Option<IdempotencyKey>,
    /// Correlation id minted at the entry point, recorded for tracing.
    pub correlation_id: Option<String>,
    /// Caller-claimed tenant, when the entry point carries one. Checked
    /// against the derived tenant, never used for scoping.
    pub claimed_tenant: Option<TenantId>,
    /// When the underlying business event happened, nanoseconds since
    /// the Unix epoch. Buckets the entry's gaming day.
    pub event_ns: i64,
}

/// Result of a successful issuance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueOutcome {
    /// The committed ledger row.
    pub entry_id: i64,
    /// Balance after the entry applied.
    pub balance_after: i64,
    /// Tier after the entry applied.
    pub tier_after: String,
    /// Whether this call replayed an already-committed entry instead of
    /// writing a new one.
    pub replayed: bool,
}

impl IssueOutcome {
    fn replay_of(entry: &LedgerEntry) -> Self {
        Self {
            entry_id: entry.entry_id,
            balance_after: entry.balance_after,
            tier_after: entry.tier_after.clone(),
            replayed: true,
        }
    }
}

/// Applies one point movement, exactly once per idempotency key.
///
/// `establish` derives the authority context; it runs once in the probe
/// transaction and once in the write transaction, so a credential
/// revoked between the two is caught. `allowed_roles` is the calling
/// operation's role allow-list, asserted in both transactions before
/// anything is read.
///
/// # Errors
///
/// - [`LedgerError::Busy`] when the player lock or the database write
///   lock stays contended; retryable with the same key
/// - [`LedgerError::InvalidDelta`] for deltas that break an invariant
/// - [`LedgerError::SubjectNotFound`] when the player has no balance row
///   in the acting tenant
/// - context, guard, and database failures as their own variants
pub fn issue(
    store: &Store,
    establish: impl Fn(&StoreTxn<'_>) -> Result<(), ContextError>,
    allowed_roles: &[StaffRole],
    request: &IssueRequest,
) -> Result<IssueOutcome, LedgerError> {
    // Probe: authorize early and answer replays without the lock.
    let (tenant_id, replay) = store.with_read_txn(|txn| {
        establish(txn)?;
        let ctx = txn.context()?;
        assert_authorized(ctx, allowed_roles, request.claimed_tenant.as_ref())?;
        let replay = match &request.idempotency_key {
            Some(key) => idempotency::find_applied(txn, &ctx.tenant_id, key)?,
            None => None,
        };
        Ok::<_, LedgerError>((ctx.tenant_id.clone(), replay))
    })?;
    if let Some(entry) = replay {
        debug!(
            player_id = %request.player_id,
            entry_id = entry.entry_id,
            "replayed committed issuance from probe"
        );
        return Ok(IssueOutcome::replay_of(&entry));
    }

    let _lock = store
        .player_locks()
        .acquire(&tenant_id, &request.player_id)?;

    let result = store.with_write_txn(|txn| {
        establish(txn)?;
        let ctx = txn.context()?;
        assert_authorized(ctx, allowed_roles, request.claimed_tenant.as_ref())?;
        apply(txn, ctx, request)
    });
    promote_contention(result, &request.player_id)
}

/// The single-transaction core: validates, snapshots, appends the entry,
/// and moves the balance.
fn apply(
    txn: &StoreTxn<'_>,
    ctx: &AuthorityContext,
    request: &IssueRequest,
) -> Result<IssueOutcome, LedgerError> {
    // Authoritative replay check now that this writer is serialized.
    if let Some(key) = &request.idempotency_key {
        if let Some(entry) = idempotency::find_applied(txn, &ctx.tenant_id, key)? {
            debug!(
                player_id = %request.player_id,
                entry_id = entry.entry_id,
                "replayed committed issuance inside write transaction"
            );
            return Ok(IssueOutcome::replay_of(&entry));
        }
    }

    if request.reason.is_accrual() && request.delta < 0 {
        return Err(LedgerError::InvalidDelta {
            delta: request.delta,
            reason: request.reason,
            detail: "accrual reasons require a non-negative delta",
        });
    }

    let balance = load_balance(txn, &ctx.tenant_id, &request.player_id)?.ok_or_else(|| {
        LedgerError::SubjectNotFound {
            player_id: request.player_id.clone(),
        }
    })?;

    let balance_after = balance
        .balance
        .checked_add(request.delta)
        .ok_or_else(|| overflow_delta(request))?;
    if balance_after < 0 {
        return Err(LedgerError::InvalidDelta {
            delta: request.delta,
            reason: request.reason,
            detail: "balance would fall below zero",
        });
    }
    // Lifetime points track everything ever earned; corrections unwind
    // them but never below zero.
    let lifetime_after = balance
        .lifetime_points
        .checked_add(request.delta)
        .ok_or_else(|| overflow_delta(request))?
        .max(0);

    let placement = tier_for(txn, &ctx.tenant_id, lifetime_after)?;
    let day_start = load_day_start(txn, &ctx.tenant_id)?;
    let day = gaming_day_ns(request.event_ns, day_start);
    let source = EntrySource::for_reason(request.reason);
    let staff_id = ctx.staff_id().cloned();
    let now = now_ns();

    let inserted = txn.raw().execute(
        "INSERT INTO point_ledger \
         (tenant_id, player_id, delta, reason, source, staff_id, correlation_id, \
          idempotency_key, balance_before, balance_after, tier_before, tier_after, \
          gaming_day, created_at_ns) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            ctx.tenant_id.as_str(),
            request.player_id.as_str(),
            request.delta,
            request.reason.as_str(),
            source.as_str(),
            staff_id.as_ref().map(|id| id.as_str()),
            request.correlation_id,
            request.idempotency_key.as_ref().map(|key| key.as_str()),
            balance.balance,
            balance_after,
            balance.tier,
            placement.tier,
            day.to_string(),
            now,
        ],
    );
    if let Err(err) = inserted {
        // A writer this process cannot see can still land the same key
        // first; the unique index turns that into a replay, not a
        // duplicate.
        if idempotency::is_key_conflict(&err) {
            if let Some(key) = &request.idempotency_key {
                if let Some(entry) = idempotency::find_applied(txn, &ctx.tenant_id, key)? {
                    debug!(
                        player_id = %request.player_id,
                        entry_id = entry.entry_id,
                        "replayed issuance committed by a concurrent writer"
                    );
                    return Ok(IssueOutcome::replay_of(&entry));
                }
                return Err(LedgerError::KeyCollision { key: key.clone() });
            }
        }
        return Err(err.into());
    }
    let entry_id = txn.raw().last_insert_rowid();

    txn.raw().execute(
        "UPDATE player_balances \
         SET balance = ?1, lifetime_points = ?2, tier = ?3, tier_progress = ?4, \
             updated_at_ns = ?5 \
         WHERE tenant_id = ?6 AND player_id = ?7",
        params![
            balance_after,
            lifetime_after,
            placement.tier,
            placement.progress,
            now,
            ctx.tenant_id.as_str(),
            request.player_id.as_str(),
        ],
    )?;

    info!(
        tenant_id = %ctx.tenant_id,
        player_id = %request.player_id,
        actor = %ctx.actor,
        delta = request.delta,
        reason = %request.reason,
        entry_id,
        balance_after,
        tier_after = %placement.tier,
        correlation_id = request.correlation_id.as_deref().unwrap_or("-"),
        "issued ledger entry"
    );

    Ok(IssueOutcome {
        entry_id,
        balance_after,
        tier_after: placement.tier,
        replayed: false,
    })
}

fn overflow_delta(request: &IssueRequest) -> LedgerError {
    LedgerError::InvalidDelta {
        delta: request.delta,
        reason: request.reason,
        detail: "balance arithmetic overflow",
    }
}

/// Rewrites SQLite-level write contention as the retryable busy signal,
/// leaving every other error untouched.
fn promote_contention(
    result: Result<IssueOutcome, LedgerError>,
    player_id: &PlayerId,
) -> Result<IssueOutcome, LedgerError> {
    match result {
        Err(LedgerError::Database(err)) if is_contention(&err) => Err(LedgerError::Busy {
            player_id: player_id.clone(),
            waited_ms: BUSY_TIMEOUT_MS,
        }),
        Err(LedgerError::Store(StoreError::Database(err))) if is_contention(&err) => {
            Err(LedgerError::Busy {
                player_id: player_id.clone(),
                waited_ms: BUSY_TIMEOUT_MS,
            })
        }
        other => other,
    }
}
