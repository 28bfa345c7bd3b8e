//! Two-lane privileged command dispatch.
//!
//! The workflow layer that links this crate hands commands to a
//! [`Dispatcher`]; nothing here listens on a socket. Every command runs the
//! same sequence: lease a pooled connection, begin a transaction, establish
//! the authority context inside it, assert authorization, operate, commit.
//! The pool has no session affinity, so no command can observe another
//! transaction's context.
//!
//! | Command | Lane | Allow-list |
//! |---------|------|------------|
//! | [`SessionClosedCommand`] | staff | any active role |
//! | [`ManualRewardCommand`] | staff | supervisor, admin |
//! | [`RecoverAccrualCommand`] | service | configured account |
//!
//! Staff-lane commands carry a bearer token and derive the acting tenant,
//! staff id, and role from it inside the transaction. The caller may claim
//! a tenant id as redundant confirmation; it is never used for scoping.
//! The service lane is reachable only through the recovery coordinator
//! bound at construction, never from caller-supplied input.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use pitbook_core::context::{assert_authorized, establish_staff_context, ContextError, GuardError};
use pitbook_core::gaming_day::{gaming_day_ns, load_day_start, GamingDayError};
use pitbook_core::identity::{StaffId, StaffRole, TenantId};
use pitbook_core::ledger::{
    issue, load_balance, IdempotencyKey, IssueOutcome, IssueRequest, LedgerError, PlayerBalance,
    PlayerId, ReasonCode,
};
use pitbook_core::sessions::{self, SessionId};
use pitbook_core::store::{now_ns, Store, StoreError, StoreTxn};
use pitbook_core::token::TokenMinter;

use crate::metrics::SharedMetricsRegistry;
use crate::rate_limit::RateLimiter;
use crate::recovery::{RecoveryCoordinator, RecoveryError};

/// Roles allowed to accrue a closed session.
const ANY_STAFF_ROLE: &[StaffRole] = &[StaffRole::Floor, StaffRole::Supervisor, StaffRole::Admin];

/// Roles allowed to issue manual rewards.
const SUPERVISOR_OR_ADMIN: &[StaffRole] = &[StaffRole::Supervisor, StaffRole::Admin];

/// Errors from command dispatch.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No session row with this id is visible in the acting tenant.
    #[error("no rating session {session_id} in the acting tenant")]
    SessionNotFound {
        /// The missing session.
        session_id: SessionId,
    },

    /// The upstream workflow has not closed the session; there is
    /// nothing to accrue yet.
    #[error("rating session {session_id} is still open")]
    SessionStillOpen {
        /// The still-open session.
        session_id: SessionId,
    },

    /// The staff member exhausted their manual-reward window. Retryable
    /// after the window slides.
    #[error("staff {staff_id} exceeded the manual-reward rate limit")]
    RateLimited {
        /// The limited staff member.
        staff_id: StaffId,
    },

    /// A staff-lane command resolved to a context with no staff
    /// principal. Refused rather than attributed to nobody.
    #[error("command requires a staff principal")]
    StaffPrincipalRequired,

    /// Authority check failed.
    #[error(transparent)]
    Guard(#[from] GuardError),

    /// Context establishment failed.
    #[error(transparent)]
    Context(#[from] ContextError),

    /// Gaming-day configuration failed to load.
    #[error(transparent)]
    GamingDay(#[from] GamingDayError),

    /// The issuance engine refused or failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Recovery coordination failed.
    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    /// Store-level failure (pool, open, commit).
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Database error from the backing store.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Staff-lane command: accrue a closed rating session's earned points.
///
/// Idempotency key is the session id, so dispatching the same close twice
/// replays the first entry.
#[derive(Clone)]
pub struct SessionClosedCommand {
    /// Bearer token of the acting staff member.
    pub token: String,
    /// Session to accrue.
    pub session_id: SessionId,
}

impl std::fmt::Debug for SessionClosedCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Bearer tokens stay out of debug output and logs.
        f.debug_struct("SessionClosedCommand")
            .field("token_len", &self.token.len())
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// Reasons a manual reward may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualRewardReason {
    /// Discretionary staff award.
    ManualBonus,
    /// Promotional award.
    PromoBonus,
}

impl ManualRewardReason {
    /// The ledger reason code this reward is recorded under.
    #[must_use]
    pub const fn as_reason_code(self) -> ReasonCode {
        match self {
            Self::ManualBonus => ReasonCode::ManualBonus,
            Self::PromoBonus => ReasonCode::PromoBonus,
        }
    }
}

/// Staff-lane command: award points at staff discretion.
///
/// The idempotency key is derived from the acting tenant, player, staff
/// id, amount, reason, and gaming day, so an identical award collapses
/// into one entry within a gaming day and repeats on the next.
#[derive(Clone)]
pub struct ManualRewardCommand {
    /// Bearer token of the acting staff member.
    pub token: String,
    /// Caller-claimed tenant, checked against the derived one.
    pub claimed_tenant_id: Option<TenantId>,
    /// Player to award.
    pub player_id: PlayerId,
    /// Points to award; must be non-negative.
    pub amount: i64,
    /// Why the award is made.
    pub reason: ManualRewardReason,
}

impl std::fmt::Debug for ManualRewardCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualRewardCommand")
            .field("token_len", &self.token.len())
            .field("claimed_tenant_id", &self.claimed_tenant_id)
            .field("player_id", &self.player_id)
            .field("amount", &self.amount)
            .field("reason", &self.reason)
            .finish()
    }
}

/// Service-lane command: re-drive a session accrual whose ledger step
/// failed after the upstream close committed.
#[derive(Debug, Clone)]
pub struct RecoverAccrualCommand {
    /// Session whose accrual to re-drive.
    pub session_id: SessionId,
}

/// The privileged command surface.
pub struct Dispatcher {
    store: Arc<Store>,
    minter: TokenMinter,
    rate_limiter: RateLimiter,
    recovery: RecoveryCoordinator,
    metrics: SharedMetricsRegistry,
}

impl Dispatcher {
    /// Assembles a dispatcher from its runtime parts.
    #[must_use]
    pub fn new(
        store: Arc<Store>,
        minter: TokenMinter,
        rate_limiter: RateLimiter,
        recovery: RecoveryCoordinator,
        metrics: SharedMetricsRegistry,
    ) -> Self {
        Self {
            store,
            minter,
            rate_limiter,
            recovery,
            metrics,
        }
    }

    /// Accrues a closed session's earned points for its player.
    ///
    /// # Errors
    ///
    /// Denials surface as [`DispatchError::Guard`] or
    /// [`DispatchError::Context`]; an open or unknown session as
    /// [`DispatchError::SessionStillOpen`] /
    /// [`DispatchError::SessionNotFound`]; issuance failures as
    /// [`DispatchError::Ledger`].
    pub fn session_closed(
        &self,
        cmd: &SessionClosedCommand,
    ) -> Result<IssueOutcome, DispatchError> {
        let started = Instant::now();
        let result = self.run_session_closed(cmd);
        self.finish("session_closed", ReasonCode::SessionAccrual, started, result)
    }

    /// Awards points at staff discretion.
    ///
    /// # Errors
    ///
    /// As [`Self::session_closed`], plus [`DispatchError::RateLimited`]
    /// when the acting staff member exhausted their window.
    pub fn manual_reward(&self, cmd: &ManualRewardCommand) -> Result<IssueOutcome, DispatchError> {
        let started = Instant::now();
        let result = self.run_manual_reward(cmd);
        self.finish(
            "manual_reward",
            cmd.reason.as_reason_code(),
            started,
            result,
        )
    }

    /// Re-drives a pending session accrual on the service lane.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Recovery`] wrapping the coordinator's
    /// outcome, including `PartialCompletion` when the drive fails again.
    pub fn recover_accrual(
        &self,
        cmd: &RecoverAccrualCommand,
    ) -> Result<IssueOutcome, DispatchError> {
        Ok(self.recovery.recover_session(&cmd.session_id)?)
    }

    /// Looks up a player's balance in the acting tenant. Takes no lock
    /// and writes nothing.
    ///
    /// # Errors
    ///
    /// Denials surface as [`DispatchError::Guard`] or
    /// [`DispatchError::Context`]; an unknown player is `Ok(None)`.
    pub fn player_balance(
        &self,
        token: &str,
        claimed_tenant_id: Option<&TenantId>,
        player_id: &PlayerId,
    ) -> Result<Option<PlayerBalance>, DispatchError> {
        let now = now_ns();
        self.store.with_read_txn(|txn| {
            let ctx = establish_staff_context(txn, &self.minter, token, now)?;
            assert_authorized(ctx, ANY_STAFF_ROLE, claimed_tenant_id)?;
            Ok(load_balance(txn, &ctx.tenant_id, player_id)?)
        })
    }

    fn run_session_closed(
        &self,
        cmd: &SessionClosedCommand,
    ) -> Result<IssueOutcome, DispatchError> {
        let now = now_ns();
        let session = self.store.with_read_txn(|txn| {
            let ctx = establish_staff_context(txn, &self.minter, &cmd.token, now)?;
            assert_authorized(ctx, ANY_STAFF_ROLE, None)?;
            Ok::<_, DispatchError>(sessions::load_session(txn, &ctx.tenant_id, &cmd.session_id)?)
        })?;
        let Some(session) = session else {
            return Err(DispatchError::SessionNotFound {
                session_id: cmd.session_id.clone(),
            });
        };
        let Some(closed_at_ns) = session.closed_at_ns else {
            return Err(DispatchError::SessionStillOpen {
                session_id: cmd.session_id.clone(),
            });
        };

        let request = IssueRequest {
            player_id: session.player_id,
            delta: session.earned_points,
            reason: ReasonCode::SessionAccrual,
            idempotency_key: Some(IdempotencyKey::for_session(cmd.session_id.as_str())),
            correlation_id: Some(Uuid::new_v4().to_string()),
            claimed_tenant: None,
            event_ns: closed_at_ns,
        };
        let establish = |txn: &StoreTxn<'_>| {
            establish_staff_context(txn, &self.minter, &cmd.token, now).map(|_| ())
        };
        Ok(issue(&self.store, establish, ANY_STAFF_ROLE, &request)?)
    }

    fn run_manual_reward(&self, cmd: &ManualRewardCommand) -> Result<IssueOutcome, DispatchError> {
        let now = now_ns();
        let reason = cmd.reason.as_reason_code();

        // The key depends on the derived tenant and staff id plus the
        // tenant's gaming day, none of which exist outside a transaction.
        let (staff_id, key) = self.store.with_read_txn(|txn| {
            let ctx = establish_staff_context(txn, &self.minter, &cmd.token, now)?;
            assert_authorized(ctx, SUPERVISOR_OR_ADMIN, cmd.claimed_tenant_id.as_ref())?;
            let staff_id = ctx
                .staff_id()
                .cloned()
                .ok_or(DispatchError::StaffPrincipalRequired)?;
            let day_start = load_day_start(txn, &ctx.tenant_id)?;
            let day = gaming_day_ns(now, day_start);
            let key = IdempotencyKey::for_manual_reward(
                &ctx.tenant_id,
                &cmd.player_id,
                &staff_id,
                cmd.amount,
                reason,
                day,
            );
            Ok::<_, DispatchError>((staff_id, key))
        })?;

        if self.rate_limiter.check(staff_id.as_str()).is_err() {
            warn!(
                staff_id = %staff_id,
                player_id = %cmd.player_id,
                amount = cmd.amount,
                "manual reward refused by rate limit"
            );
            return Err(DispatchError::RateLimited { staff_id });
        }

        let request = IssueRequest {
            player_id: cmd.player_id.clone(),
            delta: cmd.amount,
            reason,
            idempotency_key: Some(key),
            correlation_id: Some(Uuid::new_v4().to_string()),
            claimed_tenant: cmd.claimed_tenant_id.clone(),
            event_ns: now,
        };
        let establish = |txn: &StoreTxn<'_>| {
            establish_staff_context(txn, &self.minter, &cmd.token, now).map(|_| ())
        };
        Ok(issue(&self.store, establish, SUPERVISOR_OR_ADMIN, &request)?)
    }

    fn finish(
        &self,
        command: &'static str,
        reason: ReasonCode,
        started: Instant,
        result: Result<IssueOutcome, DispatchError>,
    ) -> Result<IssueOutcome, DispatchError> {
        let metrics = self.metrics.daemon_metrics();
        metrics.record_issuance_latency(command, started.elapsed().as_secs_f64());
        metrics.issuance_completed(reason.as_str(), outcome_label(&result));
        if let Err(err) = &result {
            if let Some(rule) = denial_rule(err) {
                metrics.authorization_denied(command, rule);
            }
            if matches!(err, DispatchError::Ledger(LedgerError::Busy { .. })) {
                metrics.player_busy(command);
            }
        }
        result
    }
}

/// Classifies a result for the issuance counter's `outcome` label.
fn outcome_label(result: &Result<IssueOutcome, DispatchError>) -> &'static str {
    match result {
        Ok(outcome) if outcome.replayed => "replayed",
        Ok(_) => "issued",
        Err(err) if denial_rule(err).is_some() => "denied",
        Err(DispatchError::Ledger(LedgerError::Busy { .. })) => "busy",
        Err(DispatchError::Ledger(
            LedgerError::InvalidDelta { .. } | LedgerError::SubjectNotFound { .. },
        )) => "invalid",
        Err(_) => "error",
    }
}

/// Maps a denial to its `rule` label; `None` for non-denial errors.
fn denial_rule(err: &DispatchError) -> Option<&'static str> {
    match err {
        DispatchError::RateLimited { .. } => Some("rate_limited"),
        DispatchError::Guard(guard) | DispatchError::Ledger(LedgerError::Guard(guard)) => {
            Some(guard_rule(guard))
        }
        DispatchError::Context(_) | DispatchError::Ledger(LedgerError::Context(_)) => {
            Some("establishment")
        }
        _ => None,
    }
}

const fn guard_rule(err: &GuardError) -> &'static str {
    match err {
        GuardError::ContextMissing => "context_missing",
        GuardError::TenantMismatch { .. } => "tenant_mismatch",
        GuardError::Forbidden { .. } => "forbidden",
    }
}
