//! Recovery for the close-then-accrue workflow.
//!
//! Closing a rating session and accruing its points are two steps in two
//! systems: the upstream play-tracking workflow commits the close, then the
//! ledger commits the accrual. The second step can fail after the first
//! committed. This module owns getting such sessions the rest of the way.
//!
//! # Workflow states
//!
//! ```text
//! Started --close commits--> UpstreamCommitted --drive commits--> LedgerCommitted
//!                                  ^      |                         (terminal)
//!                                  |      | drive fails
//!                                  +------+
//!                               LedgerFailed
//! ```
//!
//! State is derived, never persisted. The close is visible as
//! `rating_sessions.closed_at_ns`; the accrual is visible as a ledger entry
//! whose idempotency key is the session id. A failed drive leaves nothing
//! behind (the issuance transaction aborts as a unit), so on the next look
//! the workflow re-presents as [`AccrualWorkflowState::UpstreamCommitted`]
//! and the failure itself travels in [`RecoveryError::PartialCompletion`].
//!
//! Recovery re-invokes the issuance engine with the session id as the key,
//! which either writes the missing entry or replays the committed one. The
//! coordinator never re-runs the upstream step. All drives run on the
//! service lane as a configured service account; no caller-supplied
//! principal reaches this path.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pitbook_core::context::{establish_service_context, ContextError, ServiceAccountRegistry};
use pitbook_core::identity::StaffRole;
use pitbook_core::ledger::{
    idempotency, issue, IdempotencyKey, IssueOutcome, IssueRequest, LedgerError, PlayerId,
    ReasonCode,
};
use pitbook_core::sessions::{self, RatingSession, SessionId};
use pitbook_core::store::{Store, StoreError, StoreTxn};

use crate::metrics::SharedMetricsRegistry;

/// Roles under which a session accrual may be driven.
const ACCRUAL_ROLES: &[StaffRole] = &[StaffRole::Floor, StaffRole::Supervisor, StaffRole::Admin];

/// Derived position of one close-then-accrue workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccrualWorkflowState {
    /// The session exists and is still open upstream.
    Started,
    /// The close committed; no ledger entry carries the session id yet.
    UpstreamCommitted,
    /// A ledger entry carries the session id. Terminal.
    LedgerCommitted,
    /// A ledger drive was attempted and failed. The attempt persists
    /// nothing, so a fresh derivation reads this position as
    /// [`Self::UpstreamCommitted`].
    LedgerFailed,
}

impl AccrualWorkflowState {
    /// Stable string form for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::UpstreamCommitted => "upstream_committed",
            Self::LedgerCommitted => "ledger_committed",
            Self::LedgerFailed => "ledger_failed",
        }
    }
}

impl std::fmt::Display for AccrualWorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from recovery coordination.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// No session row with this id is visible in the acting tenant.
    #[error("no rating session {session_id} in the acting tenant")]
    SessionNotFound {
        /// The missing session.
        session_id: SessionId,
    },

    /// The upstream close has not committed. There is nothing to recover,
    /// and this coordinator never drives the upstream step.
    #[error("rating session {session_id} is still open upstream")]
    UpstreamIncomplete {
        /// The still-open session.
        session_id: SessionId,
    },

    /// The ledger step stayed uncommitted after a drive. The workflow
    /// remains recoverable by re-driving with the same key.
    #[error(
        "accrual for player {player_id} is uncommitted \
         (key {idempotency_key}, correlation {correlation_id})"
    )]
    PartialCompletion {
        /// Player whose accrual is pending.
        player_id: PlayerId,
        /// Correlation id of the failed drive.
        correlation_id: String,
        /// Key a retry must reuse.
        idempotency_key: IdempotencyKey,
        /// What the drive failed with.
        #[source]
        source: Box<LedgerError>,
    },

    /// Service-lane context establishment failed.
    #[error(transparent)]
    Context(#[from] ContextError),

    /// Ledger failure outside an issuance drive.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Store-level failure (pool, open, commit).
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Database error from the backing store.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Result of one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Closed, unaccrued sessions the pass examined.
    pub scanned: usize,
    /// Sessions whose accrual is now committed, replays included.
    pub recovered: usize,
    /// Sessions left unrecovered this pass.
    pub failed: usize,
}

/// Derives the workflow state for a loaded session.
///
/// # Errors
///
/// Returns a ledger error from the entry lookup.
pub fn workflow_state(
    txn: &StoreTxn<'_>,
    session: &RatingSession,
) -> Result<AccrualWorkflowState, LedgerError> {
    if !session.is_closed() {
        return Ok(AccrualWorkflowState::Started);
    }
    let key = IdempotencyKey::for_session(session.session_id.as_str());
    match idempotency::find_applied(txn, &session.tenant_id, &key)? {
        Some(_) => Ok(AccrualWorkflowState::LedgerCommitted),
        None => Ok(AccrualWorkflowState::UpstreamCommitted),
    }
}

/// Drives pending accruals to `LedgerCommitted` on the service lane.
pub struct RecoveryCoordinator {
    store: Arc<Store>,
    registry: ServiceAccountRegistry,
    account: String,
    batch_limit: usize,
    metrics: SharedMetricsRegistry,
}

impl RecoveryCoordinator {
    /// Creates a coordinator acting as the named service account.
    #[must_use]
    pub fn new(
        store: Arc<Store>,
        registry: ServiceAccountRegistry,
        account: impl Into<String>,
        batch_limit: usize,
        metrics: SharedMetricsRegistry,
    ) -> Self {
        Self {
            store,
            registry,
            account: account.into(),
            batch_limit,
            metrics,
        }
    }

    /// Re-drives the ledger step for one session.
    ///
    /// Safe to call whether or not the accrual already committed: a
    /// committed accrual replays, an uncommitted one is written.
    ///
    /// # Errors
    ///
    /// [`RecoveryError::SessionNotFound`] when the session is not visible
    /// in the acting tenant, [`RecoveryError::UpstreamIncomplete`] when it
    /// has not closed, and [`RecoveryError::PartialCompletion`] when the
    /// drive itself fails.
    pub fn recover_session(&self, session_id: &SessionId) -> Result<IssueOutcome, RecoveryError> {
        let (session, state) = self.store.with_read_txn(|txn| {
            let ctx = establish_service_context(txn, &self.registry, &self.account)?;
            let Some(session) = sessions::load_session(txn, &ctx.tenant_id, session_id)? else {
                return Err(RecoveryError::SessionNotFound {
                    session_id: session_id.clone(),
                });
            };
            let state = workflow_state(txn, &session)?;
            Ok((session, state))
        })?;

        debug!(
            session_id = %session.session_id,
            player_id = %session.player_id,
            state = %state,
            "derived accrual workflow state"
        );

        let Some(closed_at_ns) = session.closed_at_ns else {
            return Err(RecoveryError::UpstreamIncomplete {
                session_id: session_id.clone(),
            });
        };

        self.drive(&session, closed_at_ns)
    }

    /// One sweep pass: finds closed sessions with no ledger entry and
    /// re-drives each. Per-session failures are counted, not fatal.
    ///
    /// # Errors
    ///
    /// Returns an error when the candidate scan itself fails; individual
    /// session failures only raise [`SweepReport::failed`].
    pub fn sweep(&self) -> Result<SweepReport, RecoveryError> {
        let candidates = self.store.with_read_txn(|txn| {
            let ctx = establish_service_context(txn, &self.registry, &self.account)?;
            Ok::<_, RecoveryError>(sessions::unaccrued_closed_sessions(
                txn,
                &ctx.tenant_id,
                self.batch_limit,
            )?)
        })?;

        let mut report = SweepReport {
            scanned: candidates.len(),
            ..SweepReport::default()
        };
        for session in &candidates {
            match self.recover_session(&session.session_id) {
                Ok(_) => report.recovered += 1,
                Err(err) => {
                    report.failed += 1;
                    debug!(
                        session_id = %session.session_id,
                        error = %err,
                        "session left unrecovered this pass"
                    );
                }
            }
        }
        Ok(report)
    }

    fn drive(
        &self,
        session: &RatingSession,
        closed_at_ns: i64,
    ) -> Result<IssueOutcome, RecoveryError> {
        let correlation_id = Uuid::new_v4().to_string();
        let key = IdempotencyKey::for_session(session.session_id.as_str());
        let request = IssueRequest {
            player_id: session.player_id.clone(),
            delta: session.earned_points,
            reason: ReasonCode::SessionAccrual,
            idempotency_key: Some(key.clone()),
            correlation_id: Some(correlation_id.clone()),
            claimed_tenant: None,
            event_ns: closed_at_ns,
        };
        let establish = |txn: &StoreTxn<'_>| {
            establish_service_context(txn, &self.registry, &self.account).map(|_| ())
        };

        match issue(&self.store, establish, ACCRUAL_ROLES, &request) {
            Ok(outcome) => {
                let label = if outcome.replayed { "replayed" } else { "recovered" };
                self.metrics.daemon_metrics().recovery_retried(label);
                info!(
                    session_id = %session.session_id,
                    player_id = %session.player_id,
                    entry_id = outcome.entry_id,
                    replayed = outcome.replayed,
                    correlation_id = %correlation_id,
                    state = %AccrualWorkflowState::LedgerCommitted,
                    "accrual workflow recovered"
                );
                Ok(outcome)
            }
            Err(err) => {
                self.metrics.daemon_metrics().recovery_retried("failed");
                warn!(
                    session_id = %session.session_id,
                    player_id = %session.player_id,
                    correlation_id = %correlation_id,
                    state = %AccrualWorkflowState::LedgerFailed,
                    error = %err,
                    "ledger drive failed, workflow remains recoverable with the same key"
                );
                Err(RecoveryError::PartialCompletion {
                    player_id: session.player_id.clone(),
                    correlation_id,
                    idempotency_key: key,
                    source: Box::new(err),
                })
            }
        }
    }
}
