//! Transaction-local authority context.
//!
//! Every authorization decision in this crate reads from an
//! [`AuthorityContext`]: the `(tenant, actor, role)` triple derived for
//! exactly one store transaction. The context lives in a set-once cell
//! owned by the transaction value itself, so it structurally cannot
//! outlive the transaction or leak across pooled connections. There is
//! no ambient or connection-scoped authority state anywhere.
//!
//! ```text
//!   token ──verify──▶ claims ──resolve──▶ identity row ──▶ AuthorityContext
//!                      (hints validated      (authoritative)    │
//!                       then discarded)                         ▼
//!                                                      ContextCell in StoreTxn
//!                                                      (dropped with the txn)
//! ```
//!
//! # Establishment lanes
//!
//! - **Staff lane**: [`establish_staff_context`] verifies a signed staff
//!   token, re-resolves the identity record inside the transaction, and
//!   derives the context from the record. Nothing in the token besides
//!   the verified subject is trusted.
//! - **Service lane**: [`establish_service_context`] derives a context
//!   from a configured service account. This lane never accepts tokens
//!   and exists for daemon-internal work such as recovery.
//!
//! # Security Invariants
//!
//! - A context is established at most once per transaction; a second,
//!   different establishment is [`ContextError::Conflict`].
//! - Token hints (staff id, tenant) are cross-checked against the
//!   resolved record and then discarded; the context is built from the
//!   record alone.
//! - An identity record with no tenant binding produces no context.
//! - Operations that find no context fail closed with
//!   [`GuardError::ContextMissing`].

use std::cell::OnceCell;
use std::collections::HashMap;

use thiserror::Error;

use crate::identity::{resolve_identity, IdentityError, StaffId, StaffRole, TenantId};
use crate::store::StoreTxn;
use crate::token::{TokenError, TokenMinter};

mod guard;

pub use guard::{assert_authorized, GuardError};

/// How a context was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextSource {
    /// Staff lane: derived from a verified staff token.
    StaffToken,
    /// Service lane: derived from a configured service account.
    ServiceAccount,
}

impl ContextSource {
    /// Returns the label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StaffToken => "staff_token",
            Self::ServiceAccount => "service_account",
        }
    }
}

/// The acting principal a context was derived for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActorRef {
    /// A staff identity record.
    Staff(StaffId),
    /// A configured service account.
    Service(String),
}

impl std::fmt::Display for ActorRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Staff(id) => write!(f, "staff:{id}"),
            Self::Service(name) => write!(f, "service:{name}"),
        }
    }
}

/// Authority derived for one transaction.
///
/// Construction goes through the establishment functions; the fields are
/// readable so guards and audit logging can use them, but no public
/// constructor exists outside the crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorityContext {
    /// Tenant every row touched by this transaction must belong to.
    pub tenant_id: TenantId,
    /// Acting principal, recorded on every ledger row this context writes.
    pub actor: ActorRef,
    /// Role the authority checks evaluate against.
    pub role: StaffRole,
    /// Which lane established the context.
    pub source: ContextSource,
}

impl AuthorityContext {
    /// Returns the staff id when the actor is a staff identity.
    #[must_use]
    pub fn staff_id(&self) -> Option<&StaffId> {
        match &self.actor {
            ActorRef::Staff(id) => Some(id),
            ActorRef::Service(_) => None,
        }
    }

    /// Stable string form of the actor for ledger rows and logs.
    #[must_use]
    pub fn actor_label(&self) -> String {
        self.actor.to_string()
    }
}

/// Errors from context establishment.
#[derive(Debug, Error)]
pub enum ContextError {
    /// A different context was already established for this transaction.
    #[error("a different authority context is already established for this transaction")]
    Conflict,

    /// The token's tenant hint does not match the resolved record's
    /// binding. Tokens minted before a deactivate-and-recreate move go
    /// stale this way.
    #[error("token tenant hint {hinted} does not match identity binding {bound}")]
    TenantMismatch {
        /// Tenant named by the token.
        hinted: TenantId,
        /// Tenant the identity record is bound to.
        bound: TenantId,
    },

    /// No service account with this name is configured.
    #[error("unknown service account {name:?}")]
    UnknownServiceAccount {
        /// The name that failed lookup.
        name: String,
    },

    /// Token verification failed.
    #[error(transparent)]
    Token(#[from] TokenError),

    /// Identity resolution failed.
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// Set-once holder for a transaction's context.
///
/// Lives inside [`StoreTxn`] so the context is destroyed when the
/// transaction ends, commit or rollback alike.
#[derive(Debug, Default)]
pub(crate) struct ContextCell {
    cell: OnceCell<AuthorityContext>,
}

impl ContextCell {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Establishes `ctx`, or re-confirms an identical one.
    ///
    /// Re-establishing the exact same context is a no-op so that layered
    /// middleware can be idempotent; any difference is a conflict.
    pub(crate) fn establish(
        &self,
        ctx: AuthorityContext,
    ) -> Result<&AuthorityContext, ContextError> {
        if let Some(existing) = self.cell.get() {
            if *existing == ctx {
                return Ok(existing);
            }
            tracing::warn!(
                established = %existing.actor,
                rejected = %ctx.actor,
                "refused second authority context for one transaction"
            );
            return Err(ContextError::Conflict);
        }
        Ok(self.cell.get_or_init(|| ctx))
    }

    pub(crate) fn get(&self) -> Option<&AuthorityContext> {
        self.cell.get()
    }
}

/// A configured service account for the service lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAccount {
    /// Stable account name, recorded as the acting principal.
    pub name: String,
    /// Tenant the account operates within.
    pub tenant_id: TenantId,
    /// Role granted to the account.
    pub role: StaffRole,
}

/// Lookup table of configured service accounts.
#[derive(Debug, Default, Clone)]
pub struct ServiceAccountRegistry {
    accounts: HashMap<String, ServiceAccount>,
}

impl ServiceAccountRegistry {
    /// Builds a registry from configured accounts. Later duplicates of a
    /// name replace earlier ones.
    #[must_use]
    pub fn new(accounts: impl IntoIterator<Item = ServiceAccount>) -> Self {
        Self {
            accounts: accounts
                .into_iter()
                .map(|account| (account.name.clone(), account))
                .collect(),
        }
    }

    /// Looks up an account by name.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&ServiceAccount> {
        self.accounts.get(name)
    }
}

/// Establishes a staff-lane context for `txn` from a signed token.
///
/// The token is verified, the identity record is resolved inside `txn`,
/// hints are cross-checked, and the resulting context is installed in the
/// transaction's cell. The returned reference is borrowed from the
/// transaction and cannot escape it.
///
/// # Errors
///
/// Token, identity, hint-mismatch, and re-establishment failures per
/// [`ContextError`]. An unbound identity record surfaces as
/// [`IdentityError::Unbound`].
pub fn establish_staff_context<'txn>(
    txn: &'txn StoreTxn<'_>,
    minter: &TokenMinter,
    token: &str,
    now_ns: i64,
) -> Result<&'txn AuthorityContext, ContextError> {
    let claims = minter.verify(token, now_ns)?;
    let record = resolve_identity(txn, &claims)?;

    let Some(bound_tenant) = record.tenant_id else {
        return Err(ContextError::Identity(IdentityError::Unbound {
            staff_id: record.staff_id,
        }));
    };
    if let Some(hinted) = claims.tenant_hint {
        if hinted != bound_tenant {
            tracing::warn!(
                staff_id = %record.staff_id,
                hinted = %hinted,
                bound = %bound_tenant,
                "stale tenant hint on verified token"
            );
            return Err(ContextError::TenantMismatch {
                hinted,
                bound: bound_tenant,
            });
        }
    }

    let ctx = AuthorityContext {
        tenant_id: bound_tenant,
        actor: ActorRef::Staff(record.staff_id),
        role: record.role,
        source: ContextSource::StaffToken,
    };
    tracing::debug!(
        tenant_id = %ctx.tenant_id,
        actor = %ctx.actor,
        role = %ctx.role,
        "established staff authority context"
    );
    txn.context_cell().establish(ctx)
}

/// Establishes a service-lane context for `txn` from a configured account.
///
/// # Errors
///
/// [`ContextError::UnknownServiceAccount`] if no such account is
/// configured, or [`ContextError::Conflict`] if the transaction already
/// carries a different context.
pub fn establish_service_context<'txn>(
    txn: &'txn StoreTxn<'_>,
    registry: &ServiceAccountRegistry,
    name: &str,
) -> Result<&'txn AuthorityContext, ContextError> {
    let Some(account) = registry.lookup(name) else {
        return Err(ContextError::UnknownServiceAccount {
            name: name.to_string(),
        });
    };
    let ctx = AuthorityContext {
        tenant_id: account.tenant_id.clone(),
        actor: ActorRef::Service(account.name.clone()),
        role: account.role,
        source: ContextSource::ServiceAccount,
    };
    tracing::debug!(
        tenant_id = %ctx.tenant_id,
        actor = %ctx.actor,
        role = %ctx.role,
        "established service authority context"
    );
    txn.context_cell().establish(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn floor_ctx() -> AuthorityContext {
        AuthorityContext {
            tenant_id: TenantId::new("lucky-star"),
            actor: ActorRef::Staff(StaffId::new("staff-1")),
            role: StaffRole::Floor,
            source: ContextSource::StaffToken,
        }
    }

    #[test]
    fn cell_establish_is_set_once() {
        let cell = ContextCell::new();
        assert!(cell.get().is_none());
        cell.establish(floor_ctx()).unwrap();
        assert_eq!(cell.get(), Some(&floor_ctx()));
    }

    #[test]
    fn identical_re_establishment_is_idempotent() {
        let cell = ContextCell::new();
        cell.establish(floor_ctx()).unwrap();
        assert!(cell.establish(floor_ctx()).is_ok());
    }

    #[test]
    fn different_context_conflicts() {
        let cell = ContextCell::new();
        cell.establish(floor_ctx()).unwrap();
        let other = AuthorityContext {
            actor: ActorRef::Staff(StaffId::new("staff-2")),
            ..floor_ctx()
        };
        assert!(matches!(
            cell.establish(other),
            Err(ContextError::Conflict)
        ));
        // The original context survives the refused attempt.
        assert_eq!(cell.get(), Some(&floor_ctx()));
    }

    #[test]
    fn registry_lookup_by_name() {
        let registry = ServiceAccountRegistry::new([ServiceAccount {
            name: "recovery-sweeper".to_string(),
            tenant_id: TenantId::new("lucky-star"),
            role: StaffRole::Supervisor,
        }]);
        assert!(registry.lookup("recovery-sweeper").is_some());
        assert!(registry.lookup("no-such-account").is_none());
    }

    #[test]
    fn actor_labels_are_lane_prefixed() {
        assert_eq!(
            ActorRef::Staff(StaffId::new("staff-1")).to_string(),
            "staff:staff-1"
        );
        assert_eq!(
            ActorRef::Service("sweeper".to_string()).to_string(),
            "service:sweeper"
        );
    }
}
