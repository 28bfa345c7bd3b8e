//! Authority checks against an established context.
//!
//! Guards are pure predicates over [`AuthorityContext`]; they perform no
//! I/O and consult nothing outside the context value. Denial is the
//! default: operations that cannot find a context fail with
//! [`GuardError::ContextMissing`] rather than proceeding unchecked.
//!
//! Checks run in a fixed order: claimed tenant first, then role. A caller
//! naming the wrong tenant is told so even when their role would also
//! have been refused; the cross-tenant signal is the one worth surfacing.

use thiserror::Error;

use crate::context::AuthorityContext;
use crate::identity::{StaffRole, TenantId};

/// Errors from authority checks.
#[derive(Debug, Error)]
pub enum GuardError {
    /// The transaction has no established context.
    #[error("no authority context established for this transaction")]
    ContextMissing,

    /// The caller-claimed tenant differs from the derived one.
    #[error("claimed tenant {claimed_tenant} does not match the derived tenant {context_tenant}")]
    TenantMismatch {
        /// Tenant the context derived from the identity store.
        context_tenant: TenantId,
        /// Tenant the caller claimed.
        claimed_tenant: TenantId,
    },

    /// The context's role is not in the operation's required set.
    #[error("role {role} is not authorized for this operation")]
    Forbidden {
        /// Role the context carries.
        role: StaffRole,
        /// Roles the operation accepts.
        required: Vec<StaffRole>,
    },
}

/// Asserts that `ctx` may perform an operation.
///
/// `required` is the set of roles the operation accepts. `claimed_tenant`
/// is a caller-supplied tenant id when the entry point carries one; it is
/// redundant confirmation, never a source of truth, and any disagreement
/// with the derived tenant is refused before the role is even looked at.
///
/// # Errors
///
/// [`GuardError::TenantMismatch`] or [`GuardError::Forbidden`].
pub fn assert_authorized(
    ctx: &AuthorityContext,
    required: &[StaffRole],
    claimed_tenant: Option<&TenantId>,
) -> Result<(), GuardError> {
    if let Some(claimed) = claimed_tenant {
        if *claimed != ctx.tenant_id {
            tracing::warn!(
                actor = %ctx.actor,
                context_tenant = %ctx.tenant_id,
                claimed_tenant = %claimed,
                "denied operation claiming a foreign tenant"
            );
            return Err(GuardError::TenantMismatch {
                context_tenant: ctx.tenant_id.clone(),
                claimed_tenant: claimed.clone(),
            });
        }
    }
    if !required.contains(&ctx.role) {
        tracing::warn!(
            actor = %ctx.actor,
            role = %ctx.role,
            ?required,
            "denied operation outside role set"
        );
        return Err(GuardError::Forbidden {
            role: ctx.role,
            required: required.to_vec(),
        });
    }
    Ok(())
}
