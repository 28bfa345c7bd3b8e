//! Administrative operations on identity records.
//!
//! Every operation here requires an established [`AuthorityContext`]
//! carrying the admin role, and is scoped to the acting tenant. Records
//! bound to other tenants are invisible: operations report
//! [`IdentityError::NotFound`] for them exactly as for records that do
//! not exist.

use rusqlite::params;

use crate::context::assert_authorized;
use crate::identity::{IdentityError, IdentityRecord, StaffId, StaffRole, TenantId};
use crate::store::{now_ns, StoreTxn};

/// Parameters for [`create_identity`].
#[derive(Debug, Clone)]
pub struct NewIdentity {
    /// Staff id for the new record.
    pub staff_id: StaffId,
    /// Role granted to the new record.
    pub role: StaffRole,
    /// External auth subject the record answers for, when known at
    /// creation time.
    pub auth_subject: Option<String>,
}

/// Creates a staff identity bound to the acting tenant.
///
/// # Errors
///
/// Returns [`IdentityError::AlreadyExists`] if the staff id is taken, or
/// a guard error if the caller is not an admin.
pub fn create_identity(
    txn: &StoreTxn<'_>,
    new: &NewIdentity,
) -> Result<IdentityRecord, IdentityError> {
    let ctx = txn.context()?;
    assert_authorized(ctx, &[StaffRole::Admin], None)?;

    let now = now_ns();
    let inserted = txn.raw().execute(
        "INSERT OR IGNORE INTO staff_identities \
         (staff_id, tenant_id, role, active, auth_subject, created_at_ns, updated_at_ns) \
         VALUES (?1, ?2, ?3, 1, ?4, ?5, ?5)",
        params![
            new.staff_id.as_str(),
            ctx.tenant_id.as_str(),
            new.role.as_str(),
            new.auth_subject,
            now,
        ],
    )?;
    if inserted == 0 {
        return Err(IdentityError::AlreadyExists {
            staff_id: new.staff_id.clone(),
        });
    }

    tracing::info!(
        staff_id = %new.staff_id,
        tenant_id = %ctx.tenant_id,
        role = %new.role,
        "created staff identity"
    );

    Ok(IdentityRecord {
        staff_id: new.staff_id.clone(),
        tenant_id: Some(ctx.tenant_id.clone()),
        role: new.role,
        active: true,
        auth_subject: new.auth_subject.clone(),
        created_at_ns: now,
        updated_at_ns: now,
    })
}

/// Deactivates a staff identity bound to the acting tenant.
///
/// Deactivation is terminal in this surface; records are never deleted
/// and never reactivated here, so ledger rows keep a resolvable
/// acting-staff reference.
///
/// # Errors
///
/// Returns [`IdentityError::NotFound`] if no record with this staff id
/// is bound to the acting tenant.
pub fn deactivate_identity(txn: &StoreTxn<'_>, staff_id: &StaffId) -> Result<(), IdentityError> {
    let ctx = txn.context()?;
    assert_authorized(ctx, &[StaffRole::Admin], None)?;

    let updated = txn.raw().execute(
        "UPDATE staff_identities SET active = 0, updated_at_ns = ?1 \
         WHERE staff_id = ?2 AND tenant_id = ?3",
        params![now_ns(), staff_id.as_str(), ctx.tenant_id.as_str()],
    )?;
    if updated == 0 {
        return Err(IdentityError::NotFound);
    }

    tracing::info!(
        staff_id = %staff_id,
        tenant_id = %ctx.tenant_id,
        "deactivated staff identity"
    );
    Ok(())
}

/// Binds an unbound staff identity to the acting tenant.
///
/// Only records with no tenant binding are eligible. A record already
/// bound to the acting tenant is refused with
/// [`IdentityError::AlreadyBound`]; a record bound elsewhere is reported
/// as [`IdentityError::NotFound`]. Moving an actor between tenants is
/// always deactivate-then-recreate, never a rebind.
pub fn bind_tenant(txn: &StoreTxn<'_>, staff_id: &StaffId) -> Result<(), IdentityError> {
    let ctx = txn.context()?;
    assert_authorized(ctx, &[StaffRole::Admin], None)?;

    // Single guarded UPDATE so the unbound check and the bind are one
    // atomic step even outside an exclusive transaction.
    let updated = txn.raw().execute(
        "UPDATE staff_identities SET tenant_id = ?1, updated_at_ns = ?2 \
         WHERE staff_id = ?3 AND tenant_id IS NULL",
        params![ctx.tenant_id.as_str(), now_ns(), staff_id.as_str()],
    )?;
    if updated == 1 {
        tracing::info!(
            staff_id = %staff_id,
            tenant_id = %ctx.tenant_id,
            "bound staff identity to tenant"
        );
        return Ok(());
    }

    // Distinguish "already bound here" from everything else without
    // exposing other tenants' records.
    let bound_here: bool = txn.raw().query_row(
        "SELECT COUNT(*) FROM staff_identities WHERE staff_id = ?1 AND tenant_id = ?2",
        params![staff_id.as_str(), ctx.tenant_id.as_str()],
        |row| row.get::<_, i64>(0).map(|n| n > 0),
    )?;
    if bound_here {
        return Err(IdentityError::AlreadyBound {
            staff_id: staff_id.clone(),
            tenant_id: ctx.tenant_id.clone(),
        });
    }
    Err(IdentityError::NotFound)
}
