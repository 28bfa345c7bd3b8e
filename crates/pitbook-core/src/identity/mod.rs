//! Staff identity records and the identity resolver.
//!
//! One identity row exists per human actor. A row is bound to at most one
//! tenant; the binding is nullable until onboarding completes. Records are
//! deactivated on offboarding, never deleted, so ledger history keeps a
//! resolvable acting-staff reference forever.
//!
//! # Resolution Contract
//!
//! [`resolve_identity`] turns verified token claims into an identity row.
//! A staff-id hint embedded in a token is only a lookup aid: the row it
//! names must carry the exact `auth_subject` the token was verified for,
//! otherwise resolution reports [`IdentityError::NotFound`]. A stale or
//! forged hint therefore never grants authority, and a probing caller
//! cannot distinguish "no such staff id" from "not your staff id".
//!
//! # Rebinding
//!
//! A record bound to a tenant never rebinds as a side effect of any other
//! operation. [`admin::bind_tenant`] binds unbound records only; moving an
//! actor between tenants is deactivate-then-recreate.

use rusqlite::{params, OptionalExtension};
use thiserror::Error;

use crate::context::GuardError;
use crate::store::StoreTxn;
use crate::token::TokenClaims;

pub mod admin;

/// Identifier of a tenant (one casino property sharing the backing store).
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Wraps a raw tenant identifier.
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

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a staff identity record.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct StaffId(String);

impl StaffId {
    /// Wraps a raw staff identifier.
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

impl std::fmt::Display for StaffId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Role carried by a staff identity record.
///
/// Stored as a lowercase string column; unknown values are rejected at read
/// time (fail-closed) rather than mapped to a default role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StaffRole {
    /// Base floor staff (dealers, attendants).
    Floor,
    /// Pit supervisor.
    Supervisor,
    /// Property administrator.
    Admin,
}

impl StaffRole {
    /// Returns the canonical column value for this role.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Floor => "floor",
            Self::Supervisor => "supervisor",
            Self::Admin => "admin",
        }
    }

    /// Parses a stored column value.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::UnknownRole`] for any unrecognized value.
    pub fn parse(value: &str) -> Result<Self, IdentityError> {
        match value {
            "floor" => Ok(Self::Floor),
            "supervisor" => Ok(Self::Supervisor),
            "admin" => Ok(Self::Admin),
            other => Err(IdentityError::UnknownRole {
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for StaffRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One staff identity row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRecord {
    /// Primary key.
    pub staff_id: StaffId,

    /// Tenant binding; `None` until onboarding binds the record.
    pub tenant_id: Option<TenantId>,

    /// Role granted to this actor.
    pub role: StaffRole,

    /// Whether the record is active. Deactivated records fail resolution.
    pub active: bool,

    /// External auth subject this record answers for (unique when present).
    pub auth_subject: Option<String>,

    /// Creation timestamp, nanoseconds since the Unix epoch.
    pub created_at_ns: i64,

    /// Last update timestamp, nanoseconds since the Unix epoch.
    pub updated_at_ns: i64,
}

/// Errors produced by identity resolution and administration.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// No active record answers for the verified auth subject.
    #[error("cannot authenticate acting staff: no matching identity record")]
    NotFound,

    /// The matched record exists but has been deactivated.
    #[error("cannot authenticate acting staff: identity {staff_id} is deactivated")]
    Inactive {
        /// The deactivated staff id.
        staff_id: StaffId,
    },

    /// The matched record is active but carries no tenant binding, so no
    /// authority context can be derived from it.
    #[error("identity {staff_id} has no tenant binding")]
    Unbound {
        /// The unbound staff id.
        staff_id: StaffId,
    },

    /// A stored role column held a value outside the known set.
    #[error("unknown staff role in store: {value:?}")]
    UnknownRole {
        /// The offending column value.
        value: String,
    },

    /// Attempted to bind a record that is already bound to a tenant.
    #[error("identity {staff_id} is already bound to tenant {tenant_id}; rebinding is deactivate-then-recreate")]
    AlreadyBound {
        /// The staff id whose binding was refused.
        staff_id: StaffId,
        /// The tenant the record is currently bound to.
        tenant_id: TenantId,
    },

    /// Attempted to create a record whose staff id already exists.
    #[error("identity {staff_id} already exists")]
    AlreadyExists {
        /// The duplicate staff id.
        staff_id: StaffId,
    },

    /// An administrative operation failed its authority check.
    #[error(transparent)]
    Guard(#[from] GuardError),

    /// Database error from the backing store.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

const SELECT_COLUMNS: &str =
    "staff_id, tenant_id, role, active, auth_subject, created_at_ns, updated_at_ns";

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        staff_id: row.get(0)?,
        tenant_id: row.get(1)?,
        role: row.get(2)?,
        active: row.get::<_, i64>(3)? != 0,
        auth_subject: row.get(4)?,
        created_at_ns: row.get(5)?,
        updated_at_ns: row.get(6)?,
    })
}

/// Row image before role parsing; keeps rusqlite's error type out of the
/// role fail-closed path.
struct RawRecord {
    staff_id: String,
    tenant_id: Option<String>,
    role: String,
    active: bool,
    auth_subject: Option<String>,
    created_at_ns: i64,
    updated_at_ns: i64,
}

impl RawRecord {
    fn into_record(self) -> Result<IdentityRecord, IdentityError> {
        Ok(IdentityRecord {
            staff_id: StaffId::new(self.staff_id),
            tenant_id: self.tenant_id.map(TenantId::new),
            role: StaffRole::parse(&self.role)?,
            active: self.active,
            auth_subject: self.auth_subject,
            created_at_ns: self.created_at_ns,
            updated_at_ns: self.updated_at_ns,
        })
    }
}

fn load_by_staff_id(
    txn: &StoreTxn<'_>,
    staff_id: &StaffId,
) -> Result<Option<RawRecord>, rusqlite::Error> {
    txn.raw()
        .query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM staff_identities WHERE staff_id = ?1"),
            params![staff_id.as_str()],
            record_from_row,
        )
        .optional()
}

fn load_by_subject(
    txn: &StoreTxn<'_>,
    auth_subject: &str,
) -> Result<Option<RawRecord>, rusqlite::Error> {
    txn.raw()
        .query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM staff_identities WHERE auth_subject = ?1"),
            params![auth_subject],
            record_from_row,
        )
        .optional()
}

/// Resolves verified token claims to an identity record.
///
/// The record is always re-queried from the backing store inside the
/// caller's transaction; nothing embedded in the token is trusted beyond
/// the verified subject. With a staff-id hint, the named row must answer
/// for the token's subject. Without one, lookup is keyed purely on the
/// subject.
///
/// # Errors
///
/// - [`IdentityError::NotFound`] if no row matches (including a hint whose
///   row answers for a different subject)
/// - [`IdentityError::Inactive`] if the matched row is deactivated
pub fn resolve_identity(
    txn: &StoreTxn<'_>,
    claims: &TokenClaims,
) -> Result<IdentityRecord, IdentityError> {
    let raw = match &claims.staff_hint {
        Some(hint) => {
            let Some(raw) = load_by_staff_id(txn, hint)? else {
                return Err(IdentityError::NotFound);
            };
            // The hint is a lookup aid only: the row must answer for the
            // subject the token signature was verified against.
            if raw.auth_subject.as_deref() != Some(claims.subject.as_str()) {
                tracing::warn!(
                    staff_hint = %hint,
                    "staff-id hint does not answer for the verified subject"
                );
                return Err(IdentityError::NotFound);
            }
            raw
        }
        None => match load_by_subject(txn, &claims.subject)? {
            Some(raw) => raw,
            None => return Err(IdentityError::NotFound),
        },
    };

    let record = raw.into_record()?;
    if !record.active {
        return Err(IdentityError::Inactive {
            staff_id: record.staff_id,
        });
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_canonical_values() {
        for role in [StaffRole::Floor, StaffRole::Supervisor, StaffRole::Admin] {
            assert_eq!(StaffRole::parse(role.as_str()).unwrap(), role);
        }
    }

    #[test]
    fn role_parse_rejects_unknown_values() {
        let err = StaffRole::parse("pit-boss").unwrap_err();
        assert!(matches!(err, IdentityError::UnknownRole { value } if value == "pit-boss"));
    }

    #[test]
    fn role_parse_is_case_sensitive() {
        assert!(StaffRole::parse("Admin").is_err());
    }
}
