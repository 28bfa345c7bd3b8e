//! Read-only rating-session input rows.
//!
//! Rating sessions are written by the upstream play-tracking workflow;
//! this crate only reads them. A session becomes eligible for point
//! accrual once `closed_at_ns` is set, and its id doubles as the
//! accrual's idempotency key, which is what makes the close-then-accrue
//! workflow recoverable: the ledger either has an entry for the session
//! id or it does not.

use rusqlite::{params, OptionalExtension};

use crate::identity::TenantId;
use crate::ledger::PlayerId;
use crate::store::StoreTxn;

/// Identifier of a rating session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    /// Wraps a raw session identifier.
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

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One rating-session row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatingSession {
    /// Session identifier, unique platform-wide.
    pub session_id: SessionId,
    /// Tenant the session was played under.
    pub tenant_id: TenantId,
    /// Player the session was rated for.
    pub player_id: PlayerId,
    /// Points the session earned, computed upstream.
    pub earned_points: i64,
    /// Close timestamp; `None` while the session is still open.
    pub closed_at_ns: Option<i64>,
}

impl RatingSession {
    /// Whether the upstream workflow has closed this session.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed_at_ns.is_some()
    }
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RatingSession> {
    Ok(RatingSession {
        session_id: SessionId::new(row.get::<_, String>(0)?),
        tenant_id: TenantId::new(row.get::<_, String>(1)?),
        player_id: PlayerId::new(row.get::<_, String>(2)?),
        earned_points: row.get(3)?,
        closed_at_ns: row.get(4)?,
    })
}

/// Loads one session within a tenant.
///
/// # Errors
///
/// Returns a database error; an absent row is `Ok(None)`.
pub fn load_session(
    txn: &StoreTxn<'_>,
    tenant_id: &TenantId,
    session_id: &SessionId,
) -> Result<Option<RatingSession>, rusqlite::Error> {
    txn.raw()
        .query_row(
            "SELECT session_id, tenant_id, player_id, earned_points, closed_at_ns \
             FROM rating_sessions WHERE tenant_id = ?1 AND session_id = ?2",
            params![tenant_id.as_str(), session_id.as_str()],
            session_from_row,
        )
        .optional()
}

/// Finds closed sessions with no matching ledger entry, oldest close
/// first. This is the recovery sweep's work queue.
///
/// # Errors
///
/// Returns a database error.
pub fn unaccrued_closed_sessions(
    txn: &StoreTxn<'_>,
    tenant_id: &TenantId,
    limit: usize,
) -> Result<Vec<RatingSession>, rusqlite::Error> {
    let mut stmt = txn.raw().prepare(
        "SELECT s.session_id, s.tenant_id, s.player_id, s.earned_points, s.closed_at_ns \
         FROM rating_sessions s \
         WHERE s.tenant_id = ?1 AND s.closed_at_ns IS NOT NULL \
           AND NOT EXISTS ( \
             SELECT 1 FROM point_ledger l WHERE l.idempotency_key = s.session_id \
           ) \
         ORDER BY s.closed_at_ns ASC LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(
            params![
                tenant_id.as_str(),
                i64::try_from(limit).unwrap_or(i64::MAX)
            ],
            session_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
