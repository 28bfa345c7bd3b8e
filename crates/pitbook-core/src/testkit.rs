//! Test support: store seeding and token helpers.
//!
//! Compiled only under `cfg(test)` or the `testkit` cargo feature;
//! release artifacts carry neither these helpers nor [`TEST_TOKEN_KEY`].
//! Production code never writes the platform-owned tables
//! (`tenant_settings`, `tier_policies`, `rating_sessions`), so tests
//! seed them here directly.

use crate::identity::{StaffId, StaffRole, TenantId};
use crate::ledger::PlayerId;
use crate::sessions::SessionId;
use crate::store::{now_ns, Store, StoreError};
use crate::token::{TokenClaims, TokenMinter};

/// Signing key used by every test minter. Exactly the minimum length.
pub const TEST_TOKEN_KEY: &[u8] = b"pitbook-test-signing-key-0123456";

/// Builds a minter over [`TEST_TOKEN_KEY`].
///
/// # Panics
///
/// Panics if the key is rejected (test-only).
#[must_use]
pub fn test_minter() -> TokenMinter {
    TokenMinter::new(TEST_TOKEN_KEY).expect("test key meets the minimum length")
}

/// Mints an unexpiring hint-free token for `subject`.
///
/// # Panics
///
/// Panics if minting fails (test-only).
#[must_use]
pub fn staff_token(minter: &TokenMinter, subject: &str) -> String {
    mint_token(minter, subject, None, None)
}

/// Mints an unexpiring token carrying the given lookup hints.
///
/// # Panics
///
/// Panics if minting fails (test-only).
#[must_use]
pub fn mint_token(
    minter: &TokenMinter,
    subject: &str,
    staff_hint: Option<StaffId>,
    tenant_hint: Option<TenantId>,
) -> String {
    let claims = TokenClaims {
        subject: subject.to_string(),
        staff_hint,
        tenant_hint,
        issued_at_ns: 0,
        expires_at_ns: i64::MAX,
    };
    minter.mint(&claims).expect("test claims serialize")
}

/// Seeds a tenant-settings row with the given day-start offset.
///
/// # Panics
///
/// Panics if the insert fails (test-only).
pub fn seed_tenant(store: &Store, tenant_id: &TenantId, day_start_minutes: i64) {
    store
        .with_write_txn(|txn| {
            txn.raw()
                .execute(
                    "INSERT INTO tenant_settings (tenant_id, day_start_minutes) VALUES (?1, ?2)",
                    rusqlite::params![tenant_id.as_str(), day_start_minutes],
                )
                .map_err(StoreError::from)
        })
        .expect("seed tenant_settings");
}

/// Seeds an active staff identity bound to `tenant_id`.
///
/// # Panics
///
/// Panics if the insert fails (test-only).
pub fn seed_staff(
    store: &Store,
    tenant_id: &TenantId,
    staff_id: &StaffId,
    role: StaffRole,
    auth_subject: &str,
) {
    seed_staff_row(store, Some(tenant_id), staff_id, role, auth_subject, true);
}

/// Seeds a staff identity with explicit binding and active flag.
///
/// # Panics
///
/// Panics if the insert fails (test-only).
pub fn seed_staff_row(
    store: &Store,
    tenant_id: Option<&TenantId>,
    staff_id: &StaffId,
    role: StaffRole,
    auth_subject: &str,
    active: bool,
) {
    let now = now_ns();
    store
        .with_write_txn(|txn| {
            txn.raw()
                .execute(
                    "INSERT INTO staff_identities \
                     (staff_id, tenant_id, role, active, auth_subject, created_at_ns, \
                      updated_at_ns) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        staff_id.as_str(),
                        tenant_id.map(TenantId::as_str),
                        role.as_str(),
                        active,
                        auth_subject,
                        now,
                        now,
                    ],
                )
                .map_err(StoreError::from)
        })
        .expect("seed staff_identities");
}

/// Seeds a player balance row.
///
/// # Panics
///
/// Panics if the insert fails (test-only).
pub fn seed_player(
    store: &Store,
    tenant_id: &TenantId,
    player_id: &PlayerId,
    balance: i64,
    lifetime_points: i64,
    tier: &str,
) {
    store
        .with_write_txn(|txn| {
            txn.raw()
                .execute(
                    "INSERT INTO player_balances \
                     (player_id, tenant_id, balance, lifetime_points, tier, tier_progress, \
                      updated_at_ns) \
                     VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
                    rusqlite::params![
                        player_id.as_str(),
                        tenant_id.as_str(),
                        balance,
                        lifetime_points,
                        tier,
                        now_ns(),
                    ],
                )
                .map_err(StoreError::from)
        })
        .expect("seed player_balances");
}

/// Seeds a tenant's tier ladder from `(tier, min_lifetime_points)` rungs.
///
/// # Panics
///
/// Panics if an insert fails (test-only).
pub fn seed_tier_policy(store: &Store, tenant_id: &TenantId, rungs: &[(&str, i64)]) {
    store
        .with_write_txn(|txn| {
            for (tier, min_lifetime_points) in rungs {
                txn.raw().execute(
                    "INSERT INTO tier_policies (tenant_id, tier, min_lifetime_points) \
                     VALUES (?1, ?2, ?3)",
                    rusqlite::params![tenant_id.as_str(), tier, min_lifetime_points],
                )?;
            }
            Ok::<_, StoreError>(())
        })
        .expect("seed tier_policies");
}

/// Seeds a rating session; `closed_at_ns` of `None` leaves it open.
///
/// # Panics
///
/// Panics if the insert fails (test-only).
pub fn seed_session(
    store: &Store,
    tenant_id: &TenantId,
    session_id: &SessionId,
    player_id: &PlayerId,
    earned_points: i64,
    closed_at_ns: Option<i64>,
) {
    store
        .with_write_txn(|txn| {
            txn.raw()
                .execute(
                    "INSERT INTO rating_sessions \
                     (session_id, tenant_id, player_id, earned_points, closed_at_ns) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![
                        session_id.as_str(),
                        tenant_id.as_str(),
                        player_id.as_str(),
                        earned_points,
                        closed_at_ns,
                    ],
                )
                .map_err(StoreError::from)
        })
        .expect("seed rating_sessions");
}
