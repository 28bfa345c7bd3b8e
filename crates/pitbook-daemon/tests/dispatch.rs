//! End-to-end dispatch tests: both staff commands, the balance query,
//! rate limiting, and denial metrics.

use std::sync::Arc;

use pitbook_core::context::{GuardError, ServiceAccount, ServiceAccountRegistry};
use pitbook_core::identity::{StaffId, StaffRole, TenantId};
use pitbook_core::ledger::{load_balance, PlayerId};
use pitbook_core::sessions::SessionId;
use pitbook_core::store::{Store, StoreError};
use pitbook_core::testkit;
use pitbook_core::token::TokenMinter;
use pitbook_daemon::dispatch::{
    DispatchError, Dispatcher, ManualRewardCommand, ManualRewardReason, RecoverAccrualCommand,
    SessionClosedCommand,
};
use pitbook_daemon::metrics::{new_shared_registry, SharedMetricsRegistry};
use pitbook_daemon::rate_limit::{RateLimitConfig, RateLimiter};
use pitbook_daemon::recovery::RecoveryCoordinator;

const TENANT: &str = "lucky-star";
const OTHER_TENANT: &str = "golden-gate";
const SUPER_SUBJECT: &str = "oidc|super-1";
const FLOOR_SUBJECT: &str = "oidc|floor-1";
const SERVICE_ACCOUNT: &str = "accrual-recovery";

// 2025-03-10T10:00:00Z.
const CLOSE_NS: i64 = 1_741_600_800 * 1_000_000_000;

struct Harness {
    store: Arc<Store>,
    dispatcher: Dispatcher,
    minter: TokenMinter,
    metrics: SharedMetricsRegistry,
}

fn harness() -> Harness {
    harness_with_limit(30)
}

fn harness_with_limit(max_requests: u32) -> Harness {
    let store = Arc::new(Store::in_memory().expect("open in-memory store"));
    seed_defaults(&store);
    let metrics = new_shared_registry().expect("register metrics");
    let registry = ServiceAccountRegistry::new([ServiceAccount {
        name: SERVICE_ACCOUNT.to_string(),
        tenant_id: TenantId::new(TENANT),
        role: StaffRole::Supervisor,
    }]);
    let recovery = RecoveryCoordinator::new(
        Arc::clone(&store),
        registry,
        SERVICE_ACCOUNT,
        64,
        Arc::clone(&metrics),
    );
    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        testkit::test_minter(),
        RateLimiter::new(RateLimitConfig {
            max_requests,
            window_secs: 60,
            ..RateLimitConfig::default()
        }),
        recovery,
        Arc::clone(&metrics),
    );
    Harness {
        store,
        dispatcher,
        minter: testkit::test_minter(),
        metrics,
    }
}

fn seed_defaults(store: &Store) {
    let tenant = TenantId::new(TENANT);
    testkit::seed_tenant(store, &tenant, 360);
    testkit::seed_tier_policy(
        store,
        &tenant,
        &[("member", 0), ("silver", 1_000), ("gold", 5_000)],
    );
    testkit::seed_staff(
        store,
        &tenant,
        &StaffId::new("staff-super"),
        StaffRole::Supervisor,
        SUPER_SUBJECT,
    );
    testkit::seed_staff(
        store,
        &tenant,
        &StaffId::new("staff-floor"),
        StaffRole::Floor,
        FLOOR_SUBJECT,
    );
    testkit::seed_player(store, &tenant, &PlayerId::new("p-1"), 100, 100, "member");
}

fn seed_closed_session(store: &Store, session: &str, player: &str, earned: i64) {
    testkit::seed_session(
        store,
        &TenantId::new(TENANT),
        &SessionId::new(session),
        &PlayerId::new(player),
        earned,
        Some(CLOSE_NS),
    );
}

fn close_cmd(harness: &Harness, subject: &str, session: &str) -> SessionClosedCommand {
    SessionClosedCommand {
        token: testkit::staff_token(&harness.minter, subject),
        session_id: SessionId::new(session),
    }
}

fn reward_cmd(harness: &Harness, subject: &str, amount: i64) -> ManualRewardCommand {
    ManualRewardCommand {
        token: testkit::staff_token(&harness.minter, subject),
        claimed_tenant_id: None,
        player_id: PlayerId::new("p-1"),
        amount,
        reason: ManualRewardReason::ManualBonus,
    }
}

fn balance_of(store: &Store, player: &str) -> i64 {
    store
        .with_read_txn(|txn| load_balance(txn, &TenantId::new(TENANT), &PlayerId::new(player)))
        .unwrap()
        .expect("balance row exists")
        .balance
}

fn entry_count(store: &Store) -> i64 {
    store
        .with_read_txn(|txn| {
            txn.raw()
                .query_row("SELECT COUNT(*) FROM point_ledger", [], |row| row.get(0))
                .map_err(StoreError::from)
        })
        .unwrap()
}

#[test]
fn session_closed_accrues_earned_points() {
    let h = harness();
    seed_closed_session(&h.store, "s-1", "p-1", 25);

    // Any active role may accrue a close, floor staff included.
    let outcome = h
        .dispatcher
        .session_closed(&close_cmd(&h, FLOOR_SUBJECT, "s-1"))
        .expect("accrual issues");

    assert!(!outcome.replayed);
    assert_eq!(outcome.balance_after, 125);
    assert_eq!(balance_of(&h.store, "p-1"), 125);
    assert_eq!(entry_count(&h.store), 1);
}

#[test]
fn session_closed_replays_on_second_dispatch() {
    let h = harness();
    seed_closed_session(&h.store, "s-1", "p-1", 25);

    let first = h
        .dispatcher
        .session_closed(&close_cmd(&h, FLOOR_SUBJECT, "s-1"))
        .expect("first dispatch issues");
    let second = h
        .dispatcher
        .session_closed(&close_cmd(&h, SUPER_SUBJECT, "s-1"))
        .expect("second dispatch replays");

    assert!(second.replayed);
    assert_eq!(second.entry_id, first.entry_id);
    assert_eq!(balance_of(&h.store, "p-1"), 125);
    assert_eq!(entry_count(&h.store), 1);

    let metrics = h.metrics.daemon_metrics();
    assert_eq!(metrics.issuance_count("session_accrual", "issued"), 1.0);
    assert_eq!(metrics.issuance_count("session_accrual", "replayed"), 1.0);
}

#[test]
fn open_sessions_cannot_accrue() {
    let h = harness();
    testkit::seed_session(
        &h.store,
        &TenantId::new(TENANT),
        &SessionId::new("s-open"),
        &PlayerId::new("p-1"),
        25,
        None,
    );

    let err = h
        .dispatcher
        .session_closed(&close_cmd(&h, FLOOR_SUBJECT, "s-open"))
        .unwrap_err();

    assert!(matches!(err, DispatchError::SessionStillOpen { .. }));
    assert_eq!(entry_count(&h.store), 0);
}

#[test]
fn unknown_sessions_are_not_found() {
    let h = harness();

    let err = h
        .dispatcher
        .session_closed(&close_cmd(&h, FLOOR_SUBJECT, "s-missing"))
        .unwrap_err();

    assert!(matches!(err, DispatchError::SessionNotFound { .. }));
}

#[test]
fn sessions_in_other_tenants_are_invisible() {
    let h = harness();
    testkit::seed_session(
        &h.store,
        &TenantId::new(OTHER_TENANT),
        &SessionId::new("gg-s-1"),
        &PlayerId::new("gg-p-1"),
        25,
        Some(CLOSE_NS),
    );

    let err = h
        .dispatcher
        .session_closed(&close_cmd(&h, FLOOR_SUBJECT, "gg-s-1"))
        .unwrap_err();

    assert!(matches!(err, DispatchError::SessionNotFound { .. }));
}

#[test]
fn manual_rewards_require_supervisor_or_admin() {
    let h = harness();

    let err = h
        .dispatcher
        .manual_reward(&reward_cmd(&h, FLOOR_SUBJECT, 50))
        .unwrap_err();
    assert!(matches!(err, DispatchError::Guard(GuardError::Forbidden { .. })));
    assert_eq!(
        h.metrics.daemon_metrics().denial_count("manual_reward", "forbidden"),
        1.0
    );

    let outcome = h
        .dispatcher
        .manual_reward(&reward_cmd(&h, SUPER_SUBJECT, 50))
        .expect("supervisor may reward");
    assert_eq!(outcome.balance_after, 150);
}

#[test]
fn identical_rewards_replay_within_the_gaming_day() {
    let h = harness();

    let first = h
        .dispatcher
        .manual_reward(&reward_cmd(&h, SUPER_SUBJECT, 50))
        .expect("first reward issues");
    let second = h
        .dispatcher
        .manual_reward(&reward_cmd(&h, SUPER_SUBJECT, 50))
        .expect("second reward replays");

    assert!(!first.replayed);
    assert!(second.replayed);
    assert_eq!(second.entry_id, first.entry_id);
    assert_eq!(balance_of(&h.store, "p-1"), 150);
    assert_eq!(entry_count(&h.store), 1);
}

#[test]
fn distinct_amounts_are_distinct_rewards() {
    let h = harness();

    h.dispatcher
        .manual_reward(&reward_cmd(&h, SUPER_SUBJECT, 50))
        .expect("first reward issues");
    h.dispatcher
        .manual_reward(&reward_cmd(&h, SUPER_SUBJECT, 75))
        .expect("second reward issues");

    assert_eq!(balance_of(&h.store, "p-1"), 225);
    assert_eq!(entry_count(&h.store), 2);
}

#[test]
fn rate_limit_denies_excess_rewards() {
    let h = harness_with_limit(2);

    h.dispatcher
        .manual_reward(&reward_cmd(&h, SUPER_SUBJECT, 10))
        .expect("first reward issues");
    h.dispatcher
        .manual_reward(&reward_cmd(&h, SUPER_SUBJECT, 20))
        .expect("second reward issues");
    let err = h
        .dispatcher
        .manual_reward(&reward_cmd(&h, SUPER_SUBJECT, 30))
        .unwrap_err();

    assert!(matches!(
        &err,
        DispatchError::RateLimited { staff_id } if staff_id.as_str() == "staff-super"
    ));
    assert_eq!(entry_count(&h.store), 2);
    assert_eq!(
        h.metrics.daemon_metrics().denial_count("manual_reward", "rate_limited"),
        1.0
    );
}

#[test]
fn claimed_foreign_tenant_is_refused() {
    let h = harness();

    let mut cmd = reward_cmd(&h, SUPER_SUBJECT, 50);
    cmd.claimed_tenant_id = Some(TenantId::new(OTHER_TENANT));
    let err = h.dispatcher.manual_reward(&cmd).unwrap_err();

    assert!(matches!(
        err,
        DispatchError::Guard(GuardError::TenantMismatch { .. })
    ));
    assert_eq!(entry_count(&h.store), 0);
    assert_eq!(
        h.metrics.daemon_metrics().denial_count("manual_reward", "tenant_mismatch"),
        1.0
    );
}

#[test]
fn tampered_tokens_are_refused() {
    let h = harness();

    let mut cmd = reward_cmd(&h, SUPER_SUBJECT, 50);
    cmd.token.push('x');
    let err = h.dispatcher.manual_reward(&cmd).unwrap_err();

    assert!(matches!(err, DispatchError::Context(_)));
    assert_eq!(entry_count(&h.store), 0);
    assert_eq!(
        h.metrics.daemon_metrics().denial_count("manual_reward", "establishment"),
        1.0
    );
}

#[test]
fn balance_query_reads_without_writing() {
    let h = harness();
    let token = testkit::staff_token(&h.minter, FLOOR_SUBJECT);

    let row = h
        .dispatcher
        .player_balance(&token, None, &PlayerId::new("p-1"))
        .expect("query succeeds")
        .expect("balance row exists");
    assert_eq!(row.balance, 100);
    assert_eq!(row.tier, "member");

    assert!(h
        .dispatcher
        .player_balance(&token, None, &PlayerId::new("ghost"))
        .expect("query succeeds")
        .is_none());
}

#[test]
fn balance_query_rejects_foreign_tenant_claims() {
    let h = harness();
    let token = testkit::staff_token(&h.minter, FLOOR_SUBJECT);

    let err = h
        .dispatcher
        .player_balance(
            &token,
            Some(&TenantId::new(OTHER_TENANT)),
            &PlayerId::new("p-1"),
        )
        .unwrap_err();

    assert!(matches!(
        err,
        DispatchError::Guard(GuardError::TenantMismatch { .. })
    ));
}

#[test]
fn recover_accrual_dispatches_on_the_service_lane() {
    let h = harness();
    seed_closed_session(&h.store, "s-1", "p-1", 25);

    let outcome = h
        .dispatcher
        .recover_accrual(&RecoverAccrualCommand {
            session_id: SessionId::new("s-1"),
        })
        .expect("recovery drives the accrual");

    assert!(!outcome.replayed);
    assert_eq!(balance_of(&h.store, "p-1"), 125);
    assert_eq!(entry_count(&h.store), 1);
}
