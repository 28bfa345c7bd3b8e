//! Recovery coordinator tests: derived workflow state, single-session
//! drives, partial completion, and the sweep.

use std::sync::Arc;

use pitbook_core::context::{ContextError, ServiceAccount, ServiceAccountRegistry};
use pitbook_core::identity::{StaffRole, TenantId};
use pitbook_core::ledger::{load_balance, PlayerId};
use pitbook_core::sessions::{self, SessionId};
use pitbook_core::store::{Store, StoreError, StoreOptions};
use pitbook_core::testkit;
use pitbook_daemon::metrics::{new_shared_registry, SharedMetricsRegistry};
use pitbook_daemon::recovery::{
    workflow_state, AccrualWorkflowState, RecoveryCoordinator, RecoveryError,
};

const TENANT: &str = "lucky-star";
const OTHER_TENANT: &str = "golden-gate";
const SERVICE_ACCOUNT: &str = "accrual-recovery";

// 2025-03-10T10:00:00Z.
const CLOSE_NS: i64 = 1_741_600_800 * 1_000_000_000;

struct Harness {
    store: Arc<Store>,
    coordinator: RecoveryCoordinator,
    metrics: SharedMetricsRegistry,
}

fn harness() -> Harness {
    harness_with_batch(64)
}

fn harness_with_batch(batch_limit: usize) -> Harness {
    let store = Arc::new(Store::in_memory().expect("open in-memory store"));
    seed_defaults(&store);
    let metrics = new_shared_registry().expect("register metrics");
    let coordinator = RecoveryCoordinator::new(
        Arc::clone(&store),
        service_registry(),
        SERVICE_ACCOUNT,
        batch_limit,
        Arc::clone(&metrics),
    );
    Harness {
        store,
        coordinator,
        metrics,
    }
}

fn service_registry() -> ServiceAccountRegistry {
    ServiceAccountRegistry::new([ServiceAccount {
        name: SERVICE_ACCOUNT.to_string(),
        tenant_id: TenantId::new(TENANT),
        role: StaffRole::Supervisor,
    }])
}

// Recovery runs on the service lane, so no staff identities are needed.
fn seed_defaults(store: &Store) {
    let tenant = TenantId::new(TENANT);
    testkit::seed_tenant(store, &tenant, 360);
    testkit::seed_tier_policy(
        store,
        &tenant,
        &[("member", 0), ("silver", 1_000), ("gold", 5_000)],
    );
    testkit::seed_player(store, &tenant, &PlayerId::new("p-1"), 100, 100, "member");
}

fn seed_closed_session(store: &Store, session: &str, player: &str, earned: i64, closed_ns: i64) {
    testkit::seed_session(
        store,
        &TenantId::new(TENANT),
        &SessionId::new(session),
        &PlayerId::new(player),
        earned,
        Some(closed_ns),
    );
}

fn state_of(store: &Store, session_id: &str) -> AccrualWorkflowState {
    store
        .with_read_txn(|txn| {
            let session =
                sessions::load_session(txn, &TenantId::new(TENANT), &SessionId::new(session_id))?
                    .expect("session row exists");
            workflow_state(txn, &session)
        })
        .expect("derive workflow state")
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
fn closed_session_recovers_to_ledger_committed() {
    let h = harness();
    seed_closed_session(&h.store, "s-1", "p-1", 25, CLOSE_NS);
    assert_eq!(
        state_of(&h.store, "s-1"),
        AccrualWorkflowState::UpstreamCommitted
    );

    let outcome = h
        .coordinator
        .recover_session(&SessionId::new("s-1"))
        .expect("drive commits");

    assert!(!outcome.replayed);
    assert_eq!(outcome.balance_after, 125);
    assert_eq!(
        state_of(&h.store, "s-1"),
        AccrualWorkflowState::LedgerCommitted
    );
    assert_eq!(entry_count(&h.store), 1);
    assert_eq!(
        h.metrics.daemon_metrics().recovery_retry_count("recovered"),
        1.0
    );
}

#[test]
fn recovery_replays_a_committed_accrual() {
    let h = harness();
    seed_closed_session(&h.store, "s-1", "p-1", 25, CLOSE_NS);

    let first = h
        .coordinator
        .recover_session(&SessionId::new("s-1"))
        .expect("first drive commits");
    let second = h
        .coordinator
        .recover_session(&SessionId::new("s-1"))
        .expect("second drive replays");

    assert!(second.replayed);
    assert_eq!(second.entry_id, first.entry_id);
    assert_eq!(balance_of(&h.store, "p-1"), 125);
    assert_eq!(entry_count(&h.store), 1);
    assert_eq!(
        h.metrics.daemon_metrics().recovery_retry_count("replayed"),
        1.0
    );
}

#[test]
fn open_sessions_are_upstream_incomplete() {
    let h = harness();
    testkit::seed_session(
        &h.store,
        &TenantId::new(TENANT),
        &SessionId::new("s-open"),
        &PlayerId::new("p-1"),
        25,
        None,
    );
    assert_eq!(state_of(&h.store, "s-open"), AccrualWorkflowState::Started);

    let err = h
        .coordinator
        .recover_session(&SessionId::new("s-open"))
        .unwrap_err();

    assert!(matches!(err, RecoveryError::UpstreamIncomplete { .. }));
    assert_eq!(entry_count(&h.store), 0);
}

#[test]
fn unknown_sessions_are_not_found() {
    let h = harness();

    let err = h
        .coordinator
        .recover_session(&SessionId::new("s-missing"))
        .unwrap_err();

    assert!(matches!(err, RecoveryError::SessionNotFound { .. }));
}

#[test]
fn failed_drive_surfaces_partial_completion() {
    let h = harness();
    // No balance row for this player, so the drive aborts inside the ledger.
    seed_closed_session(&h.store, "s-9", "p-ghost", 40, CLOSE_NS);

    let err = h
        .coordinator
        .recover_session(&SessionId::new("s-9"))
        .unwrap_err();
    let RecoveryError::PartialCompletion {
        player_id,
        idempotency_key,
        ..
    } = err
    else {
        panic!("expected partial completion, got {err}");
    };
    assert_eq!(player_id.as_str(), "p-ghost");
    assert_eq!(idempotency_key.as_str(), "s-9");
    assert_eq!(entry_count(&h.store), 0);
    assert_eq!(h.metrics.daemon_metrics().recovery_retry_count("failed"), 1.0);

    // Once the player exists the retry reuses the same key and lands once.
    testkit::seed_player(
        &h.store,
        &TenantId::new(TENANT),
        &PlayerId::new("p-ghost"),
        0,
        0,
        "member",
    );
    let outcome = h
        .coordinator
        .recover_session(&SessionId::new("s-9"))
        .expect("retry after repair commits");
    assert!(!outcome.replayed);
    assert_eq!(outcome.balance_after, 40);
    assert_eq!(entry_count(&h.store), 1);
}

#[test]
fn sweep_recovers_pending_sessions() {
    let h = harness();
    seed_closed_session(&h.store, "s-pre", "p-1", 5, CLOSE_NS);
    h.coordinator
        .recover_session(&SessionId::new("s-pre"))
        .expect("prime one accrued session");

    seed_closed_session(&h.store, "s-1", "p-1", 10, CLOSE_NS + 1);
    seed_closed_session(&h.store, "s-2", "p-1", 20, CLOSE_NS + 2);
    seed_closed_session(&h.store, "s-3", "p-1", 30, CLOSE_NS + 3);
    testkit::seed_session(
        &h.store,
        &TenantId::new(TENANT),
        &SessionId::new("s-open"),
        &PlayerId::new("p-1"),
        99,
        None,
    );

    let report = h.coordinator.sweep().expect("sweep runs");
    assert_eq!(report.scanned, 3);
    assert_eq!(report.recovered, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(balance_of(&h.store, "p-1"), 165);
    assert_eq!(entry_count(&h.store), 4);

    let report = h.coordinator.sweep().expect("second sweep runs");
    assert_eq!(report.scanned, 0);
}

#[test]
fn sweep_counts_failures_without_aborting() {
    let h = harness();
    seed_closed_session(&h.store, "s-1", "p-1", 10, CLOSE_NS);
    seed_closed_session(&h.store, "s-2", "p-ghost", 10, CLOSE_NS + 1);

    let report = h.coordinator.sweep().expect("sweep runs");

    assert_eq!(report.scanned, 2);
    assert_eq!(report.recovered, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(balance_of(&h.store, "p-1"), 110);
    assert_eq!(entry_count(&h.store), 1);
}

#[test]
fn sweep_respects_the_batch_limit() {
    let h = harness_with_batch(2);
    seed_closed_session(&h.store, "s-1", "p-1", 10, CLOSE_NS);
    seed_closed_session(&h.store, "s-2", "p-1", 20, CLOSE_NS + 1);
    seed_closed_session(&h.store, "s-3", "p-1", 30, CLOSE_NS + 2);

    let report = h.coordinator.sweep().expect("first sweep runs");
    assert_eq!(report.scanned, 2);
    assert_eq!(report.recovered, 2);

    let report = h.coordinator.sweep().expect("second sweep runs");
    assert_eq!(report.scanned, 1);
    assert_eq!(report.recovered, 1);
    assert_eq!(balance_of(&h.store, "p-1"), 160);
}

#[test]
fn sweep_is_tenant_scoped() {
    let h = harness();
    testkit::seed_session(
        &h.store,
        &TenantId::new(OTHER_TENANT),
        &SessionId::new("gg-s-1"),
        &PlayerId::new("gg-p-1"),
        25,
        Some(CLOSE_NS),
    );

    let report = h.coordinator.sweep().expect("sweep runs");

    assert_eq!(report.scanned, 0);
    assert_eq!(entry_count(&h.store), 0);
}

#[test]
fn pending_work_survives_a_restart() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("pitbook.db");
    {
        let store = Store::open(&path, StoreOptions::default()).expect("open store");
        seed_defaults(&store);
        seed_closed_session(&store, "s-1", "p-1", 25, CLOSE_NS);
    }

    // The work queue is derived from durable rows, so a fresh process
    // picks the session up with no handoff state.
    let store = Arc::new(Store::open(&path, StoreOptions::default()).expect("reopen store"));
    let metrics = new_shared_registry().expect("register metrics");
    let coordinator = RecoveryCoordinator::new(
        Arc::clone(&store),
        service_registry(),
        SERVICE_ACCOUNT,
        64,
        metrics,
    );

    let report = coordinator.sweep().expect("sweep runs");
    assert_eq!(report.scanned, 1);
    assert_eq!(report.recovered, 1);
    assert_eq!(balance_of(&store, "p-1"), 125);
}

#[test]
fn unknown_service_account_cannot_sweep() {
    let h = harness();
    let coordinator = RecoveryCoordinator::new(
        Arc::clone(&h.store),
        ServiceAccountRegistry::default(),
        SERVICE_ACCOUNT,
        64,
        Arc::clone(&h.metrics),
    );

    let err = coordinator.sweep().unwrap_err();

    assert!(matches!(
        err,
        RecoveryError::Context(ContextError::UnknownServiceAccount { .. })
    ));
}
