//! Tier ladder evaluation.
//!
//! Tier thresholds are external policy input: the surrounding platform
//! seeds `tier_policies` and this module only reads it. The engine needs
//! nothing beyond numeric thresholds; tier names are opaque strings
//! chosen by each tenant.

use rusqlite::params;
use thiserror::Error;

use crate::identity::TenantId;
use crate::store::StoreTxn;

/// Tier assigned to players below every configured threshold, and to all
/// players of tenants with no ladder at all.
pub const DEFAULT_TIER: &str = "member";

/// Errors from policy evaluation.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Database error from the backing store.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// A tier placement with progress toward the next rung.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierAssignment {
    /// Tier name the lifetime points place the player in.
    pub tier: String,
    /// Percent progress toward the next tier, 0 to 100. 100 at the top
    /// of the ladder.
    pub progress: i64,
}

/// Evaluates a tenant's tier ladder for a lifetime point total.
///
/// Thresholds are read ascending; the player lands on the highest rung
/// whose minimum is covered. Tenants without a ladder get
/// [`DEFAULT_TIER`] with zero progress.
///
/// # Errors
///
/// Returns a database error from reading the policy table.
pub fn tier_for(
    txn: &StoreTxn<'_>,
    tenant_id: &TenantId,
    lifetime_points: i64,
) -> Result<TierAssignment, PolicyError> {
    // The tier tiebreak keeps duplicate thresholds deterministic.
    let mut stmt = txn.raw().prepare(
        "SELECT tier, min_lifetime_points FROM tier_policies \
         WHERE tenant_id = ?1 ORDER BY min_lifetime_points ASC, tier ASC",
    )?;
    let ladder = stmt
        .query_map(params![tenant_id.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    if ladder.is_empty() {
        return Ok(TierAssignment {
            tier: DEFAULT_TIER.to_string(),
            progress: 0,
        });
    }

    let mut current: Option<(&str, i64)> = None;
    let mut next_min: Option<i64> = None;
    for (tier, min) in &ladder {
        if *min <= lifetime_points {
            current = Some((tier.as_str(), *min));
        } else {
            next_min = Some(*min);
            break;
        }
    }

    let (tier, current_min) = match current {
        Some((tier, min)) => (tier.to_string(), min),
        // Below the whole ladder: progressing from zero toward the
        // first rung.
        None => (DEFAULT_TIER.to_string(), 0),
    };
    let progress = match next_min {
        Some(next) => span_progress(current_min, next, lifetime_points),
        None => 100,
    };
    Ok(TierAssignment { tier, progress })
}

fn span_progress(current_min: i64, next_min: i64, lifetime_points: i64) -> i64 {
    let span = next_min.saturating_sub(current_min);
    if span <= 0 {
        // Duplicate thresholds collapse the span; the rung is complete.
        return 100;
    }
    let covered = lifetime_points.saturating_sub(current_min);
    let pct = (i128::from(covered) * 100) / i128::from(span);
    i64::try_from(pct.clamp(0, 100)).unwrap_or(100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Store, StoreError};

    fn store_with_ladder(rows: &[(&str, i64)]) -> Store {
        let store = Store::in_memory().unwrap();
        store
            .with_write_txn(|txn| {
                for (tier, min) in rows {
                    txn.raw().execute(
                        "INSERT INTO tier_policies (tenant_id, tier, min_lifetime_points) \
                         VALUES ('lucky-star', ?1, ?2)",
                        params![tier, min],
                    )?;
                }
                Ok::<_, StoreError>(())
            })
            .unwrap();
        store
    }

    fn assignment(store: &Store, lifetime: i64) -> TierAssignment {
        store
            .with_read_txn(|txn| {
                tier_for(txn, &TenantId::new("lucky-star"), lifetime)
                    .map_err(|PolicyError::Database(e)| StoreError::Database(e))
            })
            .unwrap()
    }

    #[test]
    fn empty_ladder_gives_default_tier() {
        let store = store_with_ladder(&[]);
        let got = assignment(&store, 10_000);
        assert_eq!(got.tier, DEFAULT_TIER);
        assert_eq!(got.progress, 0);
    }

    #[test]
    fn below_first_rung_progresses_from_zero() {
        let store = store_with_ladder(&[("silver", 1_000), ("gold", 5_000)]);
        let got = assignment(&store, 250);
        assert_eq!(got.tier, DEFAULT_TIER);
        assert_eq!(got.progress, 25);
    }

    #[test]
    fn exact_threshold_lands_on_the_rung() {
        let store = store_with_ladder(&[("silver", 1_000), ("gold", 5_000)]);
        let got = assignment(&store, 1_000);
        assert_eq!(got.tier, "silver");
        assert_eq!(got.progress, 0);
    }

    #[test]
    fn midway_between_rungs() {
        let store = store_with_ladder(&[("silver", 1_000), ("gold", 5_000)]);
        let got = assignment(&store, 3_000);
        assert_eq!(got.tier, "silver");
        assert_eq!(got.progress, 50);
    }

    #[test]
    fn top_of_ladder_is_complete() {
        let store = store_with_ladder(&[("silver", 1_000), ("gold", 5_000)]);
        let got = assignment(&store, 9_999_999);
        assert_eq!(got.tier, "gold");
        assert_eq!(got.progress, 100);
    }

    #[test]
    fn duplicate_thresholds_resolve_to_the_later_rung() {
        let store = store_with_ladder(&[("silver", 1_000), ("silver-elite", 1_000)]);
        let got = assignment(&store, 1_000);
        assert_eq!(got.tier, "silver-elite");
        assert_eq!(got.progress, 100);
    }

    #[test]
    fn ladders_are_tenant_scoped() {
        let store = store_with_ladder(&[("silver", 1_000)]);
        let got = store
            .with_read_txn(|txn| {
                tier_for(txn, &TenantId::new("golden-gate"), 50_000)
                    .map_err(|PolicyError::Database(e)| StoreError::Database(e))
            })
            .unwrap();
        assert_eq!(got.tier, DEFAULT_TIER);
    }
}
