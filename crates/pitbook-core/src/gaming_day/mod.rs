//! Gaming-day boundary computation.
//!
//! A gaming day is the business day ledger entries are bucketed under.
//! It does not roll over at midnight: each tenant configures a start-of-
//! day offset (typically 06:00) and every instant before that offset
//! belongs to the previous calendar date. The computation is pure; the
//! only I/O in this module is [`load_day_start`], which reads the
//! tenant's configured offset.
//!
//! ```text
//!   offset 06:00
//!   ... 05:59:59 ──▶ previous date │ 06:00:00 ──▶ current date ...
//! ```

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use rusqlite::{params, OptionalExtension};
use thiserror::Error;

use crate::identity::TenantId;
use crate::store::StoreTxn;

/// Fallback start-of-day offset in minutes after midnight UTC.
pub const DEFAULT_DAY_START_MINUTES: u16 = 360;

/// Errors from gaming-day configuration.
#[derive(Debug, Error)]
pub enum GamingDayError {
    /// An offset outside one day was supplied or stored.
    #[error("day-start offset {minutes} is outside 0..=1439 minutes")]
    OffsetOutOfRange {
        /// The rejected offset.
        minutes: i64,
    },

    /// Database error while loading tenant settings.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// A validated per-tenant start-of-day offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GamingDayStart {
    minutes: u16,
}

impl GamingDayStart {
    /// Validates an offset in minutes after midnight UTC.
    ///
    /// # Errors
    ///
    /// Returns [`GamingDayError::OffsetOutOfRange`] unless
    /// `0 <= minutes < 1440`.
    pub fn new(minutes: i64) -> Result<Self, GamingDayError> {
        let validated =
            u16::try_from(minutes).map_err(|_| GamingDayError::OffsetOutOfRange { minutes })?;
        if validated >= 1440 {
            return Err(GamingDayError::OffsetOutOfRange { minutes });
        }
        Ok(Self { minutes: validated })
    }

    /// Offset in minutes after midnight UTC.
    #[must_use]
    pub const fn as_minutes(self) -> u16 {
        self.minutes
    }
}

impl Default for GamingDayStart {
    fn default() -> Self {
        Self {
            minutes: DEFAULT_DAY_START_MINUTES,
        }
    }
}

impl std::fmt::Display for GamingDayStart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.minutes / 60, self.minutes % 60)
    }
}

/// Computes the gaming day an instant belongs to.
///
/// The result is the calendar date of `event_utc` shifted back by the
/// day-start offset: an event at 05:59 under a 06:00 start belongs to the
/// previous date, an event at exactly 06:00 to the current one.
#[must_use]
pub fn gaming_day(event_utc: DateTime<Utc>, day_start: GamingDayStart) -> NaiveDate {
    (event_utc - TimeDelta::minutes(i64::from(day_start.as_minutes()))).date_naive()
}

/// [`gaming_day`] over a nanosecond unix timestamp, the form timestamps
/// take in storage columns.
#[must_use]
pub fn gaming_day_ns(event_ns: i64, day_start: GamingDayStart) -> NaiveDate {
    gaming_day(DateTime::from_timestamp_nanos(event_ns), day_start)
}

/// Loads a tenant's configured day-start offset.
///
/// Tenants without a settings row fall back to
/// [`DEFAULT_DAY_START_MINUTES`]. A stored offset outside one day is
/// refused rather than clamped.
///
/// # Errors
///
/// [`GamingDayError::OffsetOutOfRange`] for corrupt stored offsets, or a
/// database error.
pub fn load_day_start(
    txn: &StoreTxn<'_>,
    tenant_id: &TenantId,
) -> Result<GamingDayStart, GamingDayError> {
    let stored: Option<i64> = txn
        .raw()
        .query_row(
            "SELECT day_start_minutes FROM tenant_settings WHERE tenant_id = ?1",
            params![tenant_id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    match stored {
        Some(minutes) => GamingDayStart::new(minutes),
        None => {
            tracing::debug!(
                tenant_id = %tenant_id,
                default_minutes = DEFAULT_DAY_START_MINUTES,
                "tenant has no day-start setting, using default"
            );
            Ok(GamingDayStart::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use proptest::prelude::*;

    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn date(y: i32, mo: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, mo, d).unwrap()
    }

    fn six_am() -> GamingDayStart {
        GamingDayStart::new(360).unwrap()
    }

    #[test]
    fn before_day_start_belongs_to_previous_date() {
        assert_eq!(
            gaming_day(at(2025, 3, 10, 5, 59), six_am()),
            date(2025, 3, 9)
        );
    }

    #[test]
    fn at_day_start_belongs_to_current_date() {
        assert_eq!(
            gaming_day(at(2025, 3, 10, 6, 0), six_am()),
            date(2025, 3, 10)
        );
    }

    #[test]
    fn zero_offset_is_the_calendar_date() {
        let midnight_start = GamingDayStart::new(0).unwrap();
        assert_eq!(
            gaming_day(at(2025, 3, 10, 0, 0), midnight_start),
            date(2025, 3, 10)
        );
    }

    #[test]
    fn boundary_crosses_months_and_years() {
        assert_eq!(
            gaming_day(at(2025, 1, 1, 2, 30), six_am()),
            date(2024, 12, 31)
        );
        assert_eq!(gaming_day(at(2025, 3, 1, 1, 0), six_am()), date(2025, 2, 28));
    }

    #[test]
    fn nanosecond_form_matches_datetime_form() {
        let event = at(2025, 3, 10, 5, 59);
        let ns = event.timestamp_nanos_opt().unwrap();
        assert_eq!(gaming_day_ns(ns, six_am()), gaming_day(event, six_am()));
    }

    #[test]
    fn offset_validation_rejects_out_of_range() {
        assert!(GamingDayStart::new(-1).is_err());
        assert!(GamingDayStart::new(1440).is_err());
        assert!(GamingDayStart::new(1439).is_ok());
    }

    #[test]
    fn day_start_renders_as_wall_clock() {
        assert_eq!(six_am().to_string(), "06:00");
        assert_eq!(GamingDayStart::new(90).unwrap().to_string(), "01:30");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        /// Property: the function is a pure shift. The gaming day equals
        /// the calendar date of the event moved back by the offset.
        #[test]
        fn prop_gaming_day_is_shifted_calendar_date(
            secs in 0i64..4_102_444_800, // 1970..2100
            offset in 0i64..1440,
        ) {
            let event = DateTime::from_timestamp(secs, 0).unwrap();
            let day_start = GamingDayStart::new(offset).unwrap();
            let expected = (event - TimeDelta::minutes(offset)).date_naive();
            prop_assert_eq!(gaming_day(event, day_start), expected);
        }

        /// Property: within one offset, later events never land on an
        /// earlier gaming day.
        #[test]
        fn prop_gaming_day_is_monotone_in_time(
            secs in 0i64..4_102_444_800,
            advance in 0i64..864_000,
            offset in 0i64..1440,
        ) {
            let day_start = GamingDayStart::new(offset).unwrap();
            let earlier = DateTime::from_timestamp(secs, 0).unwrap();
            let later = DateTime::from_timestamp(secs + advance, 0).unwrap();
            prop_assert!(gaming_day(earlier, day_start) <= gaming_day(later, day_start));
        }

        /// Property: events exactly at the boundary start a new day and
        /// one second earlier closes the previous one.
        #[test]
        fn prop_boundary_is_half_open(
            days in 1i64..47_000,
            offset in 0i64..1440,
        ) {
            let day_start = GamingDayStart::new(offset).unwrap();
            let boundary = DateTime::from_timestamp(days * 86_400 + offset * 60, 0).unwrap();
            let just_before = boundary - TimeDelta::seconds(1);
            prop_assert_eq!(gaming_day(boundary, day_start), boundary.date_naive());
            prop_assert_eq!(
                gaming_day(just_before, day_start),
                boundary.date_naive().pred_opt().unwrap()
            );
        }
    }
}
