//! Week and day boundary computation.
//!
//! Daily counters reset at local midnight; weekly counters reset when the
//! stored [`WeekMarker`] no longer matches the freshly computed one. The
//! week starts on a configurable weekday (`week_start_day`, 0 = Sunday).

use chrono::{Datelike, Days, Local, NaiveDate, TimeZone};
use serde::{Deserialize, Serialize};

use crate::timeutil::Millis;

/// The system's notion of "which week we are in".
///
/// Compared against a freshly computed marker to detect rollover. The
/// week number is the ISO week number; `year` is the calendar year so a
/// rollover is detected even when the ISO week number repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeekMarker {
    /// ISO week number (1-53)
    pub week_number: u32,

    /// Calendar year
    pub year: i32,

    /// Local midnight of the configured week-start day, in epoch ms
    pub start_date: Millis,
}

/// Returns local midnight of the given date in epoch milliseconds.
fn local_midnight_ms(date: NaiveDate) -> Millis {
    let naive = match date.and_hms_opt(0, 0, 0) {
        Some(n) => n,
        None => return 0,
    };
    // On a DST gap where midnight does not exist, take the earliest valid
    // local instant of that day.
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp_millis())
        .unwrap_or_else(|| naive.and_utc().timestamp_millis())
}

/// Returns the start of today (local midnight) in epoch milliseconds.
pub fn today_start() -> Millis {
    local_midnight_ms(Local::now().date_naive())
}

/// Returns the start of the week containing `date`, at local midnight.
///
/// `week_start_day` selects which weekday opens the week
/// (0 = Sunday .. 6 = Saturday). Out-of-range values clamp to Saturday.
pub fn week_start(date: NaiveDate, week_start_day: u8) -> NaiveDate {
    let start = u32::from(week_start_day.min(6));
    let day = date.weekday().num_days_from_sunday();
    let diff = if day < start { 7 + day - start } else { day - start };
    date.checked_sub_days(Days::new(u64::from(diff))).unwrap_or(date)
}

/// Computes the week marker for `date` under the given week-start day.
pub fn week_info_for(date: NaiveDate, week_start_day: u8) -> WeekMarker {
    WeekMarker {
        week_number: date.iso_week().week(),
        year: date.year(),
        start_date: local_midnight_ms(week_start(date, week_start_day)),
    }
}

/// Computes the current week marker from the local clock.
pub fn current_week_info(week_start_day: u8) -> WeekMarker {
    week_info_for(Local::now().date_naive(), week_start_day)
}

/// Returns true if `current` and `stored` denote different weeks.
///
/// A missing stored marker always counts as a new week so a fresh
/// install performs its first reset bookkeeping immediately.
pub fn is_new_week(current: &WeekMarker, stored: Option<&WeekMarker>) -> bool {
    match stored {
        None => true,
        Some(s) => s.week_number != current.week_number || s.year != current.year,
    }
}

/// Returns true if `last_day_reset` predates the given start-of-today.
pub fn is_new_day(last_day_reset: Millis, today_start_ms: Millis) -> bool {
    last_day_reset < today_start_ms
}
