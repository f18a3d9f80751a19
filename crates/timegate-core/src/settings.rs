//! User-configurable settings with their documented defaults.

use serde::{Deserialize, Serialize};

use crate::timeutil::{Millis, MINUTE_MS, SECOND_MS};

/// Global behavior knobs.
///
/// Every field carries a serde default so a partially persisted settings
/// object fills in with the documented defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Master switch for time tracking
    pub tracking_enabled: bool,

    /// Whether warning notifications are emitted
    pub notifications_enabled: bool,

    /// Extension grants allowed per domain per week
    pub max_weekly_extensions: u32,

    /// Extension grants allowed per domain per day
    pub max_daily_extensions: u32,

    /// Duration applied when a request carries none, in ms
    pub default_extension_duration: Millis,

    /// Weekday the week starts on (0 = Sunday .. 6 = Saturday)
    pub week_start_day: u8,

    /// Seconds of inactivity before the user counts as idle
    pub idle_threshold_seconds: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tracking_enabled: true,
            notifications_enabled: true,
            max_weekly_extensions: 3,
            max_daily_extensions: 3,
            default_extension_duration: 30 * MINUTE_MS,
            week_start_day: 1,
            idle_threshold_seconds: 60,
        }
    }
}

impl Settings {
    /// Idle threshold as milliseconds.
    pub fn idle_threshold_ms(&self) -> Millis {
        Millis::from(self.idle_threshold_seconds) * SECOND_MS
    }
}
