//! Millisecond time constants, formatting, and percentage helpers.

/// All persisted timestamps and durations are integer milliseconds.
pub type Millis = i64;

pub const SECOND_MS: Millis = 1_000;
pub const MINUTE_MS: Millis = 60 * SECOND_MS;
pub const HOUR_MS: Millis = 60 * MINUTE_MS;
pub const DAY_MS: Millis = 24 * HOUR_MS;
pub const WEEK_MS: Millis = 7 * DAY_MS;

/// Formats a millisecond duration as a human-readable string.
///
/// Short form yields compact output like `2h 30m` or `45s`; long form
/// spells the units out (`2 hours 30 minutes`). Negative or zero input
/// formats as zero minutes.
pub fn format_duration(milliseconds: Millis, short: bool) -> String {
    if milliseconds <= 0 {
        return if short { "0m".to_string() } else { "0 minutes".to_string() };
    }

    let seconds = milliseconds / SECOND_MS;
    let minutes = seconds / 60;
    let hours = minutes / 60;
    let days = hours / 24;

    if short {
        if days > 0 {
            format!("{}d {}h", days, hours % 24)
        } else if hours > 0 {
            format!("{}h {}m", hours, minutes % 60)
        } else if minutes > 0 {
            format!("{minutes}m")
        } else {
            format!("{seconds}s")
        }
    } else {
        let mut parts = Vec::new();
        if days > 0 {
            parts.push(format!("{} {}", days, if days == 1 { "day" } else { "days" }));
        }
        let h = hours % 24;
        if h > 0 {
            parts.push(format!("{} {}", h, if h == 1 { "hour" } else { "hours" }));
        }
        let m = minutes % 60;
        if m > 0 {
            parts.push(format!("{} {}", m, if m == 1 { "minute" } else { "minutes" }));
        }

        if parts.is_empty() {
            format!("{seconds} seconds")
        } else {
            parts.join(" ")
        }
    }
}

/// Returns `value` as a percentage of `total`, unrounded.
///
/// Returns 0.0 when `total` is zero or negative so callers never divide
/// by zero for unlimited domains.
pub fn percent_of(value: Millis, total: Millis) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    (value as f64 / total as f64) * 100.0
}
