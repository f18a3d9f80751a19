//! Persisted per-domain records: accumulated time and extension logs.
//!
//! Field names serialize in camelCase to match the persisted key-value
//! schema. Every field carries a serde default so snapshots missing keys
//! (old exports, partial imports) deserialize into documented defaults
//! instead of failing.

use serde::{Deserialize, Serialize};

use crate::timeutil::Millis;
use crate::week::is_new_day;

/// Accumulated time and configured limits for one tracked domain.
///
/// `daily_time` and `weekly_time` are zeroed by their respective resets;
/// `total_time` only ever grows. A limit of `None` means unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct DomainRecord {
    /// Lifetime accumulated time in ms
    pub total_time: Millis,

    /// Time accumulated this week in ms
    pub weekly_time: Millis,

    /// Time accumulated today in ms
    pub daily_time: Millis,

    /// Daily limit in ms; `None` = unlimited
    pub daily_limit: Option<Millis>,

    /// Weekly limit in ms; `None` = unlimited
    pub weekly_limit: Option<Millis>,

    /// Local-midnight timestamp the current `daily_time` applies to
    pub last_day_reset: Millis,

    /// Timestamp of the last mutation
    pub last_updated: Millis,

    /// True iff enforcement has applied a block for this domain
    pub is_blocked: bool,
}

impl DomainRecord {
    /// Creates a fresh record with the given limits.
    pub fn with_limits(daily_limit: Option<Millis>, weekly_limit: Option<Millis>, now: Millis) -> Self {
        Self {
            daily_limit,
            weekly_limit,
            last_updated: now,
            ..Self::default()
        }
    }

    /// Returns true if either a daily or a weekly limit is configured.
    pub fn has_limits(&self) -> bool {
        self.daily_limit.is_some() || self.weekly_limit.is_some()
    }

    /// Adds elapsed time to all counters.
    ///
    /// Performs the lazy daily reset first: if `last_day_reset` predates
    /// `today_start_ms`, `daily_time` is zeroed before the new time lands.
    pub fn add_time(&mut self, milliseconds: Millis, now: Millis, today_start_ms: Millis) {
        if is_new_day(self.last_day_reset, today_start_ms) {
            self.daily_time = 0;
            self.last_day_reset = today_start_ms;
        }

        self.total_time += milliseconds;
        self.weekly_time += milliseconds;
        self.daily_time += milliseconds;
        self.last_updated = now;
    }

    /// Applies the weekly reset to this record.
    ///
    /// Zeroes the weekly and daily counters, realigns the daily reset
    /// marker, and lifts any block. `total_time` is untouched.
    pub fn apply_weekly_reset(&mut self, today_start_ms: Millis) {
        self.weekly_time = 0;
        self.daily_time = 0;
        self.last_day_reset = today_start_ms;
        self.is_blocked = false;
    }
}

/// One granted or requested extension, as kept in the request logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionRequest {
    /// When the request was made
    pub timestamp: Millis,

    /// Requested duration in ms
    pub duration: Millis,

    /// User-supplied reason
    pub reason: String,
}

/// The currently installed extension for a domain, if any.
///
/// Active iff `end_time > now`; a new grant naturally supersedes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveExtension {
    pub start_time: Millis,
    pub end_time: Millis,
    pub duration: Millis,
    pub reason: String,
}

impl ActiveExtension {
    /// Returns true if this extension has not yet expired.
    pub fn is_active(&self, now: Millis) -> bool {
        self.end_time > now
    }
}

/// Extension request logs and the current extension for one domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtensionRecord {
    /// Requests made this week, cleared by the weekly reset
    pub weekly_requests: Vec<ExtensionRequest>,

    /// Requests made today, cleared by the lazy daily reset
    pub daily_requests: Vec<ExtensionRequest>,

    /// At most one installed extension per domain
    pub current_extension: Option<ActiveExtension>,

    /// Local-midnight timestamp the current `daily_requests` apply to
    pub last_day_reset: Millis,
}

impl ExtensionRecord {
    /// Returns the current extension only if it is unexpired.
    pub fn active_extension(&self, now: Millis) -> Option<&ActiveExtension> {
        self.current_extension.as_ref().filter(|ext| ext.is_active(now))
    }

    /// Returns true if a current extension exists but has expired.
    pub fn has_expired_extension(&self, now: Millis) -> bool {
        self.current_extension
            .as_ref()
            .map(|ext| !ext.is_active(now))
            .unwrap_or(false)
    }

    /// Appends a request to both logs and installs it as the current
    /// extension, performing the lazy daily reset of the daily log first.
    pub fn record_request(
        &mut self,
        duration: Millis,
        reason: String,
        now: Millis,
        today_start_ms: Millis,
    ) -> ActiveExtension {
        if is_new_day(self.last_day_reset, today_start_ms) {
            self.daily_requests.clear();
            self.last_day_reset = today_start_ms;
        }

        let request = ExtensionRequest {
            timestamp: now,
            duration,
            reason: reason.clone(),
        };
        self.weekly_requests.push(request.clone());
        self.daily_requests.push(request);

        let extension = ActiveExtension {
            start_time: now,
            end_time: now + duration,
            duration,
            reason,
        };
        self.current_extension = Some(extension.clone());
        extension
    }
}
