//! Pure limit evaluation: usage plus limits in, a decision out.

use serde::{Deserialize, Serialize};

use crate::record::DomainRecord;
use crate::timeutil::percent_of;

/// Warning threshold as a percentage of the limit.
pub const APPROACHING_THRESHOLD: f64 = 90.0;

/// Which limit a decision refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    Daily,
    Weekly,
}

/// Outcome of evaluating a domain's usage against its limits.
///
/// Precedence is fixed: an active extension overrides everything, then
/// an exceeded daily limit, then an exceeded weekly limit, then the
/// approaching warnings in the same order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Decision {
    /// No limits configured for the domain
    Unlimited,

    /// An unexpired extension grants access regardless of usage
    AllowedByExtension,

    /// The named limit is met or exceeded
    Blocked { kind: LimitKind },

    /// Usage is at or past 90% of the named limit but below it
    Approaching { kind: LimitKind, percentage: f64 },

    /// Under all thresholds
    Within,
}

impl Decision {
    /// Returns true if the domain should be blocked.
    pub fn is_blocked(&self) -> bool {
        matches!(self, Decision::Blocked { .. })
    }

    /// Stable reason string for wire responses and logs.
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Decision::Unlimited => None,
            Decision::AllowedByExtension => Some("has_active_extension"),
            Decision::Blocked { kind: LimitKind::Daily } => Some("daily_limit_exceeded"),
            Decision::Blocked { kind: LimitKind::Weekly } => Some("weekly_limit_exceeded"),
            Decision::Approaching { kind: LimitKind::Daily, .. } => Some("approaching_daily_limit"),
            Decision::Approaching { kind: LimitKind::Weekly, .. } => Some("approaching_weekly_limit"),
            Decision::Within => None,
        }
    }
}

/// Evaluates a domain's usage against its configured limits.
///
/// `has_active_extension` is passed in so this stays pure; the caller
/// looks up the extension record and checks expiry against its clock.
pub fn evaluate(record: &DomainRecord, has_active_extension: bool) -> Decision {
    if !record.has_limits() {
        return Decision::Unlimited;
    }

    if has_active_extension {
        return Decision::AllowedByExtension;
    }

    if let Some(limit) = record.daily_limit {
        if record.daily_time >= limit {
            return Decision::Blocked { kind: LimitKind::Daily };
        }
    }

    if let Some(limit) = record.weekly_limit {
        if record.weekly_time >= limit {
            return Decision::Blocked { kind: LimitKind::Weekly };
        }
    }

    if let Some(limit) = record.daily_limit {
        let pct = percent_of(record.daily_time, limit);
        if pct >= APPROACHING_THRESHOLD {
            return Decision::Approaching { kind: LimitKind::Daily, percentage: pct };
        }
    }

    if let Some(limit) = record.weekly_limit {
        let pct = percent_of(record.weekly_time, limit);
        if pct >= APPROACHING_THRESHOLD {
            return Decision::Approaching { kind: LimitKind::Weekly, percentage: pct };
        }
    }

    Decision::Within
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeutil::{HOUR_MS, MINUTE_MS};

    fn record(
        daily_time: i64,
        daily_limit: Option<i64>,
        weekly_time: i64,
        weekly_limit: Option<i64>,
    ) -> DomainRecord {
        DomainRecord {
            daily_time,
            daily_limit,
            weekly_time,
            weekly_limit,
            ..DomainRecord::default()
        }
    }

    #[test]
    fn test_no_limits_is_unlimited() {
        let r = record(100 * HOUR_MS, None, 100 * HOUR_MS, None);
        assert_eq!(evaluate(&r, false), Decision::Unlimited);
        // No limits beats even an active extension check
        assert_eq!(evaluate(&r, true), Decision::Unlimited);
    }

    #[test]
    fn test_active_extension_overrides_exceeded_limits() {
        let r = record(2 * HOUR_MS, Some(HOUR_MS), 0, None);
        assert_eq!(evaluate(&r, true), Decision::AllowedByExtension);
    }

    #[test]
    fn test_daily_limit_exceeded() {
        let r = record(HOUR_MS, Some(HOUR_MS), HOUR_MS, Some(10 * HOUR_MS));
        assert_eq!(evaluate(&r, false), Decision::Blocked { kind: LimitKind::Daily });
    }

    #[test]
    fn test_weekly_limit_exceeded() {
        let r = record(MINUTE_MS, Some(HOUR_MS), 10 * HOUR_MS, Some(10 * HOUR_MS));
        assert_eq!(evaluate(&r, false), Decision::Blocked { kind: LimitKind::Weekly });
    }

    #[test]
    fn test_daily_breach_wins_over_weekly_breach() {
        let r = record(HOUR_MS, Some(HOUR_MS), 20 * HOUR_MS, Some(10 * HOUR_MS));
        assert_eq!(evaluate(&r, false), Decision::Blocked { kind: LimitKind::Daily });
    }

    #[test]
    fn test_approaching_daily() {
        // 54 of 60 minutes = 90%
        let r = record(54 * MINUTE_MS, Some(HOUR_MS), 0, None);
        match evaluate(&r, false) {
            Decision::Approaching { kind: LimitKind::Daily, percentage } => {
                assert!((percentage - 90.0).abs() < f64::EPSILON);
            }
            other => panic!("expected approaching daily, got {other:?}"),
        }
    }

    #[test]
    fn test_approaching_weekly() {
        let r = record(0, Some(HOUR_MS), 9 * HOUR_MS + 30 * MINUTE_MS, Some(10 * HOUR_MS));
        match evaluate(&r, false) {
            Decision::Approaching { kind: LimitKind::Weekly, percentage } => {
                assert!(percentage >= 90.0 && percentage < 100.0);
            }
            other => panic!("expected approaching weekly, got {other:?}"),
        }
    }

    #[test]
    fn test_under_threshold_is_within() {
        let r = record(30 * MINUTE_MS, Some(HOUR_MS), HOUR_MS, Some(10 * HOUR_MS));
        assert_eq!(evaluate(&r, false), Decision::Within);
    }

    #[test]
    fn test_exactly_at_limit_blocks() {
        let r = record(0, None, 10 * HOUR_MS, Some(10 * HOUR_MS));
        assert!(evaluate(&r, false).is_blocked());
    }

    #[test]
    fn test_weekly_block_lifted_by_extension_daily_ok() {
        // Usage at 100% of weekly limit with an extension granted: allowed.
        let r = record(HOUR_MS, None, 10 * HOUR_MS, Some(10 * HOUR_MS));
        assert_eq!(evaluate(&r, true), Decision::AllowedByExtension);
        assert!(evaluate(&r, false).is_blocked());
    }

    #[test]
    fn test_reason_strings() {
        assert_eq!(
            Decision::Blocked { kind: LimitKind::Weekly }.reason(),
            Some("weekly_limit_exceeded")
        );
        assert_eq!(
            Decision::Blocked { kind: LimitKind::Daily }.reason(),
            Some("daily_limit_exceeded")
        );
        assert_eq!(
            Decision::Approaching { kind: LimitKind::Daily, percentage: 92.0 }.reason(),
            Some("approaching_daily_limit")
        );
        assert_eq!(Decision::AllowedByExtension.reason(), Some("has_active_extension"));
        assert_eq!(Decision::Within.reason(), None);
        assert_eq!(Decision::Unlimited.reason(), None);
    }
}
