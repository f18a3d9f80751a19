//! Timegate Core - Shared domain types for browsing time tracking
//!
//! This crate provides the pure domain logic shared between the daemon
//! (timegated) and CLI client (timegate): domain records, settings, the
//! limit evaluator, active-session arithmetic, and week/day boundary math.
//!
//! Everything here is synchronous and side-effect free; functions that
//! depend on the current time take it as an explicit parameter so the
//! daemon can pass the real clock and tests can pass fixed timestamps.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod domain;
pub mod error;
pub mod evaluate;
pub mod record;
pub mod session;
pub mod settings;
pub mod timeutil;
pub mod week;

// Re-exports for convenience
pub use domain::{Domain, TabId};
pub use error::{CoreError, CoreResult};
pub use evaluate::{evaluate, Decision, LimitKind};
pub use record::{ActiveExtension, DomainRecord, ExtensionRecord, ExtensionRequest};
pub use session::ActiveSession;
pub use settings::Settings;
pub use timeutil::{format_duration, percent_of, Millis, DAY_MS, HOUR_MS, MINUTE_MS, SECOND_MS, WEEK_MS};
pub use week::{current_week_info, is_new_day, is_new_week, today_start, week_start, WeekMarker};
