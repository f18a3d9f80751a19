//! The active tracking session: one domain in one focused tab.

use serde::{Deserialize, Serialize};

use crate::domain::{Domain, TabId};
use crate::timeutil::Millis;

/// Tracking state for the currently focused domain.
///
/// `accumulated_time` holds time already counted but not yet flushed to
/// the per-domain record, plus time banked across pauses. Elapsed time
/// is `accumulated_time + (now - start_time)` while running, and just
/// `accumulated_time` while paused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSession {
    /// The domain being timed
    pub domain: Domain,

    /// The tab the domain is focused in
    pub tab_id: TabId,

    /// When the current running segment began; meaningless while paused
    pub start_time: Millis,

    /// Time banked from earlier segments, not yet flushed
    #[serde(default)]
    pub accumulated_time: Millis,

    /// True while tracking is paused
    #[serde(default)]
    pub paused: bool,
}

impl ActiveSession {
    /// Starts a new running session for the given domain and tab.
    pub fn start(domain: Domain, tab_id: TabId, now: Millis) -> Self {
        Self {
            domain,
            tab_id,
            start_time: now,
            accumulated_time: 0,
            paused: false,
        }
    }

    /// Returns the total unflushed time as of `now`.
    pub fn elapsed(&self, now: Millis) -> Millis {
        if self.paused {
            self.accumulated_time
        } else {
            self.accumulated_time + (now - self.start_time).max(0)
        }
    }

    /// Takes the unflushed time and rebases the session at `now`.
    ///
    /// After a rebase the session reports zero elapsed time, so periodic
    /// flushes never double count. Returns the amount taken.
    pub fn rebase(&mut self, now: Millis) -> Millis {
        let elapsed = self.elapsed(now);
        self.start_time = now;
        self.accumulated_time = 0;
        elapsed
    }

    /// Pauses the session, folding the running segment into the bank.
    ///
    /// No-op if already paused.
    pub fn pause(&mut self, now: Millis) {
        if self.paused {
            return;
        }
        self.accumulated_time += (now - self.start_time).max(0);
        self.paused = true;
    }

    /// Resumes a paused session, opening a new running segment at `now`.
    ///
    /// No-op if not paused.
    pub fn resume(&mut self, now: Millis) {
        if !self.paused {
            return;
        }
        self.start_time = now;
        self.paused = false;
    }
}
