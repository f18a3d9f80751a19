//! Typed storage layer over the key-value store.
//!
//! Owns the persisted schema (domains, extensions, settings, week
//! marker, active session, excluded domains) and the boundary resets:
//! the lazy per-record daily reset happens inside [`Storage::add_domain_time`]
//! at the moment a record is about to be written, while the weekly
//! reset is an eager sweep over every record because it also clears
//! cross-domain extension state. That asymmetry is deliberate.
//!
//! Absent or malformed values deserialize to documented defaults so an
//! imported snapshot missing keys never takes the daemon down.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result`

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use timegate_core::{
    current_week_info, is_new_week, today_start, ActiveSession, DomainRecord, ExtensionRecord,
    Millis, Settings, WeekMarker,
};

use crate::store::{StoreBackend, StoreError};

// ============================================================================
// Persisted Keys
// ============================================================================

pub const KEY_DOMAINS: &str = "domains";
pub const KEY_EXTENSIONS: &str = "extensions";
pub const KEY_SETTINGS: &str = "settings";
pub const KEY_CURRENT_WEEK: &str = "currentWeek";
pub const KEY_ACTIVE_SESSION: &str = "activeSession";
pub const KEY_EXCLUDED_DOMAINS: &str = "excludedDomains";

/// All keys the schema knows about, in export order.
pub const ALL_KEYS: [&str; 6] = [
    KEY_DOMAINS,
    KEY_EXTENSIONS,
    KEY_SETTINGS,
    KEY_CURRENT_WEEK,
    KEY_ACTIVE_SESSION,
    KEY_EXCLUDED_DOMAINS,
];

// ============================================================================
// Storage
// ============================================================================

/// Typed access to the persisted state.
///
/// Cheap to clone; all clones share the same backend.
#[derive(Clone)]
pub struct Storage {
    backend: Arc<dyn StoreBackend>,
}

impl Storage {
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        Self { backend }
    }

    /// Reads a key and deserializes it, falling back to the default on
    /// an absent or malformed value.
    async fn get_or_default<T>(&self, key: &str) -> Result<T, StoreError>
    where
        T: serde::de::DeserializeOwned + Default,
    {
        match self.backend.get(key).await? {
            None => Ok(T::default()),
            Some(value) => match serde_json::from_value(value) {
                Ok(v) => Ok(v),
                Err(e) => {
                    warn!(key, error = %e, "Stored value is malformed, using default");
                    Ok(T::default())
                }
            },
        }
    }

    async fn set_json<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        self.backend.set(key, serde_json::to_value(value)?).await
    }

    // ========================================================================
    // Domains
    // ========================================================================

    pub async fn domains(&self) -> Result<BTreeMap<String, DomainRecord>, StoreError> {
        self.get_or_default(KEY_DOMAINS).await
    }

    pub async fn save_domains(
        &self,
        domains: &BTreeMap<String, DomainRecord>,
    ) -> Result<(), StoreError> {
        self.set_json(KEY_DOMAINS, domains).await
    }

    pub async fn domain(&self, domain: &str) -> Result<Option<DomainRecord>, StoreError> {
        Ok(self.domains().await?.get(domain).cloned())
    }

    /// Attributes elapsed time to a domain and returns the updated record.
    ///
    /// Checks the week boundary first (eager sweep if crossed), then
    /// applies the lazy daily reset inside the record itself. Untracked
    /// domains get a fresh record without limits.
    pub async fn add_domain_time(
        &self,
        domain: &str,
        milliseconds: Millis,
        now: Millis,
        today_start_ms: Millis,
    ) -> Result<DomainRecord, StoreError> {
        self.check_and_reset_week().await?;

        let mut domains = self.domains().await?;
        let record = domains.entry(domain.to_string()).or_default();
        record.add_time(milliseconds, now, today_start_ms);
        let updated = record.clone();
        self.save_domains(&domains).await?;

        debug!(
            domain,
            added_ms = milliseconds,
            daily_ms = updated.daily_time,
            weekly_ms = updated.weekly_time,
            "Attributed time to domain"
        );

        Ok(updated)
    }

    // ========================================================================
    // Extensions
    // ========================================================================

    pub async fn extensions(&self) -> Result<BTreeMap<String, ExtensionRecord>, StoreError> {
        self.get_or_default(KEY_EXTENSIONS).await
    }

    pub async fn save_extensions(
        &self,
        extensions: &BTreeMap<String, ExtensionRecord>,
    ) -> Result<(), StoreError> {
        self.set_json(KEY_EXTENSIONS, extensions).await
    }

    pub async fn extension_record(&self, domain: &str) -> Result<ExtensionRecord, StoreError> {
        Ok(self.extensions().await?.get(domain).cloned().unwrap_or_default())
    }

    // ========================================================================
    // Settings
    // ========================================================================

    pub async fn settings(&self) -> Result<Settings, StoreError> {
        self.get_or_default(KEY_SETTINGS).await
    }

    pub async fn save_settings(&self, settings: &Settings) -> Result<(), StoreError> {
        self.set_json(KEY_SETTINGS, settings).await
    }

    // ========================================================================
    // Week Marker and Weekly Reset
    // ========================================================================

    pub async fn week_marker(&self) -> Result<Option<WeekMarker>, StoreError> {
        self.get_or_default(KEY_CURRENT_WEEK).await
    }

    pub async fn save_week_marker(&self, marker: &WeekMarker) -> Result<(), StoreError> {
        self.set_json(KEY_CURRENT_WEEK, marker).await
    }

    /// Compares the stored week marker against the calendar and performs
    /// the weekly reset on a mismatch. Called before every time save and
    /// once at startup.
    pub async fn check_and_reset_week(&self) -> Result<bool, StoreError> {
        let settings = self.settings().await?;
        let current = current_week_info(settings.week_start_day);
        let stored = self.week_marker().await?;

        if is_new_week(&current, stored.as_ref()) {
            self.perform_weekly_reset(&current).await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// The eager weekly sweep: zeroes weekly and daily counters and
    /// block flags on every record, wipes the whole extensions map, and
    /// installs the new week marker.
    pub async fn perform_weekly_reset(&self, marker: &WeekMarker) -> Result<(), StoreError> {
        let today = today_start();

        let mut domains = self.domains().await?;
        for record in domains.values_mut() {
            record.apply_weekly_reset(today);
        }
        self.save_domains(&domains).await?;

        self.save_extensions(&BTreeMap::new()).await?;
        self.save_week_marker(marker).await?;

        info!(
            week = marker.week_number,
            year = marker.year,
            domains = domains.len(),
            "Weekly reset performed"
        );

        Ok(())
    }

    // ========================================================================
    // Active Session
    // ========================================================================

    pub async fn active_session(&self) -> Result<Option<ActiveSession>, StoreError> {
        self.get_or_default(KEY_ACTIVE_SESSION).await
    }

    pub async fn save_active_session(
        &self,
        session: Option<&ActiveSession>,
    ) -> Result<(), StoreError> {
        match session {
            Some(s) => self.set_json(KEY_ACTIVE_SESSION, s).await,
            None => self.backend.remove(KEY_ACTIVE_SESSION).await,
        }
    }

    // ========================================================================
    // Excluded Domains
    // ========================================================================

    pub async fn excluded_domains(&self) -> Result<Vec<String>, StoreError> {
        self.get_or_default(KEY_EXCLUDED_DOMAINS).await
    }

    pub async fn save_excluded_domains(&self, domains: &[String]) -> Result<(), StoreError> {
        self.set_json(KEY_EXCLUDED_DOMAINS, &domains).await
    }

    // ========================================================================
    // Export / Import / Reset
    // ========================================================================

    /// Snapshots the whole store as one JSON object.
    pub async fn export(&self) -> Result<serde_json::Value, StoreError> {
        let snapshot = self.backend.snapshot().await?;
        Ok(serde_json::Value::Object(snapshot.into_iter().collect()))
    }

    /// Overwrites store keys from a snapshot object.
    ///
    /// Only schema keys are imported; unknown keys are ignored, and keys
    /// absent from the snapshot keep their current value.
    pub async fn import(&self, data: &serde_json::Value) -> Result<usize, StoreError> {
        let object = match data.as_object() {
            Some(o) => o,
            None => {
                warn!("Import payload is not a JSON object, ignoring");
                return Ok(0);
            }
        };

        let mut imported = 0;
        for key in ALL_KEYS {
            if let Some(value) = object.get(key) {
                self.backend.set(key, value.clone()).await?;
                imported += 1;
            }
        }

        info!(keys = imported, "Imported data snapshot");
        Ok(imported)
    }

    /// Clears the store and reinitializes defaults.
    pub async fn reset_all(&self) -> Result<(), StoreError> {
        self.backend.clear().await?;
        self.initialize().await
    }

    /// Ensures the settings and week marker exist; called at startup.
    pub async fn initialize(&self) -> Result<(), StoreError> {
        let settings = self.settings().await?;
        self.save_settings(&settings).await?;

        if self.week_marker().await?.is_none() {
            let marker = current_week_info(settings.week_start_day);
            self.save_week_marker(&marker).await?;
        }

        Ok(())
    }
}
