//! Engine actor commands and errors.
//!
//! This module defines the message types for communicating with the
//! `EngineActor`:
//! - `EngineCommand`: Commands sent to the actor
//! - `EngineError`: Errors that can occur during engine operations
//! - `DomainInfo`: Aggregate per-domain view returned to clients
//!
//! All types are designed for async message passing and follow the
//! panic-free policy.

use std::collections::BTreeMap;

use thiserror::Error;
use tokio::sync::oneshot;

use timegate_core::{
    ActiveExtension, ActiveSession, Decision, DomainRecord, ExtensionRecord, Millis, Settings,
};
use timegate_protocol::{BrowserEvent, DomainUpdates, SettingsUpdate};

use crate::store::StoreError;

// ============================================================================
// Engine Errors
// ============================================================================

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The given string is not a plausible hostname.
    #[error("invalid domain: {0}")]
    InvalidDomain(String),

    /// addDomain for a domain that is already tracked.
    #[error("domain already tracked: {0}")]
    DomainExists(String),

    /// The named domain is not tracked.
    #[error("domain not tracked: {0}")]
    UnknownDomain(String),

    /// The weekly extension quota is used up.
    #[error("weekly extension limit reached")]
    WeeklyExtensionLimit,

    /// An unexpired extension already exists for the domain.
    #[error("an active extension already exists")]
    ActiveExtensionExists,

    /// The persistent store failed.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// The response channel was closed before receiving a response.
    ///
    /// This typically indicates the actor was shut down.
    #[error("response channel closed")]
    ChannelClosed,
}

// ============================================================================
// Aggregate Views
// ============================================================================

/// Everything a client needs to render one domain: the time record, the
/// extension logs, the unexpired extension, and the remaining weekly
/// extension quota.
#[derive(Debug, Clone)]
pub struct DomainInfo {
    pub domain: String,
    pub record: DomainRecord,
    pub extensions: ExtensionRecord,
    pub active_extension: Option<ActiveExtension>,
    pub remaining_extensions: u32,
}

// ============================================================================
// Engine Commands
// ============================================================================

/// Commands sent to the engine actor.
///
/// Request-response commands carry a oneshot channel; timer ticks are
/// fire-and-forget.
#[derive(Debug)]
pub enum EngineCommand {
    /// Browser event from an integration (tab, window, idle).
    ///
    /// Drives the session tracker: activations and URL changes may
    /// restart tracking, focus loss and idle stop it.
    Event {
        event: BrowserEvent,
        respond_to: oneshot::Sender<Result<(), EngineError>>,
    },

    /// Request a temporary blocking extension for a domain.
    ///
    /// # Errors
    /// - `EngineError::WeeklyExtensionLimit` if the weekly quota is used
    /// - `EngineError::ActiveExtensionExists` if one is already running
    RequestExtension {
        domain: String,
        duration: Option<Millis>,
        reason: Option<String>,
        /// Granted extension plus remaining weekly quota
        respond_to: oneshot::Sender<Result<(ActiveExtension, u32), EngineError>>,
    },

    /// Evaluate a domain's block state.
    ///
    /// Returns the decision and the record if the domain is tracked.
    CheckBlockStatus {
        domain: String,
        respond_to: oneshot::Sender<Result<(Decision, Option<DomainRecord>), EngineError>>,
    },

    /// Full per-domain view for clients.
    GetDomainInfo {
        domain: String,
        respond_to: oneshot::Sender<Result<DomainInfo, EngineError>>,
    },

    GetAllDomains {
        respond_to: oneshot::Sender<Result<BTreeMap<String, DomainRecord>, EngineError>>,
    },

    /// Start tracking a domain with optional limits.
    ///
    /// # Errors
    /// - `EngineError::InvalidDomain` if the string is not a hostname
    /// - `EngineError::DomainExists` if the domain is already tracked
    AddDomain {
        domain: String,
        daily_limit: Option<Millis>,
        weekly_limit: Option<Millis>,
        respond_to: oneshot::Sender<Result<DomainRecord, EngineError>>,
    },

    /// Change a tracked domain's limits and re-run enforcement.
    UpdateDomain {
        domain: String,
        updates: DomainUpdates,
        respond_to: oneshot::Sender<Result<DomainRecord, EngineError>>,
    },

    /// Drop a domain's records and extension logs.
    DeleteDomain {
        domain: String,
        respond_to: oneshot::Sender<Result<(), EngineError>>,
    },

    GetSettings {
        respond_to: oneshot::Sender<Result<Settings, EngineError>>,
    },

    /// Merge the given fields into settings.
    ///
    /// Disabling tracking stops any running session.
    UpdateSettings {
        update: SettingsUpdate,
        respond_to: oneshot::Sender<Result<Settings, EngineError>>,
    },

    GetExcludedDomains {
        respond_to: oneshot::Sender<Result<Vec<String>, EngineError>>,
    },

    /// Exempt a domain from tracking; stops the session if it is on it.
    AddExcludedDomain {
        domain: String,
        respond_to: oneshot::Sender<Result<(), EngineError>>,
    },

    RemoveExcludedDomain {
        domain: String,
        respond_to: oneshot::Sender<Result<(), EngineError>>,
    },

    ExportData {
        respond_to: oneshot::Sender<Result<serde_json::Value, EngineError>>,
    },

    ImportData {
        data: serde_json::Value,
        respond_to: oneshot::Sender<Result<(), EngineError>>,
    },

    /// Clear the store and reinitialize defaults.
    ResetData {
        respond_to: oneshot::Sender<Result<(), EngineError>>,
    },

    /// Force the weekly reset procedure regardless of the calendar.
    ManualWeeklyReset {
        respond_to: oneshot::Sender<Result<(), EngineError>>,
    },

    /// Freeze session accounting without destroying the session.
    PauseTracking {
        respond_to: oneshot::Sender<Result<(), EngineError>>,
    },

    ResumeTracking {
        respond_to: oneshot::Sender<Result<(), EngineError>>,
    },

    GetCurrentSession {
        respond_to: oneshot::Sender<Option<ActiveSession>>,
    },

    /// Periodic flush of the running session's elapsed time.
    ///
    /// Fire-and-forget, sent by the session flush timer. No-ops when
    /// there is no session or the session is paused.
    FlushTick,

    /// Periodic session heartbeat; persists the session snapshot.
    KeepAliveTick,

    /// Periodic sweep clearing expired extensions.
    ///
    /// Fire-and-forget, sent by the sweep task.
    SweepExpiredExtensions,

    /// Flush the running session and exit the actor loop.
    ///
    /// The actor keeps a sender clone for its timer tasks, so the
    /// command channel never closes on its own; shutdown is explicit.
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}
