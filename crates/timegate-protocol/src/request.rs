//! Requests sent by clients and browser integrations to the daemon.

use serde::{Deserialize, Serialize};
use timegate_core::Millis;

use crate::event::BrowserEvent;
use crate::version::ProtocolVersion;

/// Partial update for a tracked domain's configuration.
///
/// Absent fields are untouched; an explicit `null` clears a limit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DomainUpdates {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_limit: Option<Option<Millis>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub weekly_limit: Option<Option<Millis>>,
}

/// Partial update for the settings singleton.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingsUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracking_enabled: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub notifications_enabled: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_weekly_extensions: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_daily_extensions: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_extension_duration: Option<Millis>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub week_start_day: Option<u8>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_threshold_seconds: Option<u32>,
}

/// Actions a client can request from the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Action {
    /// Client handshake/connection request
    Connect {
        #[serde(skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// Request a temporary blocking extension for a domain
    RequestExtension {
        domain: String,
        /// Duration in ms; the settings default applies when absent
        #[serde(skip_serializing_if = "Option::is_none")]
        duration: Option<Millis>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Evaluate a domain's current block state
    CheckBlockStatus { domain: String },

    /// Full per-domain view: record, extensions, remaining quota
    GetDomainInfo { domain: String },

    /// All tracked domains with their records
    GetAllDomains,

    /// Start tracking a domain with optional limits
    AddDomain {
        domain: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        daily_limit: Option<Millis>,
        #[serde(skip_serializing_if = "Option::is_none")]
        weekly_limit: Option<Millis>,
    },

    /// Change a tracked domain's limits
    UpdateDomain { domain: String, updates: DomainUpdates },

    /// Stop tracking a domain and drop its records
    DeleteDomain { domain: String },

    GetSettings,

    /// Merge the given fields into settings
    UpdateSettings { settings: SettingsUpdate },

    GetExcludedDomains,

    /// Exempt a domain from tracking
    AddExcludedDomain { domain: String },

    RemoveExcludedDomain { domain: String },

    /// Snapshot the whole store as JSON
    ExportData,

    /// Bulk overwrite of store keys from a snapshot
    ImportData { data: serde_json::Value },

    /// Clear the store and reinitialize defaults
    ResetData,

    /// Force the weekly reset procedure regardless of the calendar
    ManualWeeklyReset,

    /// Freeze session accounting without destroying the session
    PauseTracking,

    ResumeTracking,

    GetCurrentSession,

    /// Browser event from an integration
    BrowserEvent { event: BrowserEvent },

    /// Subscribe to enforcement directives
    Subscribe,

    /// Ping to check connection
    Ping { seq: u64 },

    /// Client disconnecting gracefully
    Disconnect,
}

/// Messages sent from client to daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRequest {
    /// Protocol version
    pub protocol_version: ProtocolVersion,

    /// Requested action
    #[serde(flatten)]
    pub action: Action,
}

impl ClientRequest {
    /// Creates a request with the current protocol version.
    pub fn new(action: Action) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            action,
        }
    }

    /// Creates a connect request.
    pub fn connect(client_id: Option<String>) -> Self {
        Self::new(Action::Connect { client_id })
    }

    /// Creates a browser event push.
    pub fn browser_event(event: BrowserEvent) -> Self {
        Self::new(Action::BrowserEvent { event })
    }

    /// Creates a ping request.
    pub fn ping(seq: u64) -> Self {
        Self::new(Action::Ping { seq })
    }
}
