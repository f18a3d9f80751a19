//! Replies and pushed directives sent from the daemon to clients.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use timegate_core::{
    ActiveExtension, ActiveSession, Decision, DomainRecord, ExtensionRecord, Settings, TabId,
};

use crate::version::ProtocolVersion;

/// Machine-readable error codes for structured rejections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Weekly extension quota used up
    WeeklyLimitReached,
    /// An unexpired extension already exists for the domain
    ActiveExtensionExists,
    /// The given string is not a plausible hostname
    InvalidDomain,
    /// addDomain on a domain that is already tracked
    DomainExists,
    /// The named domain is not tracked
    UnknownDomain,
    /// A required request field was missing or malformed
    MissingField,
    /// The persistent store failed
    Storage,
    /// Anything else; details in the message
    Internal,
}

/// Enforcement side effects pushed to subscribed browser integrations.
///
/// All fire-and-forget and best-effort; a failed delivery is logged by
/// the integration, never retried by the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "directive", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Directive {
    /// Put the block overlay over the given tab
    ShowOverlay { domain: String, tab_id: TabId },

    /// Remove the block overlay from the given tab
    HideOverlay { domain: String, tab_id: TabId },

    /// Reload a tab whose content layer did not answer
    ReloadTab { tab_id: TabId },

    /// Show a user notification
    Notify {
        id: String,
        title: String,
        message: String,
    },
}

/// Messages sent from daemon to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonReply {
    /// Connection accepted
    Connected {
        protocol_version: ProtocolVersion,
        client_id: String,
    },

    /// Connection rejected (version mismatch, etc.)
    Rejected {
        reason: String,
        protocol_version: ProtocolVersion,
    },

    /// Generic success for actions with no payload
    Ok,

    /// Result of requestExtension
    ExtensionGranted {
        extension: ActiveExtension,
        /// Weekly grants still available after this one
        remaining_extensions: u32,
    },

    /// Result of checkBlockStatus
    BlockStatus {
        #[serde(flatten)]
        decision: Decision,
        /// The evaluated record; absent for untracked domains
        #[serde(skip_serializing_if = "Option::is_none")]
        record: Option<DomainRecord>,
    },

    /// Result of getDomainInfo
    DomainInfo {
        domain: String,
        record: DomainRecord,
        extensions: ExtensionRecord,
        #[serde(skip_serializing_if = "Option::is_none")]
        active_extension: Option<ActiveExtension>,
        remaining_extensions: u32,
    },

    /// Result of getAllDomains
    DomainList {
        domains: BTreeMap<String, DomainRecord>,
    },

    /// Result of addDomain/updateDomain
    DomainRecord {
        domain: String,
        record: DomainRecord,
    },

    /// Result of getSettings/updateSettings
    Settings { settings: Settings },

    /// Result of getExcludedDomains
    ExcludedDomains { domains: Vec<String> },

    /// Result of exportData
    ExportedData { data: serde_json::Value },

    /// Result of getCurrentSession
    CurrentSession {
        #[serde(skip_serializing_if = "Option::is_none")]
        session: Option<ActiveSession>,
    },

    /// Subscription confirmed; directives follow on this connection
    Subscribed,

    /// Pushed enforcement directive
    Directive { directive: Directive },

    /// Pong response to ping
    Pong { seq: u64 },

    /// Structured error response
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
    },
}

impl DaemonReply {
    /// Creates a connected response.
    pub fn connected(client_id: String) -> Self {
        Self::Connected {
            protocol_version: ProtocolVersion::CURRENT,
            client_id,
        }
    }

    /// Creates a rejected response.
    pub fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    /// Creates an error response without a code.
    pub fn error(message: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: None,
        }
    }

    /// Creates an error response with a machine-readable code.
    pub fn error_with_code(message: &str, code: ErrorCode) -> Self {
        Self::Error {
            message: message.to_string(),
            code: Some(code),
        }
    }

    /// Creates a pong response.
    pub fn pong(seq: u64) -> Self {
        Self::Pong { seq }
    }
}
