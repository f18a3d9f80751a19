//! Browser events pushed into the daemon by a browser integration.
//!
//! The session tracker is the sole consumer; tests inject synthetic
//! events through the same types without a real browser.

use serde::{Deserialize, Serialize};
use timegate_core::TabId;

/// User activity state as reported by the browser's idle detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdleState {
    Active,
    Idle,
    Locked,
}

/// Events a browser integration forwards to the daemon.
///
/// URLs are carried raw; domain extraction and normalization happen in
/// the daemon so every integration gets identical treatment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum BrowserEvent {
    /// A tab became the focused tab
    TabActivated {
        tab_id: TabId,
        /// URL of the activated tab, if the integration knows it
        url: Option<String>,
    },

    /// A tab finished loading a (possibly new) URL
    TabUpdated {
        tab_id: TabId,
        url: String,
        /// Whether this tab is currently the focused tab
        active: bool,
    },

    /// A tab was closed
    TabRemoved { tab_id: TabId },

    /// The browser window gained or lost focus
    WindowFocusChanged { focused: bool },

    /// The user went idle/locked or came back
    IdleStateChanged { state: IdleState },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = BrowserEvent::TabUpdated {
            tab_id: 12,
            url: "https://example.com/".to_string(),
            active: true,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"tab_updated\""));
        assert!(json.contains("\"tabId\":12"));
        assert!(json.contains("\"active\":true"));
    }

    #[test]
    fn test_idle_state_roundtrip() {
        let event = BrowserEvent::IdleStateChanged { state: IdleState::Locked };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"state\":\"locked\""));

        let back: BrowserEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_tab_activated_without_url() {
        let event: BrowserEvent =
            serde_json::from_str(r#"{"kind":"tab_activated","tabId":3,"url":null}"#).unwrap();
        assert_eq!(event, BrowserEvent::TabActivated { tab_id: 3, url: None });
    }
}
