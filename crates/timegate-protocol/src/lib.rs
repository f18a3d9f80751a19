//! Timegate Protocol - Wire protocol for daemon communication
//!
//! This crate provides message types for communication between browser
//! integrations, CLI clients, and the timegate daemon: requests carrying
//! an action, replies carrying results or enforcement directives, and
//! browser events pushed into the tracker.

pub mod event;
pub mod request;
pub mod response;
pub mod version;

pub use event::{BrowserEvent, IdleState};
pub use request::{Action, ClientRequest, DomainUpdates, SettingsUpdate};
pub use response::{DaemonReply, Directive, ErrorCode};
pub use version::ProtocolVersion;
