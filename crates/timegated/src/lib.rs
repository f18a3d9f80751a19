//! Timegate Daemon - Browsing time tracking and limit enforcement
//!
//! This crate provides the core infrastructure for the timegate daemon:
//! - `store` - Persistent key-value store backends
//! - `storage` - Typed storage layer with boundary resets
//! - `engine` - Engine actor owning session, limit, and enforcement state
//! - `server` - Unix socket server for client connections
//! - `tasks` - Periodic background tasks (extension expiry sweep)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    timegated daemon                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │  DaemonServer   │────▶│      EngineActor            │   │
//! │  │ (Unix Socket)   │     │ (session + limit state)     │   │
//! │  └────────┬────────┘     └──────┬───────────────┬──────┘   │
//! │           │                     │               │           │
//! │           │ connections         │ directives    │ storage   │
//! │           ▼                     ▼               ▼           │
//! │  ┌─────────────────┐  ┌──────────────────┐  ┌──────────┐   │
//! │  │ConnectionHandler│  │broadcast::Sender │  │ Storage  │   │
//! │  │  (per client)   │  │ (to subscribers) │  │ (JSON KV)│   │
//! │  └─────────────────┘  └──────────────────┘  └──────────┘   │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Browser integrations push tab/window/idle events over the socket;
//! the engine attributes time to domains, checks limits on every flush,
//! and pushes enforcement directives (overlays, notifications) back to
//! whichever clients subscribed.
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod engine;
pub mod server;
pub mod storage;
pub mod store;
pub mod tasks;
