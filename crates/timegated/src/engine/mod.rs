//! Engine actor - owns all tracking, limit, and enforcement state.
//!
//! The engine follows the actor pattern: a single task owns the active
//! session, the tab map, and storage access, receiving commands over an
//! mpsc channel and publishing enforcement directives over broadcast.

mod actor;
mod commands;
mod enforce;
mod handle;

pub use actor::{EngineActor, FLUSH_INTERVAL, KEEP_ALIVE_INTERVAL};
pub use commands::{DomainInfo, EngineCommand, EngineError};
pub use handle::{spawn_engine, EngineHandle};
