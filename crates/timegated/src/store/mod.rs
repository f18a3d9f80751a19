//! Persistent key-value store backends.
//!
//! The daemon treats persistence as an async key-value service holding
//! JSON values. Two backends are provided: an in-memory store for tests
//! and a JSON file store for production. The typed layer on top lives
//! in [`crate::storage`].
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result`

mod file;
mod memory;

pub use file::JsonFileStore;
pub use memory::MemoryStore;

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

/// Errors that can occur in store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Async key-value store holding JSON values.
///
/// Implementations serialize writes internally; callers may hold the
/// store behind an `Arc` and use it from multiple tasks.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Reads a key. Returns `None` if the key is absent.
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError>;

    /// Writes a key, replacing any previous value.
    async fn set(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError>;

    /// Removes a key. Removing an absent key is not an error.
    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Removes every key.
    async fn clear(&self) -> Result<(), StoreError>;

    /// Returns all keys and values, for export.
    async fn snapshot(&self) -> Result<BTreeMap<String, serde_json::Value>, StoreError>;
}
