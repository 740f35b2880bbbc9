//! Storage traits and error types
//!
//! This module defines the contract the ingestion pipeline needs from an
//! index backend, and the associated error types.

use crate::document::FieldSet;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid stored cursor '{0}'")]
    InvalidCursor(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Write handle onto one source's slice of the search index
///
/// The handle is moved into the pipeline's index worker, which is the only
/// thread that ever calls into it. Upserts and deletes are idempotent per
/// identifier and become durable at the next [`IndexStore::commit`].
pub trait IndexStore: Send {
    // ===== Document Operations =====

    /// Inserts or replaces the document stored under `identifier`
    fn upsert(&mut self, identifier: &str, fields: &FieldSet) -> StorageResult<()>;

    /// Removes the document stored under `identifier`, if any
    fn delete(&mut self, identifier: &str) -> StorageResult<()>;

    /// Makes all operations applied so far durable
    fn commit(&mut self) -> StorageResult<()>;

    // ===== Reconciliation =====

    /// Visits every identifier currently indexed for this source
    fn scan_identifiers(&self, visit: &mut dyn FnMut(&str)) -> StorageResult<()>;

    // ===== Cursor Persistence =====

    /// Reads the last committed harvest watermark
    fn cursor(&self) -> StorageResult<Option<DateTime<Utc>>>;

    /// Stores a new harvest watermark; durable at the next commit
    fn set_cursor(&mut self, cursor: DateTime<Utc>) -> StorageResult<()>;
}
