//! Storage module for the search index
//!
//! This module holds the index contract the ingestion pipeline writes to:
//! - idempotent upsert/delete keyed by identifier
//! - batched commits
//! - the persisted harvest cursor
//! - identifier scans for deletion reconciliation

mod memory;
mod schema;
mod sqlite;
mod traits;

pub use memory::{MemoryIndex, MemoryIndexState};
pub use sqlite::{source_summaries, SourceSummary, SqliteIndex};
pub use traits::{IndexStore, StorageError, StorageResult};
