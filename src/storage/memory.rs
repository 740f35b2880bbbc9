//! In-memory index
//!
//! Backs the CLI's `--dry-run` mode and gives tests a store whose every
//! write can be inspected from outside the pipeline.

use crate::document::FieldSet;
use crate::storage::traits::{IndexStore, StorageError, StorageResult};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// Everything the in-memory index has seen so far
#[derive(Debug, Clone, Default)]
pub struct MemoryIndexState {
    /// Current documents
    pub documents: BTreeMap<String, FieldSet>,
    /// Every upsert in application order
    pub upserts: Vec<String>,
    /// Every delete in application order
    pub deletes: Vec<String>,
    /// Number of `commit()` calls
    pub commits: usize,
    /// Committed cursor
    pub cursor: Option<DateTime<Utc>>,
    /// Number of `set_cursor()` calls
    pub cursor_writes: usize,
    failing: HashSet<String>,
}

/// Shared in-memory index; clones observe the same state
#[derive(Debug, Clone, Default)]
pub struct MemoryIndex {
    state: Arc<Mutex<MemoryIndexState>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an index already holding the given (empty) documents
    pub fn with_documents<I, S>(identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let index = Self::new();
        {
            let mut state = index.lock();
            for identifier in identifiers {
                state.documents.insert(identifier.into(), FieldSet::new());
            }
        }
        index
    }

    /// Sets the stored cursor as if a previous run had committed it
    pub fn with_cursor(self, cursor: DateTime<Utc>) -> Self {
        self.lock().cursor = Some(cursor);
        self
    }

    /// Makes every upsert of `identifier` fail
    pub fn fail_upserts_of(&self, identifier: &str) {
        self.lock().failing.insert(identifier.to_string());
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> MemoryIndexState {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryIndexState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl IndexStore for MemoryIndex {
    fn upsert(&mut self, identifier: &str, fields: &FieldSet) -> StorageResult<()> {
        let mut state = self.lock();
        if state.failing.contains(identifier) {
            return Err(StorageError::Database(format!(
                "rejected upsert of {}",
                identifier
            )));
        }
        state.documents.insert(identifier.to_string(), fields.clone());
        state.upserts.push(identifier.to_string());
        Ok(())
    }

    fn delete(&mut self, identifier: &str) -> StorageResult<()> {
        let mut state = self.lock();
        state.documents.remove(identifier);
        state.deletes.push(identifier.to_string());
        Ok(())
    }

    fn commit(&mut self) -> StorageResult<()> {
        self.lock().commits += 1;
        Ok(())
    }

    fn scan_identifiers(&self, visit: &mut dyn FnMut(&str)) -> StorageResult<()> {
        let identifiers: Vec<String> = self.lock().documents.keys().cloned().collect();
        for identifier in &identifiers {
            visit(identifier);
        }
        Ok(())
    }

    fn cursor(&self) -> StorageResult<Option<DateTime<Utc>>> {
        Ok(self.lock().cursor)
    }

    fn set_cursor(&mut self, cursor: DateTime<Utc>) -> StorageResult<()> {
        let mut state = self.lock();
        state.cursor = Some(cursor);
        state.cursor_writes += 1;
        Ok(())
    }
}
