//! SQLite index implementation
//!
//! This module provides a SQLite-backed implementation of the IndexStore trait.
//! Writes are grouped into one transaction per commit batch.

use crate::document::FieldSet;
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{IndexStore, StorageError, StorageResult};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

/// SQLite index handle scoped to one source
pub struct SqliteIndex {
    conn: Connection,
    source: String,
}

/// Per-source overview used by the CLI's `--stats` mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSummary {
    pub source: String,
    pub documents: u64,
    pub cursor: Option<String>,
}

impl SqliteIndex {
    /// Opens (or creates) the index database for one source
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    /// * `source` - Identifier of the source whose documents this handle manages
    pub fn open(path: &Path, source: &str) -> StorageResult<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self {
            conn,
            source: source.to_string(),
        })
    }

    /// Creates an in-memory index (for testing)
    #[cfg(test)]
    pub fn open_in_memory(source: &str) -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn,
            source: source.to_string(),
        })
    }

    /// Number of documents indexed for this source, uncommitted writes included
    pub fn document_count(&self) -> StorageResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE source = ?1",
            params![self.source],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Loads the stored fields of one document
    pub fn fields(&self, identifier: &str) -> StorageResult<Option<FieldSet>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT fields FROM documents WHERE source = ?1 AND identifier = ?2",
                params![self.source, identifier],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn begin_if_needed(&mut self) -> StorageResult<()> {
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN")?;
        }
        Ok(())
    }
}

impl IndexStore for SqliteIndex {
    // ===== Document Operations =====

    fn upsert(&mut self, identifier: &str, fields: &FieldSet) -> StorageResult<()> {
        self.begin_if_needed()?;
        let json = serde_json::to_string(fields)?;
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO documents (source, identifier, fields, indexed_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(source, identifier)
             DO UPDATE SET fields = excluded.fields, indexed_at = excluded.indexed_at",
            params![self.source, identifier, json, now],
        )?;
        Ok(())
    }

    fn delete(&mut self, identifier: &str) -> StorageResult<()> {
        self.begin_if_needed()?;
        self.conn.execute(
            "DELETE FROM documents WHERE source = ?1 AND identifier = ?2",
            params![self.source, identifier],
        )?;
        Ok(())
    }

    fn commit(&mut self) -> StorageResult<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    // ===== Reconciliation =====

    fn scan_identifiers(&self, visit: &mut dyn FnMut(&str)) -> StorageResult<()> {
        let mut stmt = self
            .conn
            .prepare("SELECT identifier FROM documents WHERE source = ?1")?;
        let mut rows = stmt.query(params![self.source])?;
        while let Some(row) = rows.next()? {
            let identifier: String = row.get(0)?;
            visit(&identifier);
        }
        Ok(())
    }

    // ===== Cursor Persistence =====

    fn cursor(&self) -> StorageResult<Option<DateTime<Utc>>> {
        let raw: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT cursor FROM harvester_metadata WHERE source = ?1",
                params![self.source],
                |row| row.get(0),
            )
            .optional()?;

        match raw.flatten() {
            Some(value) => DateTime::parse_from_rfc3339(&value)
                .map(|ts| Some(ts.with_timezone(&Utc)))
                .map_err(|_| StorageError::InvalidCursor(value)),
            None => Ok(None),
        }
    }

    fn set_cursor(&mut self, cursor: DateTime<Utc>) -> StorageResult<()> {
        self.begin_if_needed()?;
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO harvester_metadata (source, cursor, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(source) DO UPDATE SET cursor = excluded.cursor, updated_at = excluded.updated_at",
            params![self.source, cursor.to_rfc3339(), now],
        )?;
        Ok(())
    }
}

/// Lists document counts and cursors for every source in a database
pub fn source_summaries(path: &Path) -> StorageResult<Vec<SourceSummary>> {
    let conn = Connection::open(path)?;
    initialize_schema(&conn)?;

    let mut stmt = conn.prepare(
        "SELECT s.source,
                (SELECT COUNT(*) FROM documents d WHERE d.source = s.source),
                (SELECT cursor FROM harvester_metadata m WHERE m.source = s.source)
         FROM (SELECT source FROM documents UNION SELECT source FROM harvester_metadata) s
         ORDER BY s.source",
    )?;

    let summaries = stmt
        .query_map([], |row| {
            Ok(SourceSummary {
                source: row.get(0)?,
                documents: row.get::<_, i64>(1)? as u64,
                cursor: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(summaries)
}
