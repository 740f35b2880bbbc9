//! Database schema definitions
//!
//! Documents of every configured source share one table keyed by
//! `(source, identifier)`; the per-source harvest cursor lives in a
//! metadata table next to it.

/// SQL schema for the index database
pub const SCHEMA_SQL: &str = r#"
-- Indexed documents, one row per source and identifier
CREATE TABLE IF NOT EXISTS documents (
    source TEXT NOT NULL,
    identifier TEXT NOT NULL,
    fields TEXT NOT NULL,
    indexed_at TEXT NOT NULL,
    PRIMARY KEY (source, identifier)
);

CREATE INDEX IF NOT EXISTS idx_documents_source ON documents(source);

-- Harvest watermark per source
CREATE TABLE IF NOT EXISTS harvester_metadata (
    source TEXT PRIMARY KEY,
    cursor TEXT,
    updated_at TEXT NOT NULL
);
"#;

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The database connection
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
