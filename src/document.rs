//! Records flowing from sources into the ingestion pipeline
//!
//! A [`DocumentRecord`] is what a harvester produces for every source item.
//! The convert stage turns it into an [`IndexableEntry`], which the index
//! stage applies to the store.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Converted document fields: field name -> values
pub type FieldSet = BTreeMap<String, Vec<String>>;

/// A single item harvested from a source
///
/// Deleted records never carry a payload; the constructors and
/// [`DocumentRecord::mark_deleted`] keep that invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRecord {
    identifier: String,
    datestamp: Option<DateTime<Utc>>,
    deleted: bool,
    payload: Option<String>,
}

impl DocumentRecord {
    /// Creates a live record with its raw XML payload
    pub fn new(
        identifier: impl Into<String>,
        datestamp: Option<DateTime<Utc>>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            datestamp,
            deleted: false,
            payload: Some(payload.into()),
        }
    }

    /// Creates a live record whose payload the source did not deliver
    ///
    /// The convert stage reports these as conversion failures, so the
    /// configured error action decides their fate.
    pub fn without_payload(identifier: impl Into<String>, datestamp: Option<DateTime<Utc>>) -> Self {
        Self {
            identifier: identifier.into(),
            datestamp,
            deleted: false,
            payload: None,
        }
    }

    /// Creates a delete marker
    pub fn deleted(identifier: impl Into<String>, datestamp: Option<DateTime<Utc>>) -> Self {
        Self {
            identifier: identifier.into(),
            datestamp,
            deleted: true,
            payload: None,
        }
    }

    /// Flags the record as deleted and drops its payload
    pub fn mark_deleted(&mut self) {
        self.deleted = true;
        self.payload = None;
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn datestamp(&self) -> Option<DateTime<Utc>> {
        self.datestamp
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn payload(&self) -> Option<&str> {
        self.payload.as_deref()
    }
}

/// Output of the convert stage: an upsert or a delete marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexableEntry {
    identifier: String,
    fields: Option<FieldSet>,
}

impl IndexableEntry {
    pub fn upsert(identifier: impl Into<String>, fields: FieldSet) -> Self {
        Self {
            identifier: identifier.into(),
            fields: Some(fields),
        }
    }

    pub fn delete(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            fields: None,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Converted fields, `None` for a delete marker
    pub fn fields(&self) -> Option<&FieldSet> {
        self.fields.as_ref()
    }

    pub fn is_delete(&self) -> bool {
        self.fields.is_none()
    }
}
