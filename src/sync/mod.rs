//! Incremental sync and deletion tracking
//!
//! A [`SyncTracker`] lives for one pipeline run. It carries the cursor read at
//! open, the watermark proposed during the run, and (for full harvests) the
//! identifiers observed so that missing documents can be deleted at a clean
//! close.

mod seen;

pub use seen::SeenIdentifiers;

use chrono::{DateTime, Utc};

/// Committed and proposed harvest watermarks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    from_reference: Option<DateTime<Utc>>,
    candidate_reference: Option<DateTime<Utc>>,
}

impl Cursor {
    pub fn new(from_reference: Option<DateTime<Utc>>) -> Self {
        Self {
            from_reference,
            candidate_reference: None,
        }
    }

    /// Watermark committed by the last clean run
    pub fn from_reference(&self) -> Option<DateTime<Utc>> {
        self.from_reference
    }

    /// Watermark that a clean close of this run will persist
    pub fn candidate_reference(&self) -> Option<DateTime<Utc>> {
        self.candidate_reference
    }

    pub fn propose(&mut self, candidate: DateTime<Utc>) {
        self.candidate_reference = Some(candidate);
    }

    /// Proposes `candidate` unless a later watermark is already proposed
    pub fn propose_if_newer(&mut self, candidate: DateTime<Utc>) {
        if self.candidate_reference.map_or(true, |current| candidate > current) {
            self.candidate_reference = Some(candidate);
        }
    }
}

/// Per-run cursor and seen-identifier bookkeeping
///
/// Written only by the driving thread; handed to the index worker at close.
#[derive(Debug, Default)]
pub struct SyncTracker {
    cursor: Cursor,
    seen: Option<SeenIdentifiers>,
    cancelled: bool,
}

impl SyncTracker {
    pub fn new(from_reference: Option<DateTime<Utc>>) -> Self {
        Self {
            cursor: Cursor::new(from_reference),
            seen: None,
            cancelled: false,
        }
    }

    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    pub fn cursor_mut(&mut self) -> &mut Cursor {
        &mut self.cursor
    }

    /// Starts collecting seen identifiers for deletion reconciliation
    ///
    /// Has no effect once tracking was cancelled for this run.
    pub fn enable_deletion_tracking(&mut self) {
        if !self.cancelled && self.seen.is_none() {
            self.seen = Some(SeenIdentifiers::new());
        }
    }

    /// Disables deletion reconciliation for the rest of this run
    pub fn cancel_deletion_tracking(&mut self) {
        self.cancelled = true;
        self.seen = None;
    }

    pub fn is_tracking_deletions(&self) -> bool {
        self.seen.is_some()
    }

    pub fn record_seen(&mut self, identifier: &str) {
        if let Some(seen) = self.seen.as_mut() {
            seen.insert(identifier);
        }
    }

    /// True when `datestamp` is not newer than the committed watermark
    pub fn is_up_to_date(&self, datestamp: Option<DateTime<Utc>>) -> bool {
        match (datestamp, self.cursor.from_reference) {
            (Some(datestamp), Some(from)) => datestamp <= from,
            _ => false,
        }
    }

    /// Number of distinct identifiers recorded so far
    pub fn seen_count(&self) -> usize {
        self.seen.as_ref().map_or(0, SeenIdentifiers::len)
    }

    pub(crate) fn take_seen(&mut self) -> Option<SeenIdentifiers> {
        self.seen.take()
    }
}
