//! Driver-side view of an open pipeline

use crate::document::DocumentRecord;
use crate::pipeline::{Pipeline, PipelineError, PipelineStats};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::Duration;
use tracing::info;

/// Counter values of a session at one point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub harvested: usize,
    pub deleted: usize,
    pub skipped: usize,
}

/// What a harvester sees of the pipeline it feeds
///
/// Records every identifier handed over as seen for deletion tracking and
/// logs progress every `harvest-message-step` documents.
pub struct HarvestSession {
    pipeline: Pipeline,
    message_step: usize,
    harvested: usize,
    deleted: usize,
    skipped: usize,
}

impl HarvestSession {
    pub fn new(pipeline: Pipeline, message_step: usize) -> Self {
        Self {
            pipeline,
            message_step: message_step.max(1),
            harvested: 0,
            deleted: 0,
            skipped: 0,
        }
    }

    pub fn source_id(&self) -> &str {
        self.pipeline.source_id()
    }

    /// Hands a record to the pipeline, blocking while its queue is full
    pub fn add_document(&mut self, record: DocumentRecord) -> Result<(), PipelineError> {
        if record.is_deleted() {
            self.deleted += 1;
        } else {
            self.pipeline.sync_mut().record_seen(record.identifier());
        }
        self.pipeline.add_document(record)?;

        self.harvested += 1;
        if self.harvested % self.message_step == 0 {
            info!(
                "{}: harvested {} documents so far ({} deleted, {} unchanged)",
                self.source_id(),
                self.harvested,
                self.deleted,
                self.skipped
            );
        }
        Ok(())
    }

    /// Counts an unchanged document that was not sent, keeping it from
    /// deletion reconciliation
    pub fn skip_unchanged(&mut self, identifier: &str) {
        self.pipeline.sync_mut().record_seen(identifier);
        self.skipped += 1;
    }

    /// Waits while the index stage is backed up; see [`Pipeline::check_buffer`]
    pub fn check_buffer(&mut self, max_wait: Option<Duration>) -> Result<(), PipelineError> {
        self.pipeline.check_buffer(max_wait)
    }

    /// Watermark of the last clean harvest
    pub fn from_reference(&self) -> Option<DateTime<Utc>> {
        self.pipeline.sync().cursor().from_reference()
    }

    pub fn propose_cursor(&mut self, candidate: DateTime<Utc>) {
        self.pipeline.sync_mut().cursor_mut().propose(candidate);
    }

    pub fn propose_cursor_if_newer(&mut self, candidate: DateTime<Utc>) {
        self.pipeline.sync_mut().cursor_mut().propose_if_newer(candidate);
    }

    pub fn enable_deletion_tracking(&mut self) {
        self.pipeline.sync_mut().enable_deletion_tracking();
    }

    /// Disables reconciliation for the rest of the run
    pub fn cancel_deletion_tracking(&mut self) {
        self.pipeline.sync_mut().cancel_deletion_tracking();
    }

    pub fn is_up_to_date(&self, datestamp: Option<DateTime<Utc>>) -> bool {
        self.pipeline.sync().is_up_to_date(datestamp)
    }

    pub fn set_variable(&mut self, name: &str, value: &str) {
        self.pipeline.set_variable(name, value);
    }

    pub fn register_commit_listener(
        &self,
        listener: impl Fn(&HashSet<String>) + Send + Sync + 'static,
    ) {
        self.pipeline.register_commit_listener(listener);
    }

    pub fn tally(&self) -> Tally {
        Tally {
            harvested: self.harvested,
            deleted: self.deleted,
            skipped: self.skipped,
        }
    }

    /// Resets the counters to `tally` before a page is read again
    ///
    /// A retried page hands its records to the pipeline a second time; they
    /// are counted once.
    pub fn rewind(&mut self, tally: Tally) {
        self.harvested = tally.harvested;
        self.deleted = tally.deleted;
        self.skipped = tally.skipped;
    }

    /// Documents handed to the pipeline, deletions included
    pub fn harvested(&self) -> usize {
        self.harvested
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Closes the pipeline; see [`Pipeline::close`]
    pub fn finish(mut self, clean: bool) -> Result<PipelineStats, PipelineError> {
        let result = self.pipeline.close(clean);
        if let Ok(stats) = &result {
            info!(
                "{}: harvest finished, {} documents received ({} deleted at source, {} unchanged); {} updated, {} deleted, {} removed as missing",
                self.source_id(),
                self.harvested,
                self.deleted,
                self.skipped,
                stats.indexed,
                stats.deleted,
                stats.reconciled
            );
        }
        result
    }
}
