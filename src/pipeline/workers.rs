//! Pipeline worker threads
//!
//! Converter workers pop raw records from their own bounded queue and push
//! indexable entries onto the shared index queue. The single index worker
//! applies those entries to the store in queue order and commits in batches.
//!
//! The first failure of any worker is latched in [`FailureLatch`]. From then
//! on every worker keeps draining its queue without doing work, so producers
//! never block on a queue nobody reads.

use crate::document::{DocumentRecord, FieldSet, IndexableEntry};
use crate::pipeline::convert::{ConvertContext, ConvertError, DocumentConverter, ErrorAction};
use crate::storage::{IndexStore, StorageError, StorageResult};
use crate::sync::SeenIdentifiers;
use chrono::{DateTime, SecondsFormat, Utc};
use crossbeam_channel::{Receiver, Sender};
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Failure captured from a worker thread
#[derive(Debug, Error)]
pub enum WorkerFailure {
    #[error("Conversion of {identifier} failed: {source}")]
    Conversion {
        identifier: String,
        #[source]
        source: ConvertError,
    },

    #[error("Index operation on {identifier} failed: {source}")]
    Index {
        identifier: String,
        #[source]
        source: StorageError,
    },

    #[error("Commit failed: {0}")]
    Commit(#[source] StorageError),

    #[error("Finalizing the run failed: {0}")]
    Finalize(#[source] StorageError),

    #[error("Worker {worker} panicked")]
    Panicked { worker: String },
}

/// Callback fired after every commit with the identifiers it made durable
pub type CommitListener = Box<dyn Fn(&HashSet<String>) + Send + Sync>;

pub(crate) type Listeners = Arc<Mutex<Vec<CommitListener>>>;

pub(crate) enum RawMessage {
    Document(DocumentRecord),
    EndOfStream,
}

pub(crate) enum IndexMessage {
    Entry(IndexableEntry),
    /// End of stream; carries the cursor and seen-set only for a clean close
    Finish(Option<Finalization>),
}

pub(crate) struct Finalization {
    pub cursor: Option<DateTime<Utc>>,
    pub seen: Option<SeenIdentifiers>,
}

/// First-writer-wins slot for a worker failure
#[derive(Default)]
pub(crate) struct FailureLatch {
    slot: Mutex<Option<WorkerFailure>>,
    tripped: AtomicBool,
}

impl FailureLatch {
    /// Stores `failure` unless an earlier one is already latched
    pub fn record(&self, failure: WorkerFailure) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if self.tripped.load(Ordering::Acquire) {
            debug!("Suppressing follow-up failure: {}", failure);
            return false;
        }
        *slot = Some(failure);
        self.tripped.store(true, Ordering::Release);
        true
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    /// Hands out the latched failure; later calls return `None`
    pub fn take(&self) -> Option<WorkerFailure> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Wakes a producer waiting for the index queue to drain
#[derive(Default)]
pub(crate) struct BufferGauge {
    lock: Mutex<()>,
    changed: Condvar,
}

impl BufferGauge {
    pub fn notify(&self) {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.changed.notify_all();
    }

    /// Blocks until `done` holds or `deadline` passes; true if `done` held
    pub fn wait_until(&self, deadline: Option<Instant>, mut done: impl FnMut() -> bool) -> bool {
        let mut guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if done() {
                return true;
            }
            let mut slice = POLL_INTERVAL;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                slice = slice.min(deadline - now);
            }
            guard = match self.changed.wait_timeout(guard, slice) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

#[derive(Default)]
pub(crate) struct Counters {
    pub indexed: AtomicUsize,
    pub deleted: AtomicUsize,
    pub reconciled: AtomicUsize,
    pub ignored: AtomicUsize,
    pub commits: AtomicUsize,
}

impl Counters {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// State shared by the driving thread and all workers
#[derive(Default)]
pub(crate) struct Shared {
    pub latch: FailureLatch,
    pub gauge: BufferGauge,
    pub counters: Counters,
}

impl Shared {
    pub fn fail(&self, failure: WorkerFailure) {
        if self.latch.record(failure) {
            error!("Pipeline worker failed; discarding remaining queued work");
        }
        self.gauge.notify();
    }
}

pub(crate) struct ConverterWorker {
    pub name: String,
    pub input: Receiver<RawMessage>,
    pub output: Sender<IndexMessage>,
    pub converter: Arc<dyn DocumentConverter>,
    pub context: ConvertContext,
    pub action: ErrorAction,
    pub shared: Arc<Shared>,
}

impl ConverterWorker {
    pub fn run(self) {
        debug!("{} started", self.name);
        while let Ok(message) = self.input.recv() {
            let record = match message {
                RawMessage::Document(record) => record,
                RawMessage::EndOfStream => break,
            };
            if self.shared.latch.is_tripped() {
                continue;
            }
            if let Some(entry) = self.convert(record) {
                if self.output.send(IndexMessage::Entry(entry)).is_err() {
                    break;
                }
            }
        }
        debug!("{} stopped", self.name);
    }

    fn convert(&self, record: DocumentRecord) -> Option<IndexableEntry> {
        let identifier = record.identifier().to_string();
        if record.is_deleted() {
            return Some(IndexableEntry::delete(identifier));
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.converter.convert(&record, &self.context)
        }));

        match outcome {
            Ok(Ok(mut fields)) => {
                add_standard_fields(&mut fields, &record, &self.context);
                Some(IndexableEntry::upsert(identifier, fields))
            }
            Ok(Err(err)) => self.handle_error(identifier, err),
            Err(_) => {
                self.shared.fail(WorkerFailure::Panicked {
                    worker: format!("{} (while converting {})", self.name, identifier),
                });
                None
            }
        }
    }

    fn handle_error(&self, identifier: String, err: ConvertError) -> Option<IndexableEntry> {
        match self.action {
            ErrorAction::Stop => {
                error!("Conversion of {} failed, stopping harvest: {}", identifier, err);
                self.shared.fail(WorkerFailure::Conversion {
                    identifier,
                    source: err,
                });
                None
            }
            ErrorAction::Ignore => {
                warn!("Ignoring document {}: {}", identifier, err);
                Counters::bump(&self.shared.counters.ignored);
                None
            }
            ErrorAction::Delete => {
                warn!("Deleting document {} after failed conversion: {}", identifier, err);
                Some(IndexableEntry::delete(identifier))
            }
        }
    }
}

fn add_standard_fields(fields: &mut FieldSet, record: &DocumentRecord, context: &ConvertContext) {
    fields.insert(
        "_identifier".to_string(),
        vec![record.identifier().to_string()],
    );
    fields.insert("_source".to_string(), vec![context.source_id().to_string()]);
    if let Some(datestamp) = record.datestamp() {
        fields.insert(
            "_datestamp".to_string(),
            vec![datestamp.to_rfc3339_opts(SecondsFormat::Secs, true)],
        );
    }
}

pub(crate) struct IndexWorker {
    pub input: Receiver<IndexMessage>,
    pub store: Box<dyn IndexStore>,
    pub bulk_size: usize,
    pub listeners: Listeners,
    pub shared: Arc<Shared>,
    pending: HashSet<String>,
    uncommitted: usize,
}

impl IndexWorker {
    pub fn new(
        input: Receiver<IndexMessage>,
        store: Box<dyn IndexStore>,
        bulk_size: usize,
        listeners: Listeners,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            input,
            store,
            bulk_size,
            listeners,
            shared,
            pending: HashSet::new(),
            uncommitted: 0,
        }
    }

    pub fn run(mut self) {
        debug!("Index worker started");
        while let Ok(message) = self.input.recv() {
            self.shared.gauge.notify();
            match message {
                IndexMessage::Entry(entry) => {
                    if self.shared.latch.is_tripped() {
                        continue;
                    }
                    let identifier = entry.identifier().to_string();
                    if panic::catch_unwind(AssertUnwindSafe(|| self.apply(entry))).is_err() {
                        self.shared.fail(WorkerFailure::Panicked {
                            worker: format!("index worker (while applying {})", identifier),
                        });
                    }
                }
                IndexMessage::Finish(finalization) => {
                    if !self.shared.latch.is_tripped()
                        && panic::catch_unwind(AssertUnwindSafe(|| self.finish(finalization)))
                            .is_err()
                    {
                        self.shared.fail(WorkerFailure::Panicked {
                            worker: "index worker (while finishing)".to_string(),
                        });
                    }
                    break;
                }
            }
        }
        debug!("Index worker stopped");
    }

    fn apply(&mut self, entry: IndexableEntry) {
        let identifier = entry.identifier();
        let result = match entry.fields() {
            Some(fields) => self.store.upsert(identifier, fields),
            None => self.store.delete(identifier),
        };

        if let Err(source) = result {
            error!("Index operation on {} failed: {}", identifier, source);
            self.shared.fail(WorkerFailure::Index {
                identifier: identifier.to_string(),
                source,
            });
            return;
        }

        let counters = &self.shared.counters;
        if entry.is_delete() {
            Counters::bump(&counters.deleted);
        } else {
            Counters::bump(&counters.indexed);
        }
        self.pending.insert(identifier.to_string());
        self.uncommitted += 1;

        if self.uncommitted >= self.bulk_size {
            self.commit_batch();
        }
    }

    fn finish(&mut self, finalization: Option<Finalization>) {
        if let Some(Finalization { cursor, seen }) = finalization {
            if let Some(seen) = seen {
                if let Err(err) = self.reconcile(&seen) {
                    self.shared.fail(WorkerFailure::Finalize(err));
                    return;
                }
            }
            if let Some(cursor) = cursor {
                if let Err(err) = self.store.set_cursor(cursor) {
                    self.shared.fail(WorkerFailure::Finalize(err));
                    return;
                }
                info!("Harvest cursor set to {}", cursor.to_rfc3339());
            }
        }
        self.commit_batch();
    }

    /// Deletes every indexed identifier the finished run did not see
    fn reconcile(&mut self, seen: &SeenIdentifiers) -> StorageResult<()> {
        let mut missing = Vec::new();
        self.store.scan_identifiers(&mut |identifier| {
            if !seen.contains(identifier) {
                missing.push(identifier.to_string());
            }
        })?;

        if missing.is_empty() {
            debug!("No documents missing from source ({} seen)", seen.len());
            return Ok(());
        }

        info!("Deleting {} documents no longer present at the source", missing.len());
        for identifier in missing {
            self.store.delete(&identifier)?;
            Counters::bump(&self.shared.counters.reconciled);
            self.pending.insert(identifier);
            self.uncommitted += 1;
        }
        Ok(())
    }

    fn commit_batch(&mut self) {
        if let Err(err) = self.store.commit() {
            error!("Commit failed: {}", err);
            self.shared.fail(WorkerFailure::Commit(err));
            return;
        }
        Counters::bump(&self.shared.counters.commits);
        self.uncommitted = 0;

        let committed = std::mem::take(&mut self.pending);
        if committed.is_empty() {
            return;
        }

        let counters = &self.shared.counters;
        info!(
            "{} docs deleted and {} docs (re-)indexed so far",
            counters.deleted.load(Ordering::Relaxed) + counters.reconciled.load(Ordering::Relaxed),
            counters.indexed.load(Ordering::Relaxed)
        );

        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            listener(&committed);
        }
    }
}
