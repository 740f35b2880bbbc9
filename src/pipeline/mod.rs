//! Concurrent ingestion pipeline
//!
//! ```text
//! driver --add_document--> [raw queue x N] --> converter x N
//!                                                  |
//!                                                  v
//!                       store <-- index worker <-- [index queue]
//! ```
//!
//! Raw records are routed to a converter by a hash of their identifier, so
//! all operations on one identifier pass through the same converter and
//! reach the index worker in the order they were added. The index worker is
//! the only thread that touches the store.
//!
//! The cursor and deletion reconciliation are applied by [`Pipeline::close`]
//! only when the caller reports a clean run and no worker failed.

mod convert;
mod workers;

pub use convert::{ConvertContext, ConvertError, DocumentConverter, ErrorAction, XmlFieldExtractor};
pub use workers::{CommitListener, WorkerFailure};

use crate::config::{validate_pipeline_config, PipelineConfig};
use crate::document::DocumentRecord;
use crate::storage::{IndexStore, StorageError};
use crate::sync::SyncTracker;
use crate::ConfigError;
use crossbeam_channel::{bounded, Sender};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use workers::{
    ConverterWorker, Finalization, IndexMessage, IndexWorker, Listeners, RawMessage, Shared,
};

/// Errors surfaced to the thread driving a pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid pipeline settings: {0}")]
    InvalidSettings(#[from] ConfigError),

    #[error("Background failure: {0}")]
    BackgroundFailure(#[source] WorkerFailure),

    #[error("Pipeline was aborted by an earlier background failure")]
    Aborted,

    #[error("Pipeline is closed")]
    Closed,

    #[error("Document identifier is empty")]
    EmptyIdentifier,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Lifecycle of a pipeline; a closed pipeline cannot be reopened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Opened, no worker threads yet
    Open,
    /// Worker threads are running
    Running,
    Closed { clean: bool },
}

/// Counts reported by [`Pipeline::close`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Documents upserted
    pub indexed: usize,
    /// Delete markers applied
    pub deleted: usize,
    /// Deletes issued by reconciliation at close
    pub reconciled: usize,
    /// Documents dropped after a failed conversion
    pub ignored: usize,
    pub commits: usize,
}

/// Bounded producer/consumer pipeline from raw records to the index
pub struct Pipeline {
    source_id: String,
    config: PipelineConfig,
    state: PipelineState,
    store: Option<Box<dyn IndexStore>>,
    converter: Arc<dyn DocumentConverter>,
    context: ConvertContext,
    sync: SyncTracker,
    shared: Arc<Shared>,
    listeners: Listeners,
    raw_senders: Vec<Sender<RawMessage>>,
    index_sender: Option<Sender<IndexMessage>>,
    converters: Vec<JoinHandle<()>>,
    indexer: Option<JoinHandle<()>>,
    poisoned: bool,
}

impl Pipeline {
    /// Validates the settings and reads the stored cursor
    ///
    /// Worker threads start on first use.
    pub fn open(
        source_id: &str,
        config: &PipelineConfig,
        store: Box<dyn IndexStore>,
        converter: Arc<dyn DocumentConverter>,
    ) -> Result<Self, PipelineError> {
        validate_pipeline_config(config)?;
        let from_reference = store.cursor()?;

        match from_reference {
            Some(cursor) => info!(
                "Opened pipeline for {} (last harvest: {})",
                source_id,
                cursor.to_rfc3339()
            ),
            None => info!("Opened pipeline for {} (no previous harvest)", source_id),
        }

        Ok(Self {
            source_id: source_id.to_string(),
            config: config.clone(),
            state: PipelineState::Open,
            store: Some(store),
            converter,
            context: ConvertContext::new(source_id),
            sync: SyncTracker::new(from_reference),
            shared: Arc::new(Shared::default()),
            listeners: Arc::new(Mutex::new(Vec::new())),
            raw_senders: Vec::new(),
            index_sender: None,
            converters: Vec::new(),
            indexer: None,
            poisoned: false,
        })
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn sync(&self) -> &SyncTracker {
        &self.sync
    }

    pub fn sync_mut(&mut self) -> &mut SyncTracker {
        &mut self.sync
    }

    /// Sets a variable visible to the converter; only before the first document
    pub fn set_variable(&mut self, name: &str, value: &str) {
        if self.state == PipelineState::Open {
            self.context.set_variable(name, value);
        } else {
            warn!("Ignoring converter variable {} set after start", name);
        }
    }

    /// Registers a callback fired after each commit with the committed identifiers
    pub fn register_commit_listener(
        &self,
        listener: impl Fn(&HashSet<String>) + Send + Sync + 'static,
    ) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(listener));
    }

    /// Enqueues a record, blocking while its converter queue is full
    pub fn add_document(&mut self, record: DocumentRecord) -> Result<(), PipelineError> {
        self.ensure_accepting()?;
        if record.identifier().is_empty() {
            return Err(PipelineError::EmptyIdentifier);
        }
        self.start()?;

        let shard = shard_for(record.identifier(), self.raw_senders.len());
        if self.raw_senders[shard]
            .send(RawMessage::Document(record))
            .is_err()
        {
            self.surface_failure()?;
            self.poisoned = true;
            return Err(PipelineError::Aborted);
        }
        Ok(())
    }

    /// Blocks while the index queue is more than half full
    ///
    /// Waits at most `max_wait` when given. Returns a latched worker failure
    /// if one occurs before or during the wait.
    pub fn check_buffer(&mut self, max_wait: Option<Duration>) -> Result<(), PipelineError> {
        self.ensure_accepting()?;

        if let Some(sender) = &self.index_sender {
            let threshold = self.config.max_indexer_queue / 2;
            if sender.len() > threshold {
                debug!(
                    "Index queue holds {} entries, waiting for it to drain",
                    sender.len()
                );
                let shared = &self.shared;
                let deadline = max_wait.map(|wait| Instant::now() + wait);
                let drained = shared.gauge.wait_until(deadline, || {
                    sender.len() <= threshold || shared.latch.is_tripped()
                });
                if !drained {
                    debug!("Stopped waiting for index queue after {:?}", max_wait);
                }
            }
        }

        self.surface_failure()
    }

    /// Current (raw, index) queue depths
    pub fn queue_depths(&self) -> (usize, usize) {
        let raw = self.raw_senders.iter().map(Sender::len).sum();
        let index = self.index_sender.as_ref().map_or(0, Sender::len);
        (raw, index)
    }

    /// Drains and stops all workers
    ///
    /// With `clean` set and no worker failure, the index worker reconciles
    /// deletions and persists the proposed cursor before its final commit.
    /// Otherwise both are left untouched. Any latched failure is returned.
    pub fn close(&mut self, clean: bool) -> Result<PipelineStats, PipelineError> {
        if let PipelineState::Closed { .. } = self.state {
            return Err(PipelineError::Closed);
        }
        self.start()?;

        for sender in self.raw_senders.drain(..) {
            let _ = sender.send(RawMessage::EndOfStream);
        }
        for handle in self.converters.drain(..) {
            if handle.join().is_err() {
                self.shared.fail(WorkerFailure::Panicked {
                    worker: "converter".to_string(),
                });
            }
        }

        let failed = self.poisoned || self.shared.latch.is_tripped();
        let finalization = (clean && !failed).then(|| Finalization {
            cursor: self.sync.cursor().candidate_reference(),
            seen: self.sync.take_seen(),
        });
        if !clean {
            info!(
                "Closing {} after an unsuccessful harvest; cursor stays unchanged",
                self.source_id
            );
        }

        if let Some(sender) = self.index_sender.take() {
            let _ = sender.send(IndexMessage::Finish(finalization));
        }
        if let Some(handle) = self.indexer.take() {
            if handle.join().is_err() {
                self.shared.fail(WorkerFailure::Panicked {
                    worker: "index worker".to_string(),
                });
            }
        }

        let clean_close = clean && !self.poisoned && !self.shared.latch.is_tripped();
        self.state = PipelineState::Closed { clean: clean_close };

        let stats = self.stats();
        info!(
            "Pipeline for {} closed: {} indexed, {} deleted, {} removed as missing, {} ignored, {} commits",
            self.source_id,
            stats.indexed,
            stats.deleted,
            stats.reconciled,
            stats.ignored,
            stats.commits
        );

        self.surface_failure()?;
        if self.poisoned {
            return Err(PipelineError::Aborted);
        }
        Ok(stats)
    }

    fn stats(&self) -> PipelineStats {
        let counters = &self.shared.counters;
        PipelineStats {
            indexed: counters.indexed.load(Ordering::Relaxed),
            deleted: counters.deleted.load(Ordering::Relaxed),
            reconciled: counters.reconciled.load(Ordering::Relaxed),
            ignored: counters.ignored.load(Ordering::Relaxed),
            commits: counters.commits.load(Ordering::Relaxed),
        }
    }

    fn ensure_accepting(&mut self) -> Result<(), PipelineError> {
        if let PipelineState::Closed { .. } = self.state {
            return Err(PipelineError::Closed);
        }
        if self.poisoned {
            return Err(PipelineError::Aborted);
        }
        self.surface_failure()
    }

    /// Returns the latched failure once; the pipeline stays poisoned afterwards
    fn surface_failure(&mut self) -> Result<(), PipelineError> {
        if let Some(failure) = self.shared.latch.take() {
            self.poisoned = true;
            return Err(PipelineError::BackgroundFailure(failure));
        }
        Ok(())
    }

    fn start(&mut self) -> Result<(), PipelineError> {
        if self.state != PipelineState::Open {
            return Ok(());
        }
        let store = self.store.take().ok_or(PipelineError::Closed)?;

        let threads = self.config.num_converter_threads;
        let per_converter = (self.config.max_converter_queue / threads).max(1);
        let (index_sender, index_receiver) = bounded(self.config.max_indexer_queue);

        let indexer = IndexWorker::new(
            index_receiver,
            store,
            self.config.bulk_size,
            self.listeners.clone(),
            self.shared.clone(),
        );
        let indexer = thread::Builder::new()
            .name(format!("{}-index", self.source_id))
            .spawn(move || indexer.run())
            .map_err(PipelineError::Spawn)?;
        self.indexer = Some(indexer);

        for i in 0..threads {
            let (raw_sender, raw_receiver) = bounded(per_converter);
            let worker = ConverterWorker {
                name: format!("{}-convert-{}", self.source_id, i),
                input: raw_receiver,
                output: index_sender.clone(),
                converter: self.converter.clone(),
                context: self.context.clone(),
                action: self.config.conversion_error_action,
                shared: self.shared.clone(),
            };
            let handle = thread::Builder::new()
                .name(worker.name.clone())
                .spawn(move || worker.run())
                .map_err(PipelineError::Spawn)?;
            self.raw_senders.push(raw_sender);
            self.converters.push(handle);
        }

        self.index_sender = Some(index_sender);
        self.state = PipelineState::Running;
        debug!(
            "Started {} converter threads and 1 index worker for {}",
            threads, self.source_id
        );
        Ok(())
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.state == PipelineState::Running {
            warn!(
                "Pipeline for {} dropped without close; shutting down",
                self.source_id
            );
            let _ = self.close(false);
        }
    }
}

fn shard_for(identifier: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    identifier.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}
