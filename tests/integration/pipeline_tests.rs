//! Integration tests for the ingestion pipeline
//!
//! These tests drive a pipeline against the in-memory index and check
//! batching, reconciliation, failure propagation and backpressure.

use crate::common::{Gate, GatedIndex};
use chrono::{TimeZone, Utc};
use metaharvest::config::PipelineConfig;
use metaharvest::document::{DocumentRecord, FieldSet};
use metaharvest::pipeline::{
    ConvertContext, ConvertError, DocumentConverter, ErrorAction, Pipeline, PipelineError,
    WorkerFailure, XmlFieldExtractor,
};
use metaharvest::storage::MemoryIndex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn config(bulk_size: usize) -> PipelineConfig {
    PipelineConfig {
        bulk_size,
        ..PipelineConfig::default()
    }
}

fn open_with(
    index: &MemoryIndex,
    config: &PipelineConfig,
    converter: Arc<dyn DocumentConverter>,
) -> Pipeline {
    Pipeline::open("test", config, Box::new(index.clone()), converter)
        .expect("Failed to open pipeline")
}

fn open(index: &MemoryIndex, config: &PipelineConfig) -> Pipeline {
    open_with(index, config, Arc::new(XmlFieldExtractor))
}

fn doc(identifier: &str) -> DocumentRecord {
    DocumentRecord::new(identifier, None, format!("<doc><id>{}</id></doc>", identifier))
}

/// Converter rejecting every record whose identifier starts with "bad"
fn picky_converter() -> Arc<dyn DocumentConverter> {
    Arc::new(
        |record: &DocumentRecord, context: &ConvertContext| -> Result<FieldSet, ConvertError> {
            if record.identifier().starts_with("bad") {
                return Err(ConvertError::Rejected("bad record".to_string()));
            }
            XmlFieldExtractor.convert(record, context)
        },
    )
}

#[test]
fn test_commit_batches_follow_bulk_size() {
    let index = MemoryIndex::new();
    let mut pipeline = open(&index, &config(2));

    let batches: Arc<Mutex<Vec<HashSet<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = batches.clone();
    pipeline.register_commit_listener(move |identifiers| {
        sink.lock().unwrap().push(identifiers.clone());
    });

    let input: Vec<String> = (1..=5).map(|i| format!("doc-{}", i)).collect();
    for identifier in &input {
        pipeline.add_document(doc(identifier)).unwrap();
    }
    let stats = pipeline.close(true).unwrap();

    let batches = batches.lock().unwrap();
    let sizes: Vec<usize> = batches.iter().map(HashSet::len).collect();
    assert_eq!(sizes, vec![2, 2, 1]);

    let committed: HashSet<String> = batches.iter().flatten().cloned().collect();
    let expected: HashSet<String> = input.into_iter().collect();
    assert_eq!(committed, expected);
    assert_eq!(stats.indexed, 5);
}

#[test]
fn test_reconciliation_deletes_missing_once() {
    let index = MemoryIndex::with_documents(["A", "B", "C"]);
    let mut pipeline = open(&index, &config(100));
    pipeline.sync_mut().enable_deletion_tracking();

    for identifier in ["A", "B"] {
        pipeline.sync_mut().record_seen(identifier);
        pipeline.add_document(doc(identifier)).unwrap();
    }
    let stats = pipeline.close(true).unwrap();

    let state = index.snapshot();
    assert_eq!(state.deletes, vec!["C".to_string()]);
    assert_eq!(stats.reconciled, 1);
    assert!(state.documents.contains_key("A"));
    assert!(state.documents.contains_key("B"));
    assert!(!state.documents.contains_key("C"));
}

#[test]
fn test_cancelled_tracking_deletes_nothing() {
    let index = MemoryIndex::with_documents(["A", "B", "C"]);
    let mut pipeline = open(&index, &config(100));
    pipeline.sync_mut().enable_deletion_tracking();
    pipeline.sync_mut().cancel_deletion_tracking();
    pipeline.sync_mut().enable_deletion_tracking();

    let stats = pipeline.close(true).unwrap();

    assert!(index.snapshot().deletes.is_empty());
    assert_eq!(stats.reconciled, 0);
    assert_eq!(index.snapshot().documents.len(), 3);
}

#[test]
fn test_dirty_close_keeps_cursor_and_index() {
    let before = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let after = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
    let index = MemoryIndex::with_documents(["A", "B"]).with_cursor(before);

    let mut pipeline = open(&index, &config(100));
    assert_eq!(pipeline.sync().cursor().from_reference(), Some(before));
    pipeline.sync_mut().enable_deletion_tracking();
    pipeline.sync_mut().cursor_mut().propose(after);
    pipeline.add_document(doc("A")).unwrap();

    pipeline.close(false).unwrap();

    let state = index.snapshot();
    assert_eq!(state.cursor, Some(before));
    assert_eq!(state.cursor_writes, 0);
    assert!(state.deletes.is_empty());
}

#[test]
fn test_clean_close_persists_cursor() {
    let after = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
    let index = MemoryIndex::new();

    let mut pipeline = open(&index, &config(100));
    pipeline.sync_mut().cursor_mut().propose(after);
    pipeline.add_document(doc("A")).unwrap();
    pipeline.close(true).unwrap();

    let state = index.snapshot();
    assert_eq!(state.cursor, Some(after));
    assert_eq!(state.cursor_writes, 1);
}

#[test]
fn test_index_failure_surfaces_once() {
    let index = MemoryIndex::new();
    index.fail_upserts_of("broken");
    let mut pipeline = open(&index, &config(100));
    pipeline
        .sync_mut()
        .cursor_mut()
        .propose(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());

    pipeline.add_document(doc("broken")).unwrap();

    let mut surfaced = None;
    for _ in 0..500 {
        if let Err(err) = pipeline.check_buffer(Some(Duration::ZERO)) {
            surfaced = Some(err);
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }

    match surfaced {
        Some(PipelineError::BackgroundFailure(WorkerFailure::Index { identifier, .. })) => {
            assert_eq!(identifier, "broken");
        }
        other => panic!("expected index failure, got {:?}", other),
    }

    assert!(matches!(
        pipeline.add_document(doc("next")),
        Err(PipelineError::Aborted)
    ));
    assert!(matches!(pipeline.close(true), Err(PipelineError::Aborted)));

    let state = index.snapshot();
    assert_eq!(state.cursor, None);
    assert!(!state.documents.contains_key("next"));
}

#[test]
fn test_stop_policy_aborts_run() {
    let index = MemoryIndex::new();
    let config = PipelineConfig {
        conversion_error_action: ErrorAction::Stop,
        ..PipelineConfig::default()
    };
    let mut pipeline = open_with(&index, &config, picky_converter());
    pipeline
        .sync_mut()
        .cursor_mut()
        .propose(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());

    pipeline.add_document(doc("bad-1")).unwrap();

    match pipeline.close(true) {
        Err(PipelineError::BackgroundFailure(WorkerFailure::Conversion { identifier, .. })) => {
            assert_eq!(identifier, "bad-1");
        }
        other => panic!("expected conversion failure, got {:?}", other),
    }
    assert_eq!(index.snapshot().cursor_writes, 0);
}

#[test]
fn test_ignore_policy_drops_document() {
    let index = MemoryIndex::with_documents(["bad-1"]);
    let mut pipeline = open_with(&index, &config(100), picky_converter());

    pipeline.add_document(doc("good")).unwrap();
    pipeline.add_document(doc("bad-1")).unwrap();
    let stats = pipeline.close(true).unwrap();

    assert_eq!(stats.indexed, 1);
    assert_eq!(stats.ignored, 1);
    let state = index.snapshot();
    assert!(state.documents.contains_key("good"));
    assert!(state.documents.contains_key("bad-1"));
}

#[test]
fn test_delete_policy_removes_document() {
    let index = MemoryIndex::with_documents(["bad-1"]);
    let config = PipelineConfig {
        conversion_error_action: ErrorAction::Delete,
        ..PipelineConfig::default()
    };
    let mut pipeline = open_with(&index, &config, picky_converter());

    pipeline.add_document(doc("good")).unwrap();
    pipeline.add_document(doc("bad-1")).unwrap();
    let stats = pipeline.close(true).unwrap();

    assert_eq!(stats.indexed, 1);
    assert_eq!(stats.deleted, 1);
    let state = index.snapshot();
    assert!(state.documents.contains_key("good"));
    assert!(!state.documents.contains_key("bad-1"));
}

#[test]
fn test_deleted_records_never_reach_converter() {
    let converted: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = converted.clone();
    let converter = Arc::new(
        move |record: &DocumentRecord, context: &ConvertContext| -> Result<FieldSet, ConvertError> {
            assert!(!record.is_deleted());
            seen.lock().unwrap().push(record.identifier().to_string());
            XmlFieldExtractor.convert(record, context)
        },
    );

    let index = MemoryIndex::with_documents(["gone"]);
    let mut pipeline = open_with(&index, &config(100), converter);

    pipeline.add_document(doc("kept")).unwrap();
    pipeline
        .add_document(DocumentRecord::deleted("gone", None))
        .unwrap();
    let mut filtered = doc("filtered");
    filtered.mark_deleted();
    pipeline.add_document(filtered).unwrap();
    let stats = pipeline.close(true).unwrap();

    assert_eq!(*converted.lock().unwrap(), vec!["kept".to_string()]);
    assert_eq!(stats.deleted, 2);
    assert!(!index.snapshot().documents.contains_key("gone"));
}

#[test]
fn test_repeated_upserts_are_idempotent() {
    let once = MemoryIndex::new();
    let mut pipeline = open(&once, &config(100));
    pipeline.add_document(doc("A")).unwrap();
    pipeline.close(true).unwrap();

    let twice = MemoryIndex::new();
    let mut pipeline = open(&twice, &config(100));
    pipeline.add_document(doc("A")).unwrap();
    pipeline.add_document(doc("A")).unwrap();
    pipeline.close(true).unwrap();

    assert_eq!(once.snapshot().documents, twice.snapshot().documents);
}

#[test]
fn test_operations_on_one_identifier_keep_their_order() {
    let index = MemoryIndex::new();
    let config = PipelineConfig {
        num_converter_threads: 4,
        max_converter_queue: 8,
        bulk_size: 7,
        ..PipelineConfig::default()
    };
    let mut pipeline = open(&index, &config);

    let identifiers: Vec<String> = (0..40).map(|i| format!("doc-{}", i)).collect();
    for identifier in &identifiers {
        pipeline
            .add_document(DocumentRecord::new(identifier.as_str(), None, "<v>first</v>"))
            .unwrap();
        pipeline
            .add_document(DocumentRecord::deleted(identifier.as_str(), None))
            .unwrap();
        pipeline
            .add_document(DocumentRecord::new(identifier.as_str(), None, "<v>last</v>"))
            .unwrap();
    }
    let stats = pipeline.close(true).unwrap();

    assert_eq!(stats.indexed, 80);
    assert_eq!(stats.deleted, 40);
    let state = index.snapshot();
    for identifier in &identifiers {
        let fields = state
            .documents
            .get(identifier)
            .unwrap_or_else(|| panic!("{} missing", identifier));
        assert_eq!(fields["v"], vec!["last".to_string()]);
    }
}

#[test]
fn test_producer_blocks_when_queues_are_full() {
    let gate = Gate::closed();
    let converter_gate = gate.clone();
    let converter = Arc::new(
        move |record: &DocumentRecord, context: &ConvertContext| -> Result<FieldSet, ConvertError> {
            converter_gate.wait();
            XmlFieldExtractor.convert(record, context)
        },
    );

    let config = PipelineConfig {
        max_converter_queue: 4,
        max_indexer_queue: 4,
        ..PipelineConfig::default()
    };
    let index = MemoryIndex::new();
    let mut pipeline = open_with(&index, &config, converter);

    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    let producer = thread::spawn(move || {
        for i in 0..50 {
            pipeline.add_document(doc(&format!("doc-{}", i))).unwrap();
            counter.fetch_add(1, Ordering::SeqCst);
        }
        pipeline
    });

    thread::sleep(Duration::from_millis(300));
    let in_flight = accepted.load(Ordering::SeqCst);
    // queued raw records plus the one held by the blocked converter
    assert!(in_flight <= 4 + 1, "accepted {} records", in_flight);
    assert!(!producer.is_finished());

    gate.release();
    let mut pipeline = producer.join().unwrap();
    let stats = pipeline.close(true).unwrap();

    assert_eq!(accepted.load(Ordering::SeqCst), 50);
    assert_eq!(stats.indexed, 50);
}

/// Pipeline whose index worker is stuck on its first upsert, with a full
/// index queue of 4 behind it
fn stalled_pipeline(index: &MemoryIndex, gate: &Arc<Gate>) -> Pipeline {
    let config = PipelineConfig {
        num_converter_threads: 1,
        max_converter_queue: 8,
        max_indexer_queue: 4,
        ..PipelineConfig::default()
    };
    let mut pipeline = Pipeline::open(
        "test",
        &config,
        Box::new(GatedIndex::new(index, gate)),
        Arc::new(XmlFieldExtractor),
    )
    .expect("Failed to open pipeline");

    for i in 0..8 {
        pipeline.add_document(doc(&format!("doc-{}", i))).unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while pipeline.queue_depths().1 < 4 {
        assert!(Instant::now() < deadline, "index queue never filled up");
        thread::sleep(Duration::from_millis(10));
    }
    pipeline
}

#[test]
fn test_check_buffer_gives_up_after_max_wait() {
    let gate = Gate::closed();
    let index = MemoryIndex::new();
    let mut pipeline = stalled_pipeline(&index, &gate);

    let started = Instant::now();
    pipeline
        .check_buffer(Some(Duration::from_millis(200)))
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(pipeline.queue_depths().1, 4);

    gate.release();
    let stats = pipeline.close(true).unwrap();
    assert_eq!(stats.indexed, 8);
}

#[test]
fn test_check_buffer_waits_until_index_queue_drains() {
    let gate = Gate::closed();
    let index = MemoryIndex::new();
    let mut pipeline = stalled_pipeline(&index, &gate);

    let released = Arc::new(AtomicBool::new(false));
    let opener = {
        let gate = gate.clone();
        let released = released.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            released.store(true, Ordering::SeqCst);
            gate.release();
        })
    };

    // no bound: returns only once the worker got going again
    pipeline.check_buffer(None).unwrap();
    assert!(released.load(Ordering::SeqCst));

    opener.join().unwrap();
    let stats = pipeline.close(true).unwrap();
    assert_eq!(stats.indexed, 8);
    assert_eq!(index.snapshot().documents.len(), 8);
}

#[test]
fn test_check_buffer_returns_at_once_below_threshold() {
    let index = MemoryIndex::new();
    let mut pipeline = open(&index, &PipelineConfig::default());
    pipeline.add_document(doc("a")).unwrap();

    let started = Instant::now();
    pipeline.check_buffer(None).unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    pipeline.close(true).unwrap();
}
