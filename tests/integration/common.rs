//! Helpers shared by the integration tests

use chrono::{DateTime, Utc};
use metaharvest::config::UserAgentConfig;
use metaharvest::document::FieldSet;
use metaharvest::storage::{IndexStore, MemoryIndex, StorageResult};
use std::sync::{Arc, Condvar, Mutex};
use tokio::runtime::Runtime;

/// Runtime for the mock HTTP servers; harvests run on the test thread
pub fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("Failed to build runtime")
}

pub fn user_agent() -> UserAgentConfig {
    UserAgentConfig {
        name: "TestHarvester".to_string(),
        version: "1.0.0".to_string(),
        contact: "test@example.com".to_string(),
    }
}

/// Blocks callers of `wait` until opened
pub struct Gate {
    open: Mutex<bool>,
    signal: Condvar,
}

impl Gate {
    pub fn closed() -> Arc<Self> {
        Arc::new(Self {
            open: Mutex::new(false),
            signal: Condvar::new(),
        })
    }

    pub fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.signal.wait(open).unwrap();
        }
    }

    pub fn release(&self) {
        *self.open.lock().unwrap() = true;
        self.signal.notify_all();
    }
}

/// Memory index whose upserts wait for a gate, stalling the index worker
pub struct GatedIndex {
    inner: MemoryIndex,
    gate: Arc<Gate>,
}

impl GatedIndex {
    pub fn new(inner: &MemoryIndex, gate: &Arc<Gate>) -> Self {
        Self {
            inner: inner.clone(),
            gate: gate.clone(),
        }
    }
}

impl IndexStore for GatedIndex {
    fn upsert(&mut self, identifier: &str, fields: &FieldSet) -> StorageResult<()> {
        self.gate.wait();
        self.inner.upsert(identifier, fields)
    }

    fn delete(&mut self, identifier: &str) -> StorageResult<()> {
        self.inner.delete(identifier)
    }

    fn commit(&mut self) -> StorageResult<()> {
        self.inner.commit()
    }

    fn scan_identifiers(&self, visit: &mut dyn FnMut(&str)) -> StorageResult<()> {
        self.inner.scan_identifiers(visit)
    }

    fn cursor(&self) -> StorageResult<Option<DateTime<Utc>>> {
        self.inner.cursor()
    }

    fn set_cursor(&mut self, cursor: DateTime<Utc>) -> StorageResult<()> {
        self.inner.set_cursor(cursor)
    }
}
