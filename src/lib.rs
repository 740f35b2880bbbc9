//! metaharvest: incremental metadata harvesting into a local index
//!
//! This crate harvests metadata records from OAI-PMH repositories, OAI static
//! repositories and local directories, converts them through a concurrent
//! bounded pipeline and stores them in a SQLite index, tracking an
//! incremental cursor and removing documents that disappeared at the source.

pub mod config;
pub mod document;
pub mod harvester;
pub mod oai;
pub mod pipeline;
pub mod storage;
pub mod sync;
pub mod transport;

use thiserror::Error;

/// Main error type for harvest operations
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("OAI-PMH error: {0}")]
    Oai(#[from] oai::OaiError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] pipeline::PipelineError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No source with id '{0}' is configured")]
    UnknownSource(String),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// Result type alias for harvest operations
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::HarvestConfig;
pub use document::{DocumentRecord, FieldSet, IndexableEntry};
pub use harvester::{build_harvester, run_harvest, Harvester, SourceReport};
pub use pipeline::{DocumentConverter, Pipeline, PipelineError, PipelineStats};
pub use storage::{IndexStore, MemoryIndex, SqliteIndex};
