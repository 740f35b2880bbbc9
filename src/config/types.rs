use crate::pipeline::ErrorAction;
use crate::transport::Backoff;
use serde::Deserialize;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct HarvestConfig {
    pub storage: StorageConfig,
    #[serde(rename = "user-agent")]
    pub user_agent: UserAgentConfig,
    #[serde(rename = "source", default)]
    pub sources: Vec<SourceConfig>,
}

/// Index database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite index database
    #[serde(rename = "database-path")]
    pub database_path: String,
}

/// User agent identification configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UserAgentConfig {
    /// Name of the harvester
    pub name: String,

    /// Version of the harvester
    pub version: String,

    /// URL or email address for harvester-related contact
    pub contact: String,
}

/// Kind of source, selecting the harvester implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum SourceKind {
    #[serde(rename = "oai-pmh", alias = "oai")]
    OaiPmh,
    #[serde(rename = "oai-static", alias = "static")]
    OaiStatic,
    #[serde(rename = "directory")]
    Directory,
}

/// One configured source
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Unique source identifier; scopes documents and cursor in the index
    pub id: String,

    #[serde(rename = "type")]
    pub kind: SourceKind,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    pub oai: Option<OaiConfig>,

    pub directory: Option<DirectoryConfig>,
}

/// Ingestion pipeline tuning
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Log progress every this many harvested documents
    #[serde(
        rename = "harvest-message-step",
        alias = "harvestMessageStep",
        default = "default_harvest_message_step"
    )]
    pub harvest_message_step: usize,

    /// Applied index operations per commit
    #[serde(
        rename = "bulk-size",
        alias = "bulkSize",
        alias = "changesBeforeCommit",
        default = "default_bulk_size"
    )]
    pub bulk_size: usize,

    #[serde(
        rename = "num-converter-threads",
        alias = "numConverterThreads",
        default = "default_converter_threads"
    )]
    pub num_converter_threads: usize,

    /// Raw records held across all converter queues
    #[serde(
        rename = "max-converter-queue",
        alias = "maxQueue",
        alias = "maxConverterQueue",
        default = "default_queue_size"
    )]
    pub max_converter_queue: usize,

    /// Converted entries waiting for the index worker
    #[serde(
        rename = "max-indexer-queue",
        alias = "maxIndexerQueue",
        default = "default_queue_size"
    )]
    pub max_indexer_queue: usize,

    #[serde(
        rename = "conversion-error-action",
        alias = "conversionErrorAction",
        alias = "parseErrorAction",
        default
    )]
    pub conversion_error_action: ErrorAction,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            harvest_message_step: default_harvest_message_step(),
            bulk_size: default_bulk_size(),
            num_converter_threads: default_converter_threads(),
            max_converter_queue: default_queue_size(),
            max_indexer_queue: default_queue_size(),
            conversion_error_action: ErrorAction::default(),
        }
    }
}

/// OAI-PMH (and static repository) settings
#[derive(Debug, Clone, Deserialize)]
pub struct OaiConfig {
    #[serde(rename = "base-url", alias = "baseUrl", alias = "url")]
    pub base_url: String,

    #[serde(rename = "metadata-prefix", alias = "metadataPrefix")]
    pub metadata_prefix: String,

    /// One or more set specs separated by comma, semicolon or whitespace
    #[serde(rename = "set-spec", alias = "setSpec", default)]
    pub set_spec: Option<String>,

    /// Attempts per request before giving up
    #[serde(
        rename = "retry-count",
        alias = "retryCount",
        default = "default_retry_count"
    )]
    pub retry_count: u32,

    /// Default delay between attempts (seconds)
    #[serde(
        rename = "retry-after-seconds",
        alias = "retryAfterSeconds",
        default = "default_retry_after_seconds"
    )]
    pub retry_after_seconds: u64,

    #[serde(rename = "retry-backoff", alias = "retryBackoff", default)]
    pub retry_backoff: Backoff,

    #[serde(
        rename = "timeout-after-seconds",
        alias = "timeoutAfterSeconds",
        default = "default_timeout_after_seconds"
    )]
    pub timeout_after_seconds: u64,

    /// Prepended to every harvested identifier
    #[serde(rename = "identifier-prefix", alias = "identifierPrefix", default)]
    pub identifier_prefix: String,

    /// Always run full harvests, never send `from`
    #[serde(rename = "ignore-datestamps", alias = "ignoreDatestamps", default)]
    pub ignore_datestamps: bool,

    #[serde(
        rename = "delete-missing-documents",
        alias = "deleteMissingDocuments",
        default = "default_true"
    )]
    pub delete_missing_documents: bool,

    /// Sent verbatim as the `Authorization` header
    #[serde(
        rename = "authorization-header",
        alias = "authorizationHeader",
        default
    )]
    pub authorization_header: Option<String>,
}

impl OaiConfig {
    /// Settings for `base_url` with every optional key at its default
    pub fn new(base_url: impl Into<String>, metadata_prefix: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            metadata_prefix: metadata_prefix.into(),
            set_spec: None,
            retry_count: default_retry_count(),
            retry_after_seconds: default_retry_after_seconds(),
            retry_backoff: Backoff::default(),
            timeout_after_seconds: default_timeout_after_seconds(),
            identifier_prefix: String::new(),
            ignore_datestamps: false,
            delete_missing_documents: true,
            authorization_header: None,
        }
    }

    /// Configured sets, split on comma, semicolon and whitespace
    pub fn sets(&self) -> Vec<String> {
        let mut sets: Vec<String> = self
            .set_spec
            .as_deref()
            .unwrap_or("")
            .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        sets.sort();
        sets.dedup();
        sets
    }
}

/// Local directory settings
#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
    pub path: String,

    #[serde(default = "default_true")]
    pub recursive: bool,

    /// Only files with this extension are harvested
    #[serde(default = "default_extension")]
    pub extension: String,

    #[serde(rename = "identifier-prefix", alias = "identifierPrefix", default)]
    pub identifier_prefix: String,

    #[serde(
        rename = "delete-missing-documents",
        alias = "deleteMissingDocuments",
        default = "default_true"
    )]
    pub delete_missing_documents: bool,

    #[serde(rename = "ignore-datestamps", alias = "ignoreDatestamps", default)]
    pub ignore_datestamps: bool,
}

impl DirectoryConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            recursive: true,
            extension: default_extension(),
            identifier_prefix: String::new(),
            delete_missing_documents: true,
            ignore_datestamps: false,
        }
    }
}

fn default_harvest_message_step() -> usize {
    100
}

fn default_bulk_size() -> usize {
    100
}

fn default_converter_threads() -> usize {
    1
}

fn default_queue_size() -> usize {
    250
}

fn default_retry_count() -> u32 {
    5
}

fn default_retry_after_seconds() -> u64 {
    60
}

fn default_timeout_after_seconds() -> u64 {
    180
}

fn default_extension() -> String {
    "xml".to_string()
}

fn default_true() -> bool {
    true
}
