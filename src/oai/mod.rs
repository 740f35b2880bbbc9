//! OAI-PMH harvesting
//!
//! [`OaiHarvester`] walks a `ListRecords` listing page by page;
//! [`StaticRepositoryHarvester`] reads a static repository document with a
//! single conditional request. Both parse responses with a fresh
//! [`PageParser`] for every attempt.

mod charset;
mod dates;
mod harvester;
mod parser;
mod static_repo;

pub use charset::HintedSource;
pub use dates::{parse_datestamp, Granularity};
pub use harvester::OaiHarvester;
pub use parser::{
    parse_response, parse_static_repository, ListingScope, OaiRecord, PageParser, PageSummary,
    RecordHeader, ResumptionToken, OAI_NAMESPACE, STATIC_REPOSITORY_NAMESPACE,
};
pub use static_repo::StaticRepositoryHarvester;

use crate::document::DocumentRecord;
use crate::pipeline::PipelineError;
use crate::transport::{RetryableError, TransportError};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while harvesting an OAI source
#[derive(Debug, Error)]
pub enum OaiError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("I/O error while reading response: {0}")]
    Io(#[from] std::io::Error),

    #[error("OAI-PMH error {code}: {message}")]
    Protocol { code: String, message: String },

    #[error("Server returned resumption token {0:?} twice in a row")]
    RepeatedToken(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Truncated response: {0}")]
    Truncated(&'static str),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("Invalid request URL: {0}")]
    Url(#[from] url::ParseError),
}

pub type OaiResult<T> = std::result::Result<T, OaiError>;

impl OaiError {
    /// Broken or truncated responses are retried like network failures
    pub fn is_transient(&self) -> bool {
        match self {
            OaiError::Transport(e) => e.is_transient(),
            OaiError::Xml(_) | OaiError::Io(_) | OaiError::Truncated(_) => true,
            _ => false,
        }
    }
}

impl RetryableError for OaiError {
    fn is_transient(&self) -> bool {
        OaiError::is_transient(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            OaiError::Transport(e) => e.retry_after(),
            _ => None,
        }
    }
}

/// Turns a parsed record into a pipeline record
///
/// With more than one configured set, records outside all of them are marked
/// deleted so stale index entries get removed.
pub(crate) fn to_document(record: OaiRecord, prefix: &str, sets: &[String]) -> DocumentRecord {
    let OaiRecord { header, metadata } = record;
    let identifier = format!("{}{}", prefix, header.identifier);

    let mut document = if header.deleted {
        DocumentRecord::deleted(identifier, header.datestamp)
    } else {
        match metadata {
            Some(payload) => DocumentRecord::new(identifier, header.datestamp, payload),
            None => DocumentRecord::without_payload(identifier, header.datestamp),
        }
    };

    if sets.len() > 1 && !header.sets.iter().any(|set| sets.contains(set)) {
        document.mark_deleted();
    }
    document
}
