use crate::transport::retry::RetryableError;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while fetching a resource
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered HTTP {status}")]
    Status {
        url: String,
        status: u16,
        retry_after: Option<Duration>,
    },

    #[error("{url} answered 304 Not Modified to an unconditional request")]
    UnexpectedNotModified { url: String },

    #[error("{url} sent unsupported Content-Encoding '{encoding}'")]
    UnsupportedEncoding { url: String, encoding: String },
}

impl TransportError {
    /// Network failures and 5xx answers may succeed on another attempt
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Request { source, .. } => !source.is_builder(),
            TransportError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Delay announced through `Retry-After` on a 503 answer
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TransportError::Status {
                status: 503,
                retry_after,
                ..
            } => *retry_after,
            _ => None,
        }
    }
}

impl RetryableError for TransportError {
    fn is_transient(&self) -> bool {
        TransportError::is_transient(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        TransportError::retry_after(self)
    }
}
